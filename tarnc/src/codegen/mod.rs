//! Code generation for Tarn.
//!
//! This module lowers an analyzed program to a GC target module using the
//! trampoline strategy: every continuation site becomes a split point with
//! its own continuation function and environment struct.
//!
//! # Architecture
//!
//! ```text
//! Program -> EffectTable -> EffectsIr -> FunctionEir (per instance)
//!         -> CodegenContext -> Module + ProtocolTable
//! ```
//!
//! Instances are compiled on demand, starting from the exported functions
//! and every non-generic function; generic functions are compiled once per
//! distinct list of concrete type arguments reached from those roots.

pub mod context;
pub mod runtime;

pub use context::{CodegenContext, SupportSymbol};

use crate::config::CompileOptions;
use crate::diagnostics::Diagnostic;
use crate::effects::{analyze_program, EffectTable};
use crate::hir::Program;
use crate::protocol::ProtocolTable;
use crate::target::{self, Module};

/// The output of one compilation.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub module: Module,
    pub protocol: ProtocolTable,
    /// Non-fatal diagnostics from the analysis.
    pub warnings: Vec<Diagnostic>,
}

impl CompiledModule {
    /// The binary encoding of the module.
    pub fn to_bytes(&self) -> Vec<u8> {
        target::encode(&self.module)
    }
}

/// Analyze and compile a whole program.
pub fn compile_program(program: &Program, options: &CompileOptions) -> Result<CompiledModule, Vec<Diagnostic>> {
    let table = EffectTable::build(program);
    let effects = analyze_program(program, &table)?;
    tracing::debug!(
        module = %program.module_path,
        effects = table.len(),
        functions = effects.functions.len(),
        "analysis complete"
    );

    let mut cx = CodegenContext::new(program, &table, &effects, options);
    cx.compile_exports()?;
    for f in program.functions.values() {
        if f.generics == 0 {
            cx.instance(f.def_id, Vec::new());
        }
    }
    let (module, protocol) = cx.finish()?;
    Ok(CompiledModule {
        module,
        protocol,
        warnings: effects.warnings.clone(),
    })
}
