//! # Effects Analysis
//!
//! The typing overlay the rest of the pipeline consumes. Given a type-checked
//! program it
//!
//! 1. validates every `perform` against the effect table and every handler
//!    against the effect it handles,
//! 2. computes the effect row of every function: declared rows are taken as
//!    written, undeclared rows are inferred by fixpoint iteration over the
//!    call graph, and
//! 3. classifies every call-like expression as a perform, an effectful call
//!    or a pure call.
//!
//! ## Composition
//!
//! ```text
//! row(e1; e2)            = row(e1) ∪ row(e2)
//! row(f::<T>(args))      = row(f)[T] ∪ row(args)
//! row(perform E.op(a))   = {E} ∪ row(a)
//! row(handle b with E)   = (row(b) - {E}) ∪ row(clauses)
//! row(resume(k, v))      = residual row of the handled body ∪ row(v)
//! ```
//!
//! A `tail` operation's continuation call has an empty row: the clause runs
//! in place and the call just hands the value back.
//!
//! A function is effectful exactly when its final row is non-empty. That
//! property, not syntax, decides which expressions become continuation sites.

use std::collections::{BTreeMap, HashMap};

use super::handler::check_tail_clause;
use super::row::{EffectRef, EffectRow};
use super::table::{EffectTable, OpId};
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::hir::{DefId, Expr, ExprId, ExprKind, FnDecl, LocalId, Program, ResumeKind, SymbolTypes};

/// Classification of a call-like expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallClass {
    /// A direct `perform` of a resolved operation.
    Perform { effect: EffectRef, op: OpId },
    /// A call (or `handle`, or continuation call) whose row is non-empty.
    EffectfulCall,
    /// A call whose row is empty.
    PureCall,
}

impl CallClass {
    /// Whether the expression becomes a continuation site.
    pub fn is_site(&self) -> bool {
        !matches!(self, CallClass::PureCall)
    }
}

/// Analysis results for one function.
#[derive(Debug, Clone, Default)]
pub struct FunctionEffects {
    pub row: EffectRow,
    pub calls: BTreeMap<ExprId, CallClass>,
}

impl FunctionEffects {
    pub fn is_effectful(&self) -> bool {
        !self.row.is_empty()
    }
}

/// The effects overlay of a whole program.
#[derive(Debug, Clone, Default)]
pub struct EffectsIr {
    pub functions: BTreeMap<DefId, FunctionEffects>,
    /// Non-fatal findings.
    pub warnings: Vec<Diagnostic>,
}

impl EffectsIr {
    pub fn function(&self, def_id: DefId) -> Option<&FunctionEffects> {
        self.functions.get(&def_id)
    }

    /// The row of `def_id`, empty for unknown symbols.
    pub fn row(&self, def_id: DefId) -> EffectRow {
        self.functions.get(&def_id).map(|f| f.row.clone()).unwrap_or_default()
    }

    pub fn is_effectful(&self, def_id: DefId) -> bool {
        self.functions.get(&def_id).is_some_and(FunctionEffects::is_effectful)
    }

    pub fn classify(&self, def_id: DefId, expr: ExprId) -> Option<&CallClass> {
        self.functions.get(&def_id)?.calls.get(&expr)
    }
}

/// Run the analysis. Errors abort before any lowering happens.
pub fn analyze_program(program: &Program, table: &EffectTable) -> Result<EffectsIr, Vec<Diagnostic>> {
    let mut analysis = EffectAnalysis::new(program, table);
    analysis.validate();
    if analysis.has_errors() {
        return Err(analysis.diagnostics);
    }
    analysis.solve_rows();
    analysis.check_declared_rows();
    if analysis.has_errors() {
        return Err(analysis.diagnostics);
    }
    Ok(analysis.finish())
}

/// Working state of the analysis.
pub struct EffectAnalysis<'a> {
    program: &'a Program,
    table: &'a EffectTable,
    rows: BTreeMap<DefId, EffectRow>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> EffectAnalysis<'a> {
    pub fn new(program: &'a Program, table: &'a EffectTable) -> Self {
        let rows = program
            .functions
            .iter()
            .map(|(id, f)| (*id, f.declared_effects.clone().unwrap_or_default()))
            .collect();
        Self {
            program,
            table,
            rows,
            diagnostics: Vec::new(),
        }
    }

    fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn validate(&mut self) {
        let program = self.program;
        for f in program.functions.values() {
            if f.export.is_some() && f.generics > 0 {
                self.diagnostics.push(
                    Diagnostic::error(format!("exported function `{}` cannot be generic", f.name), f.span)
                        .with_error_code(ErrorCode::GenericExport),
                );
            }
            self.validate_expr(f, &f.body);
        }
    }

    fn validate_expr(&mut self, f: &FnDecl, e: &Expr) {
        match &e.kind {
            ExprKind::Perform {
                effect,
                type_args,
                op,
                args,
            } => self.validate_perform(e, *effect, type_args, *op, args),
            ExprKind::Handle { handler, .. } => {
                let Some(entry) = self.table.effect(handler.effect) else {
                    self.no_match(e, format!("no effect declaration for handled effect {}", handler.effect));
                    return;
                };
                for (index, operation) in entry.ops.iter().enumerate() {
                    match handler.clause(index as u32) {
                        None => self.diagnostics.push(
                            Diagnostic::error(
                                format!(
                                    "handler for `{}` is missing a clause for operation `{}`",
                                    entry.name, operation.name
                                ),
                                e.span,
                            )
                            .with_error_code(ErrorCode::MissingHandlerClause),
                        ),
                        Some(clause) => {
                            if clause.params.len() != operation.params.len() {
                                self.no_match(
                                    e,
                                    format!(
                                        "clause for `{}.{}` binds {} parameters but the operation takes {}",
                                        entry.name,
                                        operation.name,
                                        clause.params.len(),
                                        operation.params.len()
                                    ),
                                );
                            }
                            if operation.resume_kind == ResumeKind::Tail {
                                let label = format!("{}.{}", entry.name, operation.name);
                                self.diagnostics.extend(check_tail_clause(clause, &label));
                            }
                        }
                    }
                }
                for clause in &handler.clauses {
                    if entry.operation(clause.op).is_none() {
                        self.no_match(e, format!("effect `{}` has no operation #{}", entry.name, clause.op));
                    }
                }
            }
            ExprKind::Call { callee, args, .. } => match self.program.signature(*callee) {
                Some(sig) if sig.params.len() == args.len() => {}
                Some(sig) => self.diagnostics.push(Diagnostic::ice(
                    format!(
                        "call to `{}` in `{}` passes {} arguments for {} parameters",
                        self.program.symbol_name(*callee).unwrap_or("?"),
                        f.name,
                        args.len(),
                        sig.params.len()
                    ),
                    e.span,
                )),
                None => self
                    .diagnostics
                    .push(Diagnostic::ice(format!("call target {} has no signature", callee), e.span)),
            },
            _ => {}
        }
        for child in e.children() {
            self.validate_expr(f, child);
        }
    }

    fn validate_perform(&mut self, e: &Expr, effect: DefId, type_args: &[crate::hir::Type], op: u32, args: &[Expr]) {
        let Some(entry) = self.table.effect(effect) else {
            self.no_match(e, format!("no effect declaration for {} in scope", effect));
            return;
        };
        let Some(operation) = entry.operation(op) else {
            self.no_match(e, format!("effect `{}` has no operation #{}", entry.name, op));
            return;
        };
        let label = format!("{}.{}", entry.name, operation.name);
        if type_args.len() != entry.generics as usize {
            self.no_match(
                e,
                format!(
                    "`{}` expects {} type arguments, found {}",
                    entry.name,
                    entry.generics,
                    type_args.len()
                ),
            );
            return;
        }
        if args.len() != operation.params.len() {
            self.no_match(
                e,
                format!(
                    "`{}` takes {} arguments but {} were supplied",
                    label,
                    operation.params.len(),
                    args.len()
                ),
            );
            return;
        }
        for (i, (arg, param)) in args.iter().zip(&operation.params).enumerate() {
            let expected = param.substitute(type_args);
            if arg.ty != expected {
                self.no_match(
                    arg,
                    format!(
                        "argument {} of `{}` has type `{}`, expected `{}`",
                        i,
                        label,
                        self.program.type_name(&arg.ty),
                        self.program.type_name(&expected)
                    ),
                );
            }
        }
        let ret = operation.ret.substitute(type_args);
        if e.ty != ret {
            self.no_match(
                e,
                format!(
                    "`{}` returns `{}`, but the perform is typed `{}`",
                    label,
                    self.program.type_name(&ret),
                    self.program.type_name(&e.ty)
                ),
            );
        }
    }

    fn no_match(&mut self, e: &Expr, message: String) {
        self.diagnostics
            .push(Diagnostic::error(message, e.span).with_error_code(ErrorCode::NoMatchingOperation));
    }

    // ========================================================================
    // Rows
    // ========================================================================

    fn solve_rows(&mut self) {
        let program = self.program;
        let mut iteration = 0;
        loop {
            iteration += 1;
            let mut changed = false;
            for f in program.functions.values() {
                if f.declared_effects.is_some() {
                    continue;
                }
                let mut scratch = BTreeMap::new();
                let row = self.visit(&f.body, &mut HashMap::new(), &mut scratch);
                let slot = self.rows.entry(f.def_id).or_default();
                if slot.absorb(&row) {
                    changed = true;
                }
            }
            tracing::debug!(iteration, changed, "effect row fixpoint");
            if !changed {
                break;
            }
        }
    }

    fn check_declared_rows(&mut self) {
        let program = self.program;
        for f in program.functions.values() {
            let Some(declared) = &f.declared_effects else {
                continue;
            };
            let mut scratch = BTreeMap::new();
            let body_row = self.visit(&f.body, &mut HashMap::new(), &mut scratch);
            for missing in body_row.missing_from(declared) {
                let name = program.effect_name(missing.effect, &missing.type_args);
                self.diagnostics.push(
                    Diagnostic::error(
                        format!("function `{}` performs `{}` but its signature does not declare it", f.name, name),
                        f.span,
                    )
                    .with_error_code(ErrorCode::UndeclaredEffect),
                );
            }
        }
    }

    fn finish(self) -> EffectsIr {
        let mut functions = BTreeMap::new();
        for f in self.program.functions.values() {
            let mut calls = BTreeMap::new();
            self.visit(&f.body, &mut HashMap::new(), &mut calls);
            let row = self.rows.get(&f.def_id).cloned().unwrap_or_default();
            tracing::debug!(function = %f.name, row = %row, sites = calls.values().filter(|c| c.is_site()).count(), "effects analyzed");
            functions.insert(f.def_id, FunctionEffects { row, calls });
        }
        let warnings = self.diagnostics;
        EffectsIr { functions, warnings }
    }

    /// Row of the callee's declared-or-inferred signature at this
    /// instantiation.
    fn callee_row(&self, callee: DefId, type_args: &[crate::hir::Type]) -> EffectRow {
        self.rows
            .get(&callee)
            .map(|r| r.substitute(type_args))
            .unwrap_or_default()
    }

    /// Compute the row of `e`, recording call classifications.
    ///
    /// `conts` maps each in-scope continuation parameter to the row its
    /// invocation carries.
    fn visit(
        &self,
        e: &Expr,
        conts: &mut HashMap<LocalId, EffectRow>,
        calls: &mut BTreeMap<ExprId, CallClass>,
    ) -> EffectRow {
        let mut row = EffectRow::empty();
        match &e.kind {
            ExprKind::Perform {
                effect,
                type_args,
                op,
                args,
            } => {
                let instance = EffectRef::new(*effect, type_args.clone());
                row.insert(instance.clone());
                for arg in args {
                    row.absorb(&self.visit(arg, conts, calls));
                }
                calls.insert(
                    e.id,
                    CallClass::Perform {
                        effect: instance,
                        op: OpId(*op),
                    },
                );
            }
            ExprKind::Call {
                callee,
                type_args,
                args,
            } => {
                for arg in args {
                    row.absorb(&self.visit(arg, conts, calls));
                }
                let callee_row = self.callee_row(*callee, type_args);
                calls.insert(e.id, classify_row(&callee_row));
                row.absorb(&callee_row);
            }
            ExprKind::Handle { body, handler } => {
                let handled = EffectRef::new(handler.effect, handler.type_args.clone());
                let residual = self.visit(body, conts, calls).without(&handled);
                row.absorb(&residual);
                for clause in &handler.clauses {
                    let kind = self
                        .table
                        .operation(handler.effect, clause.op)
                        .map(|o| o.resume_kind)
                        .unwrap_or_default();
                    let cont_row = match kind {
                        ResumeKind::Tail => EffectRow::empty(),
                        ResumeKind::Resume => residual.clone(),
                    };
                    conts.insert(clause.cont, cont_row);
                    row.absorb(&self.visit(&clause.body, conts, calls));
                }
                calls.insert(e.id, classify_row(&row));
            }
            ExprKind::Resume { cont, value, .. } => {
                row.absorb(&self.visit(value, conts, calls));
                let cont_row = conts.get(cont).cloned().unwrap_or_default();
                calls.insert(e.id, classify_row(&cont_row));
                row.absorb(&cont_row);
            }
            _ => {
                for child in e.children() {
                    row.absorb(&self.visit(child, conts, calls));
                }
            }
        }
        row
    }
}

fn classify_row(row: &EffectRow) -> CallClass {
    if row.is_empty() {
        CallClass::PureCall
    } else {
        CallClass::EffectfulCall
    }
}
