//! Builders for functions and modules.
//!
//! [`FunctionBuilder`] hands out registers above a fixed base and resolves
//! labels to absolute instruction indices when the function is finished. It
//! is `Clone` so one compiled body can be finished several times with
//! different entry code.

use std::collections::HashMap;

use thiserror::Error;

use super::{
    DataSegment, Export, FuncIdx, Function, Global, GlobalIdx, GlobalInit, Import, ImportIdx,
    Instr, Module, Reg, TypeDef, TypeIdx, ValType,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("label {0} was referenced but never placed")]
    UnresolvedLabel(u32),
    #[error("function `{name}` has {params} parameters but its registers start at {base}")]
    ParamsExceedBase { name: String, params: usize, base: u32 },
    #[error("function #{0} was declared but never defined")]
    MissingFunctionBody(FuncIdx),
    #[error("invalid function index {0}")]
    BadFuncIdx(FuncIdx),
    #[error("type #{0} is not a struct")]
    NotAStruct(TypeIdx),
}

/// A control-flow target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    base: u32,
    regs: Vec<ValType>,
    code: Vec<Instr>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl FunctionBuilder {
    /// Registers below `base` are reserved for parameters.
    pub fn new(base: u32) -> Self {
        Self {
            base,
            regs: Vec::new(),
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Allocate a fresh register.
    pub fn reg(&mut self, ty: ValType) -> Reg {
        self.regs.push(ty);
        self.base + self.regs.len() as u32 - 1
    }

    /// Type of an allocated register; `None` for parameter registers.
    pub fn reg_type(&self, reg: Reg) -> Option<ValType> {
        reg.checked_sub(self.base)
            .and_then(|i| self.regs.get(i as usize).copied())
    }

    /// Index of the next instruction.
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit(&mut self, instr: Instr) {
        self.code.push(instr);
    }

    /// Replace an already emitted instruction.
    pub fn patch(&mut self, at: u32, instr: Instr) {
        if let Some(slot) = self.code.get_mut(at as usize) {
            *slot = instr;
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Place `label` at the next instruction.
    pub fn bind(&mut self, label: Label) {
        let here = self.here();
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(here);
        }
    }

    fn branch(&mut self, instr: Instr, label: Label) {
        self.fixups.push((self.code.len(), label));
        self.code.push(instr);
    }

    pub fn jump(&mut self, label: Label) {
        self.branch(Instr::Jump { target: 0 }, label);
    }

    pub fn branch_if(&mut self, cond: Reg, label: Label) {
        self.branch(Instr::BranchIf { cond, target: 0 }, label);
    }

    pub fn branch_if_not(&mut self, cond: Reg, label: Label) {
        self.branch(Instr::BranchIfNot { cond, target: 0 }, label);
    }

    // Small emission helpers used throughout codegen.

    pub fn i32_const(&mut self, value: i32) -> Reg {
        let dst = self.reg(ValType::I32);
        self.emit(Instr::I32Const { dst, value });
        dst
    }

    pub fn i64_const(&mut self, value: i64) -> Reg {
        let dst = self.reg(ValType::I64);
        self.emit(Instr::I64Const { dst, value });
        dst
    }

    pub fn null(&mut self) -> Reg {
        let dst = self.reg(ValType::AnyRef);
        self.emit(Instr::RefNull { dst });
        dst
    }

    pub fn cast(&mut self, src: Reg, ty: TypeIdx) -> Reg {
        let dst = self.reg(ValType::Ref(ty));
        self.emit(Instr::RefCast { dst, src, ty });
        dst
    }

    pub fn get(&mut self, obj: Reg, ty: TypeIdx, field: u32, val: ValType) -> Reg {
        let dst = self.reg(val);
        self.emit(Instr::StructGet { dst, obj, ty, field });
        dst
    }

    pub fn new_struct(&mut self, ty: TypeIdx, fields: Vec<Reg>) -> Reg {
        let dst = self.reg(ValType::AnyRef);
        self.emit(Instr::StructNew { dst, ty, fields });
        dst
    }

    pub fn call(&mut self, func: FuncIdx, args: Vec<Reg>, result: ValType) -> Reg {
        let dst = self.reg(result);
        self.emit(Instr::Call {
            dst: Some(dst),
            func,
            args,
        });
        dst
    }

    pub fn ret(&mut self, value: Reg) {
        self.emit(Instr::Return { value: Some(value) });
    }

    /// Resolve labels and produce the function. `params` fill the registers
    /// below the base; unused reserved registers become `i32`.
    pub fn finish(self, name: impl Into<String>, ty: TypeIdx, params: &[ValType]) -> Result<Function, BuildError> {
        let name = name.into();
        if params.len() > self.base as usize {
            return Err(BuildError::ParamsExceedBase {
                name,
                params: params.len(),
                base: self.base,
            });
        }
        let mut code = self.code;
        for (at, label) in self.fixups {
            let target = self
                .labels
                .get(label.0 as usize)
                .copied()
                .flatten()
                .ok_or(BuildError::UnresolvedLabel(label.0))?;
            code[at].set_target(target);
        }
        let mut regs = params.to_vec();
        regs.resize(self.base as usize, ValType::I32);
        regs.extend(self.regs);
        Ok(Function { name, ty, regs, code })
    }
}

/// Assembles a [`Module`]. Functions may be reserved before they are
/// defined so that mutually recursive code can reference them.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    module: Module,
    func_types: HashMap<(Vec<ValType>, Vec<ValType>), TypeIdx>,
    defined: Vec<bool>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_struct(&mut self, name: impl Into<String>, fields: Vec<ValType>) -> TypeIdx {
        self.module.types.push(TypeDef::Struct {
            name: name.into(),
            fields,
        });
        self.module.types.len() as TypeIdx - 1
    }

    /// Fill in the fields of a struct added early, e.g. a recursive one.
    pub fn set_struct_fields(&mut self, ty: TypeIdx, fields: Vec<ValType>) -> Result<(), BuildError> {
        match self.module.types.get_mut(ty as usize) {
            Some(TypeDef::Struct { fields: slot, .. }) => {
                *slot = fields;
                Ok(())
            }
            _ => Err(BuildError::NotAStruct(ty)),
        }
    }

    pub fn add_array(&mut self, name: impl Into<String>, elem: ValType) -> TypeIdx {
        self.module.types.push(TypeDef::Array {
            name: name.into(),
            elem,
        });
        self.module.types.len() as TypeIdx - 1
    }

    /// A function type, shared between identical signatures.
    pub fn func_type(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> TypeIdx {
        if let Some(idx) = self.func_types.get(&(params.clone(), results.clone())) {
            return *idx;
        }
        self.module.types.push(TypeDef::Func {
            params: params.clone(),
            results: results.clone(),
        });
        let idx = self.module.types.len() as TypeIdx - 1;
        self.func_types.insert((params, results), idx);
        idx
    }

    pub fn import(&mut self, module: &str, name: &str, params: Vec<ValType>, results: Vec<ValType>) -> ImportIdx {
        let ty = self.func_type(params, results);
        self.module.imports.push(Import {
            module: module.to_string(),
            name: name.to_string(),
            ty,
        });
        self.module.imports.len() as ImportIdx - 1
    }

    /// Reserve an index for a function defined later.
    pub fn reserve_function(&mut self, name: impl Into<String>) -> FuncIdx {
        self.module.functions.push(Function {
            name: name.into(),
            ty: 0,
            regs: Vec::new(),
            code: Vec::new(),
        });
        self.defined.push(false);
        self.module.functions.len() as FuncIdx - 1
    }

    pub fn define_function(&mut self, idx: FuncIdx, function: Function) -> Result<(), BuildError> {
        let slot = self
            .module
            .functions
            .get_mut(idx as usize)
            .ok_or(BuildError::BadFuncIdx(idx))?;
        *slot = function;
        self.defined[idx as usize] = true;
        Ok(())
    }

    pub fn function_name(&self, idx: FuncIdx) -> Option<&str> {
        self.module.functions.get(idx as usize).map(|f| f.name.as_str())
    }

    pub fn add_global(&mut self, name: &str, ty: ValType, init: GlobalInit) -> GlobalIdx {
        self.module.globals.push(Global {
            name: name.to_string(),
            ty,
            mutable: true,
            init,
        });
        self.module.globals.len() as GlobalIdx - 1
    }

    pub fn set_global_init(&mut self, global: GlobalIdx, init: GlobalInit) {
        if let Some(g) = self.module.globals.get_mut(global as usize) {
            g.init = init;
        }
    }

    pub fn export(&mut self, name: impl Into<String>, func: FuncIdx) {
        self.module.exports.push(Export {
            name: name.into(),
            func,
        });
    }

    pub fn data(&mut self, offset: u32, bytes: Vec<u8>) {
        self.module.data.push(DataSegment { offset, bytes });
    }

    pub fn custom(&mut self, name: &str, bytes: Vec<u8>) {
        self.module.custom.push(super::CustomSection {
            name: name.to_string(),
            bytes,
        });
    }

    pub fn set_memory_size(&mut self, bytes: u32) {
        self.module.memory_size = bytes;
    }

    pub fn finish(self) -> Result<Module, BuildError> {
        if let Some(missing) = self.defined.iter().position(|d| !d) {
            return Err(BuildError::MissingFunctionBody(missing as FuncIdx));
        }
        Ok(self.module)
    }
}
