//! Type lowering for the GC trampoline.
//!
//! Source values live in registers of three shapes: 32-bit words (`()`,
//! `bool`, `i32`, `u32`), 64-bit words (`i64`) and references (structs and
//! continuations). Across a continuation boundary every value travels in the
//! uniform pair `(value: i64, ref_value: anyref)`.

use crate::diagnostics::Diagnostic;
use crate::hir::{Literal, Type};
use crate::protocol::PayloadKind;
use crate::span::Span;
use crate::target::{FunctionBuilder, Instr, ModuleBuilder, Reg, TypeIdx, UnaryOp, ValType};

use super::CodegenContext;

/// The support types every module declares.
#[derive(Debug, Clone, Copy)]
pub struct SupportLayout {
    pub effect_result: TypeIdx,
    pub request: TypeIdx,
    pub cont: TypeIdx,
    pub frame: TypeIdx,
    /// Array of clause function references.
    pub clause_array: TypeIdx,
    pub hcont: TypeIdx,
    pub export_cont: TypeIdx,
    /// `(env: anyref, value: i64, ref_value: anyref) -> anyref`
    pub cont_fn: TypeIdx,
    /// `(env: anyref, args: anyref, k: anyref) -> anyref`
    pub clause_fn: TypeIdx,
    /// `(result: anyref) -> anyref`
    pub settle_fn: TypeIdx,
}

impl SupportLayout {
    pub fn declare(module: &mut ModuleBuilder) -> Self {
        use ValType::{AnyRef, FuncRef, I32, I64};
        Self {
            effect_result: module.add_struct("$EffectResult", vec![I32, I64, AnyRef, AnyRef, AnyRef, I32]),
            request: module.add_struct("$Request", vec![I32, AnyRef, AnyRef]),
            cont: module.add_struct("$Cont", vec![FuncRef, AnyRef]),
            frame: module.add_struct("$Frame", vec![AnyRef, I32, I32, I32, AnyRef, AnyRef]),
            clause_array: module.add_array("$Clauses", FuncRef),
            hcont: module.add_struct("$HCont", vec![AnyRef, AnyRef, I32, I32, I32, I32, I32]),
            export_cont: module.add_struct("$ExportCont", vec![AnyRef, FuncRef, I32]),
            cont_fn: module.func_type(vec![AnyRef, I64, AnyRef], vec![AnyRef]),
            clause_fn: module.func_type(vec![AnyRef, AnyRef, AnyRef], vec![AnyRef]),
            settle_fn: module.func_type(vec![AnyRef], vec![AnyRef]),
        }
    }
}

impl<'a> CodegenContext<'a> {
    /// Register type of a concrete source type.
    pub fn val_type(&mut self, ty: &Type) -> Result<ValType, Diagnostic> {
        match ty {
            Type::Unit | Type::Bool | Type::I32 | Type::U32 => Ok(ValType::I32),
            Type::I64 => Ok(ValType::I64),
            Type::Struct { .. } | Type::Cont { .. } => Ok(ValType::AnyRef),
            Type::Param(_) => Err(Diagnostic::ice(
                format!("generic type `{}` reached code generation", ty),
                Span::dummy(),
            )),
        }
    }

    /// The GC struct type of a concrete struct instantiation, created once per
    /// distinct instantiation.
    pub fn struct_type(&mut self, ty: &Type) -> Result<TypeIdx, Diagnostic> {
        if let Some(idx) = self.struct_types.get(ty) {
            return Ok(*idx);
        }
        let Type::Struct { def_id, args } = ty else {
            return Err(Diagnostic::ice(format!("`{}` is not a struct type", ty), Span::dummy()));
        };
        let program = self.program;
        let fields = program
            .struct_fields(*def_id, args)
            .ok_or_else(|| Diagnostic::ice(format!("no struct declaration for {}", def_id), Span::dummy()))?;
        // Reserve first: a field may refer back to this struct.
        let idx = self.module.add_struct(program.type_name(ty), Vec::new());
        self.struct_types.insert(ty.clone(), idx);
        let mut lowered = Vec::with_capacity(fields.len());
        for field in &fields {
            lowered.push(self.val_type(field)?);
        }
        self.module.set_struct_fields(idx, lowered).map_err(super::ice)?;
        Ok(idx)
    }

    /// How a value of `ty` crosses the host boundary.
    pub fn payload_kind(&self, ty: &Type) -> PayloadKind {
        if self.program.serializer_for(ty).is_some() {
            return PayloadKind::Serialized;
        }
        match ty {
            Type::Unit => PayloadKind::None,
            Type::Bool | Type::I32 => PayloadKind::I32,
            Type::U32 => PayloadKind::U32,
            _ => PayloadKind::Opaque,
        }
    }
}

/// Register type a host-facing wrapper uses for one payload.
pub fn host_val_type(kind: PayloadKind) -> ValType {
    match kind {
        PayloadKind::Serialized => ValType::I64,
        _ => ValType::I32,
    }
}

/// Split a value into the uniform `(i64, anyref)` pair.
pub fn to_uniform(fb: &mut FunctionBuilder, value: Reg, ty: &Type) -> (Reg, Reg) {
    match ty {
        Type::I64 => {
            let null = fb.null();
            (value, null)
        }
        Type::Struct { .. } | Type::Cont { .. } | Type::Param(_) => {
            let word = fb.i64_const(0);
            (word, value)
        }
        _ => {
            let op = if *ty == Type::U32 {
                UnaryOp::I64ExtendI32U
            } else {
                UnaryOp::I64ExtendI32S
            };
            let dst = fb.reg(ValType::I64);
            fb.emit(Instr::Unary { op, dst, src: value });
            let null = fb.null();
            (dst, null)
        }
    }
}

/// Rebuild a typed value from the uniform pair.
pub fn from_uniform(fb: &mut FunctionBuilder, word: Reg, reference: Reg, ty: &Type) -> Reg {
    match ty {
        Type::I64 => {
            let dst = fb.reg(ValType::I64);
            fb.emit(Instr::Move { dst, src: word });
            dst
        }
        Type::Struct { .. } | Type::Cont { .. } | Type::Param(_) => {
            let dst = fb.reg(ValType::AnyRef);
            fb.emit(Instr::Move { dst, src: reference });
            dst
        }
        _ => {
            let dst = fb.reg(ValType::I32);
            fb.emit(Instr::Unary {
                op: UnaryOp::I32WrapI64,
                dst,
                src: word,
            });
            dst
        }
    }
}

/// Materialize a literal into an existing register.
pub fn emit_literal_into(fb: &mut FunctionBuilder, dst: Reg, lit: Literal, ty: &Type) {
    match (lit, ty) {
        (Literal::Int(v), Type::I64) => fb.emit(Instr::I64Const { dst, value: v }),
        (Literal::Int(v), _) => fb.emit(Instr::I32Const { dst, value: v as i32 }),
        (Literal::Bool(b), _) => fb.emit(Instr::I32Const { dst, value: b as i32 }),
        (Literal::Unit, _) => fb.emit(Instr::I32Const { dst, value: 0 }),
    }
}

/// Materialize a literal into a fresh register.
pub fn emit_literal(fb: &mut FunctionBuilder, lit: Literal, ty: &Type) -> Reg {
    let dst = fb.reg(if matches!((lit, ty), (Literal::Int(_), Type::I64)) {
        ValType::I64
    } else {
        ValType::I32
    });
    emit_literal_into(fb, dst, lit, ty);
    dst
}
