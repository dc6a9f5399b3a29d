//! The host boundary.
//!
//! Every exported function gets a wrapper taking host-representable
//! parameters and returning an `$EffectResult`. A finished result reports its
//! value through `write_value`; a suspended one reports its request through
//! `write_effect` after storing the argument words in the scratch area, and
//! its continuation is wrapped so that `effect_resume` can run it and settle
//! the new result the same way.
//!
//! Only `()`, `bool`, `i32`, `u32` and types with a declared serializer may
//! cross. Anything else is rejected with `CG0001` before any code is emitted.

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::hir::{DefId, FnDecl, Type};
use crate::protocol::{PayloadKind, ProtocolExport};
use crate::span::Span;
use crate::target::{BinaryOp, FuncIdx, FunctionBuilder, Instr, Reg, TrapKind, UnaryOp, ValType};

use super::super::runtime::{effect_result, export_cont, memory, request};
use super::dispatch::{binary, unary};
use super::types::{from_uniform, host_val_type, to_uniform};
use super::{ice, CodegenContext, SupportSymbol};

/// The shared exports every module carries.
const SHARED_EXPORTS: [SupportSymbol; 6] = [
    SupportSymbol::InitEffects,
    SupportSymbol::EffectStatus,
    SupportSymbol::EffectCont,
    SupportSymbol::EffectLen,
    SupportSymbol::ReadValue,
    SupportSymbol::EffectResume,
];

impl<'a> CodegenContext<'a> {
    /// Check every export's boundary types, then build the wrappers.
    pub fn compile_exports(&mut self) -> Result<(), Vec<Diagnostic>> {
        let program = self.program;
        let mut errors = Vec::new();
        let mut exports = Vec::new();
        for f in program.functions.values() {
            let Some(name) = &f.export else { continue };
            if f.generics > 0 {
                continue;
            }
            let before = errors.len();
            self.check_export(f, name, &mut errors);
            if errors.len() == before {
                exports.push((f.def_id, name.clone()));
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        for symbol in SHARED_EXPORTS {
            self.support(symbol);
        }
        for (def_id, name) in exports {
            self.export_wrapper(def_id, &name).map_err(|d| vec![d])?;
        }
        Ok(())
    }

    fn unsupported(&self, ty: &Type, span: Span) -> Diagnostic {
        Diagnostic::error(
            format!("unsupported type `{}` at the host boundary", self.program.type_name(ty)),
            span,
        )
        .with_error_code(ErrorCode::UnsupportedHostType)
    }

    fn check_export(&mut self, f: &FnDecl, name: &str, errors: &mut Vec<Diagnostic>) {
        for ty in f.param_types().iter().chain(std::iter::once(&f.ret)) {
            if self.payload_kind(ty) == PayloadKind::Opaque {
                errors.push(
                    self.unsupported(ty, f.span)
                        .with_note(f.span, format!("in the signature of export `{}`", name)),
                );
            }
        }
        let row = self.effects.row(f.def_id);
        for effect in row.iter() {
            let instance = match self.effect_instance(effect) {
                Ok(i) => i,
                Err(d) => {
                    errors.push(d);
                    continue;
                }
            };
            let limit = self.options.host_arg_words as usize;
            let mut host_ok = Vec::new();
            for (i, op) in self.effect_instances[instance].ops.iter().enumerate() {
                let before = errors.len();
                for ty in op.params.iter().chain(std::iter::once(&op.ret)) {
                    if self.payload_kind(ty) == PayloadKind::Opaque {
                        errors.push(self.unsupported(ty, f.span).with_note(
                            f.span,
                            format!("operation `{}` can reach the host through export `{}`", op.label, name),
                        ));
                    }
                }
                if op.params.len() > limit {
                    errors.push(
                        Diagnostic::error(
                            format!(
                                "operation `{}` passes {} arguments but the host boundary carries at most {}",
                                op.label,
                                op.params.len(),
                                limit
                            ),
                            f.span,
                        )
                        .with_error_code(ErrorCode::UnsupportedHostType),
                    );
                }
                if errors.len() == before {
                    host_ok.push(i);
                }
            }
            for i in host_ok {
                self.effect_instances[instance].ops[i].host = true;
            }
        }
    }

    /// `{name}$export`, exported as `name`, and its settle function.
    fn export_wrapper(&mut self, def_id: DefId, name: &str) -> Result<(), Diagnostic> {
        let program = self.program;
        let f = program
            .function(def_id)
            .ok_or_else(|| Diagnostic::ice(format!("no body for {}", def_id), Span::dummy()))?;
        let effectful = self.effects.is_effectful(def_id);
        let param_types = f.param_types();
        let kinds: Vec<PayloadKind> = param_types.iter().map(|t| self.payload_kind(t)).collect();
        let result = self.payload_kind(&f.ret);
        let inner = self.instance(def_id, Vec::new());

        let settle = self.module.reserve_function(format!("{}$settle", f.name));
        self.emit_settle(settle, &f.ret)?;

        let params: Vec<ValType> = kinds.iter().map(|k| host_val_type(*k)).collect();
        let mut fb = FunctionBuilder::new(params.len() as u32);
        let ready = fb.new_label();
        let flag = fb.reg(ValType::I32);
        fb.emit(Instr::GlobalGet {
            dst: flag,
            global: self.ready,
        });
        fb.branch_if(flag, ready);
        fb.emit(Instr::Trap {
            kind: TrapKind::NotReady,
            args: Vec::new(),
        });
        fb.bind(ready);

        let mut args = Vec::with_capacity(param_types.len() + 1);
        if effectful {
            args.push(fb.null());
        }
        for (i, (ty, kind)) in param_types.iter().zip(&kinds).enumerate() {
            let reg = i as Reg;
            args.push(match kind {
                PayloadKind::Serialized => self.decode(&mut fb, ty, reg)?,
                _ => reg,
            });
        }
        let r = if effectful {
            fb.call(inner, args, ValType::AnyRef)
        } else {
            let val = self.val_type(&f.ret)?;
            let v = fb.call(inner, args, val);
            let (word, reference) = to_uniform(&mut fb, v, &f.ret);
            let make_done = self.support(SupportSymbol::MakeDone);
            fb.call(make_done, vec![word, reference], ValType::AnyRef)
        };
        let out = fb.call(settle, vec![r], ValType::AnyRef);
        fb.ret(out);

        let wrapper_name = format!("{}$export", f.name);
        let idx = self.module.reserve_function(wrapper_name.clone());
        let ty = self.module.func_type(params.clone(), vec![ValType::AnyRef]);
        let function = fb.finish(wrapper_name, ty, &params).map_err(ice)?;
        self.module.define_function(idx, function).map_err(ice)?;
        self.module.export(name, idx);
        tracing::debug!(export = name, effectful, "export wrapper");
        self.protocol_exports.push(ProtocolExport {
            name: name.to_string(),
            params: kinds,
            result,
            effectful,
        });
        Ok(())
    }

    /// `(result) -> result`: report a finished value, or the request and a
    /// resumable continuation of a suspended one.
    fn emit_settle(&mut self, idx: FuncIdx, ret: &Type) -> Result<(), Diagnostic> {
        let er = self.layout.effect_result;
        let mut fb = FunctionBuilder::new(1);
        let r = fb.cast(0, er);
        let status = fb.get(r, er, effect_result::STATUS, ValType::I32);
        let suspended = fb.new_label();
        fb.branch_if(status, suspended);

        let kind = self.payload_kind(ret);
        let payload = match kind {
            PayloadKind::Serialized => {
                let word = fb.get(r, er, effect_result::VALUE, ValType::I64);
                let reference = fb.get(r, er, effect_result::REF_VALUE, ValType::AnyRef);
                let value = from_uniform(&mut fb, word, reference, ret);
                self.encode(&mut fb, ret, value)?
            }
            PayloadKind::I32 | PayloadKind::U32 => fb.get(r, er, effect_result::VALUE, ValType::I64),
            PayloadKind::None | PayloadKind::Opaque => fb.i64_const(0),
        };
        let tag = fb.i32_const(kind.tag());
        let zero = fb.i32_const(0);
        let written = fb.reg(ValType::I32);
        fb.emit(Instr::CallImport {
            dst: Some(written),
            import: self.imports.write_value,
            args: vec![tag, payload, zero, zero],
        });
        fb.ret(0);

        fb.bind(suspended);
        let emit_request = self.support(SupportSymbol::EmitRequest);
        let len = fb.call(emit_request, vec![0], ValType::I32);
        let req = fb.get(r, er, effect_result::REQUEST, ValType::AnyRef);
        let typed_req = fb.cast(req, self.layout.request);
        let op = fb.get(typed_req, self.layout.request, request::OP_INDEX, ValType::I32);
        let inner = fb.get(r, er, effect_result::CONT, ValType::AnyRef);
        let me = fb.reg(ValType::FuncRef);
        fb.emit(Instr::RefFunc { dst: me, func: idx });
        let cont = fb.new_struct(self.layout.export_cont, vec![inner, me, op]);
        let one = fb.i32_const(effect_result::SUSPENDED);
        let word = fb.i64_const(0);
        let null = fb.null();
        let out = fb.new_struct(er, vec![one, word, null, cont, req, len]);
        fb.ret(out);

        let name = self.module.function_name(idx).unwrap_or_default().to_string();
        let ty = self.layout.settle_fn;
        let function = fb.finish(name, ty, &[ValType::AnyRef]).map_err(ice)?;
        self.module.define_function(idx, function).map_err(ice)
    }

    /// Body of [`SupportSymbol::EmitRequest`]: store the argument words of a
    /// host request and call `write_effect`.
    pub(super) fn emit_emit_request(&mut self, fb: &mut FunctionBuilder) -> Result<(), Diagnostic> {
        let er = self.layout.effect_result;
        let rq = self.layout.request;
        let r = fb.cast(0, er);
        let req = fb.get(r, er, effect_result::REQUEST, ValType::AnyRef);
        let req = fb.cast(req, rq);

        let to_host = fb.new_label();
        let target = fb.get(req, rq, request::FRAME, ValType::AnyRef);
        let is_null = fb.reg(ValType::I32);
        fb.emit(Instr::RefIsNull {
            dst: is_null,
            src: target,
        });
        fb.branch_if(is_null, to_host);
        fb.emit(Instr::Trap {
            kind: TrapKind::EscapedEffect,
            args: Vec::new(),
        });
        fb.bind(to_host);

        let op = fb.get(req, rq, request::OP_INDEX, ValType::I32);
        let args = fb.get(req, rq, request::ARGS, ValType::AnyRef);
        let scratch = fb.i32_const(memory::SCRATCH_BASE as i32);
        let host_ops: Vec<_> = self
            .op_instances()
            .filter(|(_, op)| op.host)
            .map(|(effect, op)| (effect.id_str, op.clone()))
            .collect();
        for ((id_ptr, id_len), instance) in host_ops {
            let next = fb.new_label();
            let index = fb.i32_const(instance.op_index as i32);
            let matches = binary(fb, BinaryOp::I32Eq, op, index, ValType::I32);
            fb.branch_if_not(matches, next);
            if let Some(args_ty) = instance.args_ty {
                let typed = fb.cast(args, args_ty);
                for (i, ty) in instance.params.iter().enumerate() {
                    let val = self.val_type(ty)?;
                    let field = fb.get(typed, args_ty, i as u32, val);
                    let word = match self.payload_kind(ty) {
                        PayloadKind::Serialized => self.encode(fb, ty, field)?,
                        PayloadKind::U32 => unary(fb, UnaryOp::I64ExtendI32U, field, ValType::I64),
                        PayloadKind::I32 => unary(fb, UnaryOp::I64ExtendI32S, field, ValType::I64),
                        PayloadKind::None | PayloadKind::Opaque => fb.i64_const(0),
                    };
                    fb.emit(Instr::Store64 {
                        addr: scratch,
                        offset: i as u32 * memory::WORD,
                        src: word,
                    });
                }
            }
            let argc = instance.params.len() as i32;
            let call_args = vec![
                index,
                fb.i32_const(id_ptr as i32),
                fb.i32_const(id_len as i32),
                fb.i32_const(instance.op_id.0 as i32),
                fb.i64_const(instance.hash.as_u64() as i64),
                scratch,
                fb.i32_const(argc),
            ];
            let written = fb.reg(ValType::I32);
            fb.emit(Instr::CallImport {
                dst: Some(written),
                import: self.imports.write_effect,
                args: call_args,
            });
            let count = fb.i32_const(argc);
            fb.ret(count);
            fb.bind(next);
        }
        fb.emit(Instr::Trap {
            kind: TrapKind::UnsupportedPayload,
            args: Vec::new(),
        });
        Ok(())
    }

    /// Body of [`SupportSymbol::EffectResume`]: `(result, ptr, len)`.
    pub(super) fn emit_effect_resume(&mut self, fb: &mut FunctionBuilder) -> Result<(), Diagnostic> {
        let er = self.layout.effect_result;
        let ec = self.layout.export_cont;
        let r = fb.cast(0, er);
        let cont = fb.get(r, er, effect_result::CONT, ValType::AnyRef);
        let cont = fb.cast(cont, ec);
        let inner = fb.get(cont, ec, export_cont::INNER, ValType::AnyRef);
        let settle = fb.get(cont, ec, export_cont::SETTLE, ValType::FuncRef);
        let op = fb.get(cont, ec, export_cont::OP_INDEX, ValType::I32);

        let word = fb.reg(ValType::I64);
        fb.emit(Instr::CallImport {
            dst: Some(word),
            import: self.imports.read_value,
            args: vec![1, 2],
        });
        let value = fb.reg(ValType::I64);
        fb.emit(Instr::Move { dst: value, src: word });
        let reference = fb.null();

        let decoded: Vec<_> = self
            .op_instances()
            .filter(|(_, op)| op.host)
            .map(|(_, op)| op.clone())
            .filter(|op| self.payload_kind(&op.ret) == PayloadKind::Serialized)
            .collect();
        for instance in decoded {
            let next = fb.new_label();
            let index = fb.i32_const(instance.op_index as i32);
            let matches = binary(fb, BinaryOp::I32Eq, op, index, ValType::I32);
            fb.branch_if_not(matches, next);
            let typed = self.decode(fb, &instance.ret, word)?;
            let (w, rf) = to_uniform(fb, typed, &instance.ret);
            fb.emit(Instr::Move { dst: value, src: w });
            fb.emit(Instr::Move { dst: reference, src: rf });
            fb.bind(next);
        }

        let resume_cont = self.support(SupportSymbol::ResumeCont);
        let res = fb.call(resume_cont, vec![inner, value, reference], ValType::AnyRef);
        let out = fb.reg(ValType::AnyRef);
        fb.emit(Instr::CallRef {
            dst: Some(out),
            ty: self.layout.settle_fn,
            callee: settle,
            args: vec![res],
        });
        fb.ret(out);
        Ok(())
    }

    fn serializer_fns(&self, ty: &Type) -> Result<(DefId, DefId), Diagnostic> {
        self.program
            .serializer_for(ty)
            .map(|s| (s.encode, s.decode))
            .ok_or_else(|| Diagnostic::ice(format!("no serializer for `{}`", ty), Span::dummy()))
    }

    fn encode(&mut self, fb: &mut FunctionBuilder, ty: &Type, value: Reg) -> Result<Reg, Diagnostic> {
        let (encode, _) = self.serializer_fns(ty)?;
        let func = self.instance(encode, Vec::new());
        Ok(fb.call(func, vec![value], ValType::I64))
    }

    fn decode(&mut self, fb: &mut FunctionBuilder, ty: &Type, word: Reg) -> Result<Reg, Diagnostic> {
        let (_, decode) = self.serializer_fns(ty)?;
        let func = self.instance(decode, Vec::new());
        let val = self.val_type(ty)?;
        Ok(fb.call(func, vec![word], val))
    }
}
