//! Handler scopes and continuation calls.
//!
//! A `handle` expression allocates a `$Frame` on top of the current handler
//! stack and calls the handled body as a separate function taking that
//! frame. Requests addressed to the frame come back as suspended results and
//! are answered by [`SupportSymbol::HandleResult`], which calls the clause
//! with a fresh handler continuation.
//!
//! Clause functions share one environment per `handle`: the outer handler
//! stack followed by the union of the clauses' captured locals.

use crate::diagnostics::Diagnostic;
use crate::effects::EffectRef;
use crate::eir::SiteOwner;
use crate::hir::{ContinuationCall, Expr, ExprId, Handler, LocalId};
use crate::target::{Instr, Reg, ValType};

use super::super::runtime::hcont;
use super::types::to_uniform;
use super::{OwnerCodegen, SiteSlot, SupportSymbol};

impl<'c, 'a> OwnerCodegen<'c, 'a> {
    /// `handle body with E { clauses }`
    pub(super) fn handle(&mut self, e: &'c Expr, handler: &'c Handler) -> Result<Reg, Diagnostic> {
        let effect = EffectRef::new(handler.effect, handler.type_args.iter().map(|t| self.concrete(t)).collect());
        let instance = self.cx.effect_instance(&effect)?;
        let (index, first_op, op_count) = {
            let inst = &self.cx.effect_instances[instance];
            (inst.index, inst.first_op, inst.ops.len() as u32)
        };

        let env_ty = self
            .inst
            .clause_envs
            .get(&e.id)
            .copied()
            .ok_or_else(|| Diagnostic::ice(format!("no clause environment for {}", e.id), e.span))?;
        let mut env_fields = vec![self.hs];
        for local in self.inst.eir.clause_captures(e.id) {
            env_fields.push(self.local_reg(local)?);
        }
        let env = self.fb.new_struct(env_ty, env_fields);

        let mut clauses = Vec::with_capacity(op_count as usize);
        for op in 0..op_count {
            let func = self.func_of(SiteOwner::Clause { handle: e.id, op })?;
            let dst = self.fb.reg(ValType::FuncRef);
            self.fb.emit(Instr::RefFunc { dst, func });
            clauses.push(dst);
        }
        let array = self.fb.reg(ValType::AnyRef);
        self.fb.emit(Instr::ArrayNewFixed {
            dst: array,
            ty: self.cx.layout.clause_array,
            elems: clauses,
        });

        let effect_index = self.fb.i32_const(index as i32);
        let first = self.fb.i32_const(first_op as i32);
        let count = self.fb.i32_const(op_count as i32);
        let frame_ref = self.fb.new_struct(
            self.cx.layout.frame,
            vec![self.hs, effect_index, first, count, array, env],
        );
        tracing::trace!(handle = %e.id, effect = %self.cx.effect_instances[instance].name, "handler frame");

        let body_owner = SiteOwner::HandleBody(e.id);
        let body_fn = self.func_of(body_owner)?;
        let captures = self
            .inst
            .eir
            .owner(body_owner)
            .map(|o| o.captures.clone())
            .unwrap_or_default();
        let mut args = vec![frame_ref];
        for local in captures {
            args.push(self.local_reg(local)?);
        }
        let r = self.fb.call(body_fn, args, ValType::AnyRef);
        let handle_result = self.cx.support(SupportSymbol::HandleResult);
        let r = self.fb.call(handle_result, vec![frame_ref, r], ValType::AnyRef);

        let ty = self.concrete(&e.ty);
        match self.open_site(e)? {
            Some(slot) => {
                let SiteSlot { result, frame, .. } = self.slots[slot].clone();
                if let Some(saved) = frame {
                    self.fb.emit(Instr::Move { dst: saved, src: frame_ref });
                }
                self.fb.emit(Instr::Move { dst: result, src: r });
                self.close_site(slot, &ty)
            }
            None => self.expect_done(r, Some(frame_ref), &ty),
        }
    }

    /// `resume k(v)`, `tail k(v)` or `end k(v)`.
    pub(super) fn continuation_call(
        &mut self,
        e: &'c Expr,
        call: ContinuationCall,
        cont: LocalId,
        value: &'c Expr,
    ) -> Result<Reg, Diagnostic> {
        let v = self.expr(value)?;
        let value_ty = self.concrete(&value.ty);
        let (word, reference) = to_uniform(&mut self.fb, v, &value_ty);
        let k = self.read_local(cont)?;
        let mode = self.fb.i32_const(match call {
            ContinuationCall::Resume => hcont::MODE_RESUME,
            ContinuationCall::Tail => hcont::MODE_TAIL,
            ContinuationCall::End => hcont::MODE_END,
        });
        let ty = self.concrete(&e.ty);
        let slot = self.open_site(e)?;
        if let Some(slot) = slot {
            if let Some(saved) = self.slots[slot].frame {
                let hc = self.cx.layout.hcont;
                let typed = self.fb.cast(k, hc);
                let frame_ref = self.fb.get(typed, hc, hcont::FRAME, ValType::AnyRef);
                self.fb.emit(Instr::Move { dst: saved, src: frame_ref });
            }
        }
        let invoke = self.cx.support(SupportSymbol::InvokeCont);
        let r = self.fb.call(invoke, vec![k, word, reference, mode], ValType::AnyRef);
        match slot {
            Some(slot) => {
                self.fb.emit(Instr::Move {
                    dst: self.slots[slot].result,
                    src: r,
                });
                self.close_site(slot, &ty)
            }
            None => self.expect_done(r, None, &ty),
        }
    }

    /// Entry of a clause function `(env, args, k)`.
    pub(super) fn clause_prologue(&mut self, handle: ExprId, op: u32) -> Result<(), Diagnostic> {
        let inst = self.inst;
        let env_ty = inst
            .clause_envs
            .get(&handle)
            .copied()
            .ok_or_else(|| Diagnostic::ice(format!("no clause environment for {}", handle), inst.f.span))?;
        let env = self.fb.cast(0, env_ty);
        let outer = self.fb.get(env, env_ty, 0, ValType::AnyRef);
        self.fb.emit(Instr::Move { dst: self.hs, src: outer });

        let owner = self.owner;
        let shared = inst.eir.clause_captures(handle);
        for local in &owner.captures {
            let Some(position) = shared.iter().position(|l| l == local) else {
                return Err(Diagnostic::ice(
                    format!("clause capture {} missing from the shared environment", local),
                    inst.f.span,
                ));
            };
            let val = if inst.eir.is_cell(*local) {
                ValType::AnyRef
            } else {
                let ty = self.local_type(*local)?;
                self.cx.val_type(&ty)?
            };
            let saved = self.fb.get(env, env_ty, position as u32 + 1, val);
            let dst = self.local_reg(*local)?;
            self.fb.emit(Instr::Move { dst, src: saved });
        }

        let (_, handler) = self.handle_parts(handle)?;
        let clause = handler
            .clause(op)
            .ok_or_else(|| Diagnostic::ice(format!("handler has no clause #{}", op), inst.f.span))?;
        let effect = EffectRef::new(handler.effect, handler.type_args.iter().map(|t| self.concrete(t)).collect());
        let instance = self.cx.effect_instance(&effect)?;
        let op_instance = self.cx.effect_instances[instance]
            .ops
            .get(op as usize)
            .cloned()
            .ok_or_else(|| Diagnostic::ice(format!("effect instance has no operation #{}", op), inst.f.span))?;
        if let Some(args_ty) = op_instance.args_ty {
            let args = self.fb.cast(1, args_ty);
            for (i, (param, ty)) in clause.params.iter().zip(&op_instance.params).enumerate() {
                let val = self.cx.val_type(ty)?;
                let arg = self.fb.get(args, args_ty, i as u32, val);
                self.bind_local(*param, arg)?;
            }
        }
        self.bind_local(clause.cont, 2)
    }

    /// The handler frame a `return` in this lambda leaves from.
    pub(super) fn return_frame(&mut self) -> Result<Reg, Diagnostic> {
        match self.owner.owner {
            SiteOwner::Clause { handle, op } => {
                let (_, handler) = self.handle_parts(handle)?;
                let cont = handler
                    .clause(op)
                    .map(|c| c.cont)
                    .ok_or_else(|| Diagnostic::ice(format!("handler has no clause #{}", op), self.inst.f.span))?;
                let k = self.read_local(cont)?;
                let hc = self.cx.layout.hcont;
                let typed = self.fb.cast(k, hc);
                Ok(self.fb.get(typed, hc, hcont::FRAME, ValType::AnyRef))
            }
            _ => Ok(self.hs),
        }
    }
}
