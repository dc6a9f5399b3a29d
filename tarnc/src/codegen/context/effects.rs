//! Continuation sites.
//!
//! A site is compiled as a call producing an `$EffectResult` into the
//! slot's result register, followed by the slot's check label. The check
//! either unpacks a finished value or packages the live environment and
//! returns a suspension whose continuation re-enters at the same label.
//!
//! ```text
//!        ... code before the site ...
//!        r = dispatch(hs, op, kind, args)
//! check: if r.status == suspended {
//!            env = {r.cont, live...}
//!            return suspend_with(r, {$k, env})
//!        }
//!        if r.status == returned { return or pass r on }
//!        value = r.value
//!        ... code after the site ...
//!
//! $k(env, value, ref_value):
//!        restore live... from env
//!        r = resume_cont(env.inner, value, ref_value)
//!        goto check
//! ```

use crate::diagnostics::Diagnostic;
use crate::effects::EffectRef;
use crate::eir::{ContinuationSite, EnvField, EnvSource, SiteOwner};
use crate::hir::{Expr, ExprId, ResumeKind, Type};
use crate::target::{BinaryOp, Instr, Reg, TrapKind, ValType};

use super::super::runtime::{effect_result, hcont};
use super::dispatch::binary;
use super::types::{emit_literal_into, from_uniform};
use super::{OwnerCodegen, SiteSlot, SupportSymbol};

impl<'c, 'a> OwnerCodegen<'c, 'a> {
    fn site(&self, index: usize) -> Result<&'c ContinuationSite, Diagnostic> {
        let owner = self.owner;
        owner
            .sites
            .get(index)
            .ok_or_else(|| Diagnostic::ice(format!("no site #{}", index), self.inst.f.span))
    }

    /// Allocate the slot for the site at `expr`, if the expression is one.
    pub(super) fn open_site(&mut self, expr: &Expr) -> Result<Option<usize>, Diagnostic> {
        let owner = self.owner;
        let Some(index) = owner.sites.iter().position(|s| s.expr == expr.id) else {
            return Ok(None);
        };
        let site = &owner.sites[index];
        let name = format!("{}$k{}", self.inst.eir.name, site.id.0);
        let mut fields = vec![ValType::AnyRef];
        if site.tracks_frame() {
            fields.push(ValType::AnyRef);
        }
        for field in &site.env {
            fields.push(self.env_val_type(field)?);
        }
        let env_ty = self.cx.module.add_struct(format!("{}$env", name), fields);
        let func = self.cx.module.reserve_function(name);
        let result = self.fb.reg(ValType::AnyRef);
        let frame = site.tracks_frame().then(|| self.fb.reg(ValType::AnyRef));
        let value = self.fb.reg(self.cx.val_type(&site.result_ty)?);
        let check = self.fb.new_label();
        tracing::trace!(site = %site.id, expr = %expr.id, "opened site");
        self.slots.push(SiteSlot {
            site: index,
            func,
            env_ty,
            result,
            frame,
            value,
            check,
        });
        Ok(Some(self.slots.len() - 1))
    }

    fn env_val_type(&mut self, field: &EnvField) -> Result<ValType, Diagnostic> {
        match (field.source, &field.ty) {
            (EnvSource::Param(l) | EnvSource::Local(l), _) if self.inst.eir.is_cell(l) => Ok(ValType::AnyRef),
            (_, Some(ty)) => self.cx.val_type(ty),
            (_, None) => Ok(ValType::AnyRef),
        }
    }

    /// The register an environment field is saved from and restored into.
    fn source_reg(&mut self, source: EnvSource) -> Result<Reg, Diagnostic> {
        match source {
            EnvSource::Handler => Ok(self.hs),
            EnvSource::Param(l) | EnvSource::Local(l) => self.local_reg(l),
            EnvSource::Temporary(e) => self.expr_reg(e),
        }
    }

    fn expr_reg(&self, e: ExprId) -> Result<Reg, Diagnostic> {
        self.exprs
            .get(&e)
            .copied()
            .ok_or_else(|| Diagnostic::ice(format!("temporary {} was never evaluated", e), self.inst.f.span))
    }

    /// Bind the slot's check label and produce the site's value.
    pub(super) fn close_site(&mut self, slot: usize, ty: &Type) -> Result<Reg, Diagnostic> {
        let slot = self.slots[slot].clone();
        let site = self.site(slot.site)?;
        let er = self.cx.layout.effect_result;
        self.fb.bind(slot.check);
        let r = self.fb.cast(slot.result, er);
        let status = self.fb.get(r, er, effect_result::STATUS, ValType::I32);
        let done = self.fb.new_label();
        let returned = self.fb.new_label();
        self.fb.branch_if_not(status, done);
        let suspended = self.fb.i32_const(effect_result::SUSPENDED);
        let is_suspended = binary(&mut self.fb, BinaryOp::I32Eq, status, suspended, ValType::I32);
        self.fb.branch_if_not(is_suspended, returned);

        let inner = self.fb.get(r, er, effect_result::CONT, ValType::AnyRef);
        let mut fields = vec![inner];
        fields.extend(slot.frame);
        for field in &site.env {
            fields.push(self.source_reg(field.source)?);
        }
        let env = self.fb.new_struct(slot.env_ty, fields);
        let func = self.fb.reg(ValType::FuncRef);
        self.fb.emit(Instr::RefFunc { dst: func, func: slot.func });
        let cont = self.fb.new_struct(self.cx.layout.cont, vec![func, env]);
        let suspend_with = self.cx.support(SupportSymbol::SuspendWith);
        let out = self.fb.call(suspend_with, vec![slot.result, cont], ValType::AnyRef);
        self.fb.ret(out);

        self.fb.bind(returned);
        self.returned(slot.result, slot.frame)?;

        self.fb.bind(done);
        let word = self.fb.get(r, er, effect_result::VALUE, ValType::I64);
        let reference = self.fb.get(r, er, effect_result::REF_VALUE, ValType::AnyRef);
        let value = from_uniform(&mut self.fb, word, reference, ty);
        self.fb.emit(Instr::Move { dst: slot.value, src: value });
        Ok(slot.value)
    }

    /// A returned result reached this owner. The function owner returns its
    /// value if the return left a handler scope opened here (`frame`, or one
    /// nested in it); anything else passes the result on.
    fn returned(&mut self, result: Reg, frame: Option<Reg>) -> Result<(), Diagnostic> {
        let foreign = self.fb.new_label();
        if let (SiteOwner::Function, Some(frame)) = (self.owner.owner, frame) {
            let owns_return = self.cx.support(SupportSymbol::OwnsReturn);
            let owned = self.fb.call(owns_return, vec![frame, result], ValType::I32);
            self.fb.branch_if_not(owned, foreign);
            let er = self.cx.layout.effect_result;
            let r = self.fb.cast(result, er);
            let word = self.fb.get(r, er, effect_result::VALUE, ValType::I64);
            let reference = self.fb.get(r, er, effect_result::REF_VALUE, ValType::AnyRef);
            let ret = self.concrete(&self.inst.f.ret);
            let value = from_uniform(&mut self.fb, word, reference, &ret);
            self.exit(value, &ret)?;
        }
        self.fb.bind(foreign);
        if self.returns_result() {
            self.fb.ret(result);
        } else {
            self.fb.emit(Instr::Trap {
                kind: TrapKind::EscapedEffect,
                args: Vec::new(),
            });
        }
        Ok(())
    }

    /// Entry of the continuation function of slot `index`.
    pub(super) fn continuation_entry(&mut self, index: usize) -> Result<(), Diagnostic> {
        let slot = self.slots[index].clone();
        let site = self.site(slot.site)?;
        let entry = self.fb.here();
        self.fb.patch(0, Instr::Jump { target: entry });

        let env = self.fb.cast(0, slot.env_ty);
        let inner = self.fb.get(env, slot.env_ty, 0, ValType::AnyRef);
        let mut field = 1;
        if let Some(frame) = slot.frame {
            let saved = self.fb.get(env, slot.env_ty, field, ValType::AnyRef);
            self.fb.emit(Instr::Move { dst: frame, src: saved });
            field += 1;
        }
        for env_field in &site.env {
            let val = self.env_val_type(env_field)?;
            let saved = self.fb.get(env, slot.env_ty, field, val);
            let dst = self.source_reg(env_field.source)?;
            self.fb.emit(Instr::Move { dst, src: saved });
            field += 1;
        }
        for remat in &site.rematerialized {
            let dst = self.source_reg(remat.target)?;
            emit_literal_into(&mut self.fb, dst, remat.value, &remat.ty);
        }

        let resume_cont = self.cx.support(SupportSymbol::ResumeCont);
        let r = self.fb.call(resume_cont, vec![inner, 1, 2], ValType::AnyRef);
        self.fb.emit(Instr::Move { dst: slot.result, src: r });
        if let Some(frame) = slot.frame {
            let handle_result = self.cx.support(SupportSymbol::HandleResult);
            let r = self.fb.call(handle_result, vec![frame, slot.result], ValType::AnyRef);
            self.fb.emit(Instr::Move { dst: slot.result, src: r });
        }
        self.fb.jump(slot.check);
        Ok(())
    }

    /// `perform E.op(args)`
    pub(super) fn perform(
        &mut self,
        e: &'c Expr,
        effect: &EffectRef,
        op: u32,
        args: &'c [Expr],
    ) -> Result<Reg, Diagnostic> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.expr(arg)?);
        }
        let instance = self.cx.effect_instance(effect)?;
        let op_instance = self.cx.effect_instances[instance]
            .ops
            .get(op as usize)
            .cloned()
            .ok_or_else(|| Diagnostic::ice(format!("effect instance has no operation #{}", op), e.span))?;
        let args_ref = match op_instance.args_ty {
            Some(ty) => self.fb.new_struct(ty, values),
            None => self.fb.null(),
        };
        let slot = self
            .open_site(e)?
            .ok_or_else(|| Diagnostic::ice(format!("perform {} is not a continuation site", e.id), e.span))?;
        let site = self.site(self.slots[slot].site)?;
        let symbol = if site.direct_handler && self.cx.options.direct_dispatch {
            SupportSymbol::DispatchDirect
        } else {
            SupportSymbol::Dispatch
        };
        let dispatch = self.cx.support(symbol);
        let op_index = self.fb.i32_const(op_instance.op_index as i32);
        let kind = self.fb.i32_const(match op_instance.resume_kind {
            ResumeKind::Resume => hcont::KIND_RESUME,
            ResumeKind::Tail => hcont::KIND_TAIL,
        });
        let r = self
            .fb
            .call(dispatch, vec![self.hs, op_index, kind, args_ref], ValType::AnyRef);
        self.fb.emit(Instr::Move {
            dst: self.slots[slot].result,
            src: r,
        });
        let ty = self.concrete(&e.ty);
        self.close_site(slot, &ty)
    }

    /// Unpack a result that cannot be suspended here. `frame` is the handler
    /// frame of a `handle` expression, whose returns end up here.
    pub(super) fn expect_done(&mut self, result: Reg, frame: Option<Reg>, ty: &Type) -> Result<Reg, Diagnostic> {
        let er = self.cx.layout.effect_result;
        let r = self.fb.cast(result, er);
        let status = self.fb.get(r, er, effect_result::STATUS, ValType::I32);
        let suspended = self.fb.i32_const(effect_result::SUSPENDED);
        let escaped = binary(&mut self.fb, BinaryOp::I32Eq, status, suspended, ValType::I32);
        let done = self.fb.new_label();
        let checked = self.fb.new_label();
        self.fb.branch_if_not(escaped, checked);
        self.fb.emit(Instr::Trap {
            kind: TrapKind::EscapedEffect,
            args: Vec::new(),
        });
        self.fb.bind(checked);
        let returned = self.fb.i32_const(effect_result::RETURNED);
        let is_returned = binary(&mut self.fb, BinaryOp::I32Eq, status, returned, ValType::I32);
        self.fb.branch_if_not(is_returned, done);
        self.returned(result, frame)?;
        self.fb.bind(done);
        let word = self.fb.get(r, er, effect_result::VALUE, ValType::I64);
        let reference = self.fb.get(r, er, effect_result::REF_VALUE, ValType::AnyRef);
        Ok(from_uniform(&mut self.fb, word, reference, ty))
    }
}
