//! Runtime support functions.
//!
//! Support functions are emitted lazily, at most once per module: the first
//! request reserves the function (and registers its export, if it has one)
//! and queues the body; later requests return the same index.
//!
//! Handler frames form an immutable linked list threaded through every
//! effectful function as its first parameter. A frame covers the dense
//! operation range `first_op .. first_op + op_count` of one effect instance.

use crate::diagnostics::Diagnostic;
use crate::target::{BinaryOp, FuncIdx, FunctionBuilder, Instr, Reg, TrapKind, UnaryOp, ValType};

use super::super::runtime::{cont, effect_result, exports, frame, hcont, request};
use super::{ice, CodegenContext};

/// Stable key of a support function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SupportSymbol {
    /// `(value: i64, ref_value: anyref) -> result`
    MakeDone,
    /// `(value: i64, ref_value: anyref, frame) -> result`: a `return` leaving
    /// the handler scope of `frame`.
    MakeReturned,
    /// `(frame, result) -> i32`: whether a returned result left a scope at or
    /// inside `frame`.
    OwnsReturn,
    /// `(result, cont) -> result`: re-suspend `result`'s request with `cont`.
    SuspendWith,
    /// `(op: i32, args, frame) -> result`
    SuspendRequest,
    /// `(cont, value: i64, ref_value) -> result`; a null `cont` is done.
    ResumeCont,
    /// `(chain, frame, op: i32, kind: i32) -> hcont`
    MakeHCont,
    /// `(hs, op: i32, kind: i32, args) -> result`: walk the frame list.
    Dispatch,
    /// Like [`SupportSymbol::Dispatch`] with `hs` known to handle `op`.
    DispatchDirect,
    /// `(frame, result) -> result`: run the clause a request addressed to
    /// `frame` asks for.
    HandleResult,
    /// `(k, value: i64, ref_value, mode: i32) -> result`
    InvokeCont,
    /// `(k) -> ()`: a tail clause completed; `k` must have been called once.
    TailFinalize,
    EffectStatus,
    EffectCont,
    EffectLen,
    InitEffects,
    ReadValue,
    /// `(result) -> i32`: hand a suspended request to the host.
    EmitRequest,
    EffectResume,
}

impl SupportSymbol {
    pub fn name(self) -> &'static str {
        match self {
            SupportSymbol::MakeDone => "$make_done",
            SupportSymbol::MakeReturned => "$make_returned",
            SupportSymbol::OwnsReturn => "$owns_return",
            SupportSymbol::SuspendWith => "$suspend_with",
            SupportSymbol::SuspendRequest => "$suspend_request",
            SupportSymbol::ResumeCont => "$resume_cont",
            SupportSymbol::MakeHCont => "$make_hcont",
            SupportSymbol::Dispatch => "$dispatch",
            SupportSymbol::DispatchDirect => "$dispatch_direct",
            SupportSymbol::HandleResult => "$handle_result",
            SupportSymbol::InvokeCont => "$invoke_cont",
            SupportSymbol::TailFinalize => "$tail_finalize",
            SupportSymbol::EffectStatus => exports::EFFECT_STATUS,
            SupportSymbol::EffectCont => exports::EFFECT_CONT,
            SupportSymbol::EffectLen => exports::EFFECT_LEN,
            SupportSymbol::InitEffects => exports::INIT_EFFECTS,
            SupportSymbol::ReadValue => exports::READ_VALUE,
            SupportSymbol::EmitRequest => "$emit_request",
            SupportSymbol::EffectResume => exports::EFFECT_RESUME,
        }
    }

    /// Whether the function is exported under [`SupportSymbol::name`].
    pub fn is_exported(self) -> bool {
        matches!(
            self,
            SupportSymbol::EffectStatus
                | SupportSymbol::EffectCont
                | SupportSymbol::EffectLen
                | SupportSymbol::InitEffects
                | SupportSymbol::ReadValue
                | SupportSymbol::EffectResume
        )
    }

    fn signature(self) -> (Vec<ValType>, Vec<ValType>) {
        use ValType::{AnyRef, I32, I64};
        match self {
            SupportSymbol::MakeDone => (vec![I64, AnyRef], vec![AnyRef]),
            SupportSymbol::MakeReturned => (vec![I64, AnyRef, AnyRef], vec![AnyRef]),
            SupportSymbol::OwnsReturn => (vec![AnyRef, AnyRef], vec![I32]),
            SupportSymbol::SuspendWith => (vec![AnyRef, AnyRef], vec![AnyRef]),
            SupportSymbol::SuspendRequest => (vec![I32, AnyRef, AnyRef], vec![AnyRef]),
            SupportSymbol::ResumeCont => (vec![AnyRef, I64, AnyRef], vec![AnyRef]),
            SupportSymbol::MakeHCont => (vec![AnyRef, AnyRef, I32, I32], vec![AnyRef]),
            SupportSymbol::Dispatch | SupportSymbol::DispatchDirect => (vec![AnyRef, I32, I32, AnyRef], vec![AnyRef]),
            SupportSymbol::HandleResult => (vec![AnyRef, AnyRef], vec![AnyRef]),
            SupportSymbol::InvokeCont => (vec![AnyRef, I64, AnyRef, I32], vec![AnyRef]),
            SupportSymbol::TailFinalize => (vec![AnyRef], vec![]),
            SupportSymbol::EffectStatus | SupportSymbol::EffectLen | SupportSymbol::EmitRequest => {
                (vec![AnyRef], vec![I32])
            }
            SupportSymbol::EffectCont => (vec![AnyRef], vec![AnyRef]),
            SupportSymbol::InitEffects => (vec![], vec![]),
            SupportSymbol::ReadValue => (vec![I32, I32], vec![I64]),
            SupportSymbol::EffectResume => (vec![AnyRef, I32, I32], vec![AnyRef]),
        }
    }
}

impl<'a> CodegenContext<'a> {
    /// The support function for `symbol`, reserved on first request.
    pub fn support(&mut self, symbol: SupportSymbol) -> FuncIdx {
        if let Some(idx) = self.support.get(&symbol) {
            return *idx;
        }
        let idx = self.module.reserve_function(symbol.name());
        if symbol.is_exported() {
            self.module.export(symbol.name(), idx);
        }
        tracing::trace!(support = symbol.name(), index = idx, "requested support function");
        self.support.insert(symbol, idx);
        self.support_pending.push((symbol, idx));
        idx
    }

    pub(super) fn emit_support(&mut self, symbol: SupportSymbol, idx: FuncIdx) -> Result<(), Diagnostic> {
        let (params, results) = symbol.signature();
        let mut fb = FunctionBuilder::new(params.len() as u32);
        match symbol {
            SupportSymbol::MakeDone => self.emit_make_done(&mut fb),
            SupportSymbol::MakeReturned => {
                let er = self.layout.effect_result;
                let status = fb.i32_const(effect_result::RETURNED);
                let null = fb.null();
                let len = fb.i32_const(0);
                let out = fb.new_struct(er, vec![status, 0, 1, null, 2, len]);
                fb.ret(out);
            }
            SupportSymbol::OwnsReturn => self.emit_owns_return(&mut fb),
            SupportSymbol::SuspendWith => self.emit_suspend_with(&mut fb),
            SupportSymbol::SuspendRequest => self.emit_suspend_request(&mut fb),
            SupportSymbol::ResumeCont => self.emit_resume_cont(&mut fb),
            SupportSymbol::MakeHCont => self.emit_make_hcont(&mut fb),
            SupportSymbol::Dispatch => self.emit_dispatch(&mut fb, false),
            SupportSymbol::DispatchDirect => self.emit_dispatch(&mut fb, true),
            SupportSymbol::HandleResult => self.emit_handle_result(&mut fb),
            SupportSymbol::InvokeCont => self.emit_invoke_cont(&mut fb),
            SupportSymbol::TailFinalize => self.emit_tail_finalize(&mut fb),
            SupportSymbol::EffectStatus => self.emit_result_field(&mut fb, effect_result::STATUS, ValType::I32),
            SupportSymbol::EffectCont => self.emit_result_field(&mut fb, effect_result::CONT, ValType::AnyRef),
            SupportSymbol::EffectLen => self.emit_result_field(&mut fb, effect_result::LEN, ValType::I32),
            SupportSymbol::InitEffects => {
                let one = fb.i32_const(1);
                fb.emit(Instr::GlobalSet {
                    global: self.ready,
                    src: one,
                });
                fb.emit(Instr::Return { value: None });
            }
            SupportSymbol::ReadValue => {
                let dst = fb.reg(ValType::I64);
                fb.emit(Instr::Load64 { dst, addr: 0, offset: 0 });
                fb.ret(dst);
            }
            SupportSymbol::EmitRequest => self.emit_emit_request(&mut fb)?,
            SupportSymbol::EffectResume => self.emit_effect_resume(&mut fb)?,
        }
        let ty = self.module.func_type(params.clone(), results);
        let function = fb.finish(symbol.name(), ty, &params).map_err(ice)?;
        self.module.define_function(idx, function).map_err(ice)?;
        tracing::debug!(support = symbol.name(), "emitted support function");
        Ok(())
    }

    fn emit_make_done(&mut self, fb: &mut FunctionBuilder) {
        let status = fb.i32_const(effect_result::DONE);
        let null = fb.null();
        let len = fb.i32_const(0);
        let out = fb.new_struct(self.layout.effect_result, vec![status, 0, 1, null, null, len]);
        fb.ret(out);
    }

    /// Walk the parents of the returned result's frame looking for `frame`.
    fn emit_owns_return(&mut self, fb: &mut FunctionBuilder) {
        let er = self.layout.effect_result;
        let fr = self.layout.frame;
        let r = fb.cast(1, er);
        let cursor = fb.get(r, er, effect_result::REQUEST, ValType::AnyRef);
        let head = fb.new_label();
        let next = fb.new_label();
        let found = fb.new_label();
        fb.bind(head);
        let is_null = fb.reg(ValType::I32);
        fb.emit(Instr::RefIsNull { dst: is_null, src: cursor });
        fb.branch_if_not(is_null, next);
        let no = fb.i32_const(0);
        fb.ret(no);
        fb.bind(next);
        let same = fb.reg(ValType::I32);
        fb.emit(Instr::RefEq {
            dst: same,
            lhs: cursor,
            rhs: 0,
        });
        fb.branch_if(same, found);
        let f = fb.cast(cursor, fr);
        let parent = fb.get(f, fr, frame::PARENT, ValType::AnyRef);
        fb.emit(Instr::Move { dst: cursor, src: parent });
        fb.jump(head);
        fb.bind(found);
        let yes = fb.i32_const(1);
        fb.ret(yes);
    }

    fn emit_suspend_with(&mut self, fb: &mut FunctionBuilder) {
        let er = self.layout.effect_result;
        let r = fb.cast(0, er);
        let req = fb.get(r, er, effect_result::REQUEST, ValType::AnyRef);
        let len = fb.get(r, er, effect_result::LEN, ValType::I32);
        let status = fb.i32_const(effect_result::SUSPENDED);
        let zero = fb.i64_const(0);
        let null = fb.null();
        let out = fb.new_struct(er, vec![status, zero, null, 1, req, len]);
        fb.ret(out);
    }

    fn emit_suspend_request(&mut self, fb: &mut FunctionBuilder) {
        let req = fb.new_struct(self.layout.request, vec![0, 1, 2]);
        let status = fb.i32_const(effect_result::SUSPENDED);
        let zero = fb.i64_const(0);
        let null = fb.null();
        let len = fb.i32_const(0);
        let out = fb.new_struct(self.layout.effect_result, vec![status, zero, null, null, req, len]);
        fb.ret(out);
    }

    fn emit_resume_cont(&mut self, fb: &mut FunctionBuilder) {
        let call = fb.new_label();
        let is_null = fb.reg(ValType::I32);
        fb.emit(Instr::RefIsNull { dst: is_null, src: 0 });
        fb.branch_if_not(is_null, call);
        let make_done = self.support(SupportSymbol::MakeDone);
        let done = fb.call(make_done, vec![1, 2], ValType::AnyRef);
        fb.ret(done);
        fb.bind(call);
        let c = fb.cast(0, self.layout.cont);
        let func = fb.get(c, self.layout.cont, cont::FUNC, ValType::FuncRef);
        let env = fb.get(c, self.layout.cont, cont::ENV, ValType::AnyRef);
        let out = fb.reg(ValType::AnyRef);
        fb.emit(Instr::CallRef {
            dst: Some(out),
            ty: self.layout.cont_fn,
            callee: func,
            args: vec![env, 1, 2],
        });
        fb.ret(out);
    }

    fn emit_make_hcont(&mut self, fb: &mut FunctionBuilder) {
        // Labels live in the operation table as `ptr | len << 32`.
        let base = fb.reg(ValType::I32);
        fb.emit(Instr::GlobalGet {
            dst: base,
            global: self.op_table,
        });
        let eight = fb.i32_const(8);
        let offset = binary(fb, BinaryOp::I32Mul, 2, eight, ValType::I32);
        let addr = binary(fb, BinaryOp::I32Add, base, offset, ValType::I32);
        let word = fb.reg(ValType::I64);
        fb.emit(Instr::Load64 { dst: word, addr, offset: 0 });
        let ptr = unary(fb, UnaryOp::I32WrapI64, word, ValType::I32);
        let shift = fb.i64_const(32);
        let high = binary(fb, BinaryOp::I64ShrU, word, shift, ValType::I64);
        let len = unary(fb, UnaryOp::I32WrapI64, high, ValType::I32);
        let zero = fb.i32_const(0);
        let out = fb.new_struct(self.layout.hcont, vec![0, 1, 3, zero, zero, ptr, len]);
        fb.ret(out);
    }

    /// Find the frame handling `op`. Tail operations run their clause in
    /// place; everything else suspends towards the frame (or the host).
    fn emit_dispatch(&mut self, fb: &mut FunctionBuilder, direct: bool) {
        let fr = self.layout.frame;
        let suspend_request = self.support(SupportSymbol::SuspendRequest);
        let found = fb.new_label();
        let cursor = fb.reg(ValType::AnyRef);
        fb.emit(Instr::Move { dst: cursor, src: 0 });
        if !direct {
            let head = fb.new_label();
            let next = fb.new_label();
            fb.bind(head);
            let is_null = fb.reg(ValType::I32);
            fb.emit(Instr::RefIsNull { dst: is_null, src: cursor });
            fb.branch_if_not(is_null, next);
            let null = fb.null();
            let out = fb.call(suspend_request, vec![1, 3, null], ValType::AnyRef);
            fb.ret(out);
            fb.bind(next);
            let f = fb.cast(cursor, fr);
            let first = fb.get(f, fr, frame::FIRST_OP, ValType::I32);
            let count = fb.get(f, fr, frame::OP_COUNT, ValType::I32);
            let end = binary(fb, BinaryOp::I32Add, first, count, ValType::I32);
            let skip = fb.new_label();
            let below = binary(fb, BinaryOp::I32LtS, 1, first, ValType::I32);
            fb.branch_if(below, skip);
            let inside = binary(fb, BinaryOp::I32LtS, 1, end, ValType::I32);
            fb.branch_if(inside, found);
            fb.bind(skip);
            let parent = fb.get(f, fr, frame::PARENT, ValType::AnyRef);
            fb.emit(Instr::Move { dst: cursor, src: parent });
            fb.jump(head);
        }
        fb.bind(found);
        let in_place = fb.new_label();
        let tail = fb.i32_const(hcont::KIND_TAIL);
        let is_tail = binary(fb, BinaryOp::I32Eq, 2, tail, ValType::I32);
        fb.branch_if(is_tail, in_place);
        let out = fb.call(suspend_request, vec![1, 3, cursor], ValType::AnyRef);
        fb.ret(out);
        fb.bind(in_place);
        let null = fb.null();
        let out = self.call_clause(fb, cursor, 1, 3, null, 2);
        fb.ret(out);
    }

    /// Call the clause of `frame_ref` for `op` with a fresh handler
    /// continuation over `chain`.
    fn call_clause(&mut self, fb: &mut FunctionBuilder, frame_ref: Reg, op: Reg, args: Reg, chain: Reg, kind: Reg) -> Reg {
        let fr = self.layout.frame;
        let make_hcont = self.support(SupportSymbol::MakeHCont);
        let f = fb.cast(frame_ref, fr);
        let first = fb.get(f, fr, frame::FIRST_OP, ValType::I32);
        let index = binary(fb, BinaryOp::I32Sub, op, first, ValType::I32);
        let clauses = fb.get(f, fr, frame::CLAUSES, ValType::AnyRef);
        let clauses = fb.cast(clauses, self.layout.clause_array);
        let clause = fb.reg(ValType::FuncRef);
        fb.emit(Instr::ArrayGet {
            dst: clause,
            array: clauses,
            index,
        });
        let env = fb.get(f, fr, frame::ENV, ValType::AnyRef);
        let k = fb.call(make_hcont, vec![chain, frame_ref, op, kind], ValType::AnyRef);
        let out = fb.reg(ValType::AnyRef);
        fb.emit(Instr::CallRef {
            dst: Some(out),
            ty: self.layout.clause_fn,
            callee: clause,
            args: vec![env, args, k],
        });
        out
    }

    fn emit_handle_result(&mut self, fb: &mut FunctionBuilder) {
        let er = self.layout.effect_result;
        let pass = fb.new_label();
        let r = fb.cast(1, er);
        let status = fb.get(r, er, effect_result::STATUS, ValType::I32);
        let suspended = fb.i32_const(effect_result::SUSPENDED);
        let is_suspended = binary(fb, BinaryOp::I32Eq, status, suspended, ValType::I32);
        fb.branch_if_not(is_suspended, pass);
        let req = fb.get(r, er, effect_result::REQUEST, ValType::AnyRef);
        let req = fb.cast(req, self.layout.request);
        let target = fb.get(req, self.layout.request, request::FRAME, ValType::AnyRef);
        let mine = fb.reg(ValType::I32);
        fb.emit(Instr::RefEq {
            dst: mine,
            lhs: target,
            rhs: 0,
        });
        fb.branch_if_not(mine, pass);
        let op = fb.get(req, self.layout.request, request::OP_INDEX, ValType::I32);
        let args = fb.get(req, self.layout.request, request::ARGS, ValType::AnyRef);
        let chain = fb.get(r, er, effect_result::CONT, ValType::AnyRef);
        let kind = fb.i32_const(hcont::KIND_RESUME);
        let out = self.call_clause(fb, 0, op, args, chain, kind);
        fb.ret(out);
        fb.bind(pass);
        fb.ret(1);
    }

    fn emit_invoke_cont(&mut self, fb: &mut FunctionBuilder) {
        let hc = self.layout.hcont;
        let k = fb.cast(0, hc);
        let label_ptr = fb.get(k, hc, hcont::LABEL_PTR, ValType::I32);
        let label_len = fb.get(k, hc, hcont::LABEL_LEN, ValType::I32);

        let live = fb.new_label();
        let ended = fb.get(k, hc, hcont::ENDED, ValType::I32);
        fb.branch_if_not(ended, live);
        let calls = fb.get(k, hc, hcont::CALLS, ValType::I32);
        fb.emit(Instr::Trap {
            kind: TrapKind::ContinuationEnded,
            args: vec![label_ptr, label_len, calls],
        });
        fb.bind(live);

        let calls = fb.get(k, hc, hcont::CALLS, ValType::I32);
        let one = fb.i32_const(1);
        let calls = binary(fb, BinaryOp::I32Add, calls, one, ValType::I32);
        fb.emit(Instr::StructSet {
            obj: k,
            ty: hc,
            field: hcont::CALLS,
            src: calls,
        });

        let keep = fb.new_label();
        let end_mode = fb.i32_const(hcont::MODE_END);
        let is_end = binary(fb, BinaryOp::I32Eq, 3, end_mode, ValType::I32);
        fb.branch_if_not(is_end, keep);
        fb.emit(Instr::StructSet {
            obj: k,
            ty: hc,
            field: hcont::ENDED,
            src: one,
        });
        fb.bind(keep);

        let resume = fb.new_label();
        let kind = fb.get(k, hc, hcont::KIND, ValType::I32);
        let tail = fb.i32_const(hcont::KIND_TAIL);
        let is_tail = binary(fb, BinaryOp::I32Eq, kind, tail, ValType::I32);
        fb.branch_if_not(is_tail, resume);
        let once = fb.new_label();
        let over = binary(fb, BinaryOp::I32GtS, calls, one, ValType::I32);
        fb.branch_if_not(over, once);
        fb.emit(Instr::Trap {
            kind: TrapKind::TailResumption,
            args: vec![label_ptr, label_len, calls],
        });
        fb.bind(once);
        let make_done = self.support(SupportSymbol::MakeDone);
        let done = fb.call(make_done, vec![1, 2], ValType::AnyRef);
        fb.ret(done);

        fb.bind(resume);
        let chain = fb.get(k, hc, hcont::CHAIN, ValType::AnyRef);
        let frame_ref = fb.get(k, hc, hcont::FRAME, ValType::AnyRef);
        let resume_cont = self.support(SupportSymbol::ResumeCont);
        let handle_result = self.support(SupportSymbol::HandleResult);
        let r = fb.call(resume_cont, vec![chain, 1, 2], ValType::AnyRef);
        let out = fb.call(handle_result, vec![frame_ref, r], ValType::AnyRef);
        fb.ret(out);
    }

    fn emit_tail_finalize(&mut self, fb: &mut FunctionBuilder) {
        let hc = self.layout.hcont;
        let k = fb.cast(0, hc);
        let ok = fb.new_label();
        let calls = fb.get(k, hc, hcont::CALLS, ValType::I32);
        let one = fb.i32_const(1);
        let exactly_once = binary(fb, BinaryOp::I32Eq, calls, one, ValType::I32);
        fb.branch_if(exactly_once, ok);
        let label_ptr = fb.get(k, hc, hcont::LABEL_PTR, ValType::I32);
        let label_len = fb.get(k, hc, hcont::LABEL_LEN, ValType::I32);
        fb.emit(Instr::Trap {
            kind: TrapKind::TailResumption,
            args: vec![label_ptr, label_len, calls],
        });
        fb.bind(ok);
        fb.emit(Instr::Return { value: None });
    }

    fn emit_result_field(&mut self, fb: &mut FunctionBuilder, field: u32, val: ValType) {
        let er = self.layout.effect_result;
        let r = fb.cast(0, er);
        let out = fb.get(r, er, field, val);
        fb.ret(out);
    }
}

pub(super) fn binary(fb: &mut FunctionBuilder, op: BinaryOp, lhs: Reg, rhs: Reg, ty: ValType) -> Reg {
    let dst = fb.reg(ty);
    fb.emit(Instr::Binary { op, dst, lhs, rhs });
    dst
}

pub(super) fn unary(fb: &mut FunctionBuilder, op: UnaryOp, src: Reg, ty: ValType) -> Reg {
    let dst = fb.reg(ty);
    fb.emit(Instr::Unary { op, dst, src });
    dst
}
