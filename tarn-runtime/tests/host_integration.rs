//! End-to-end tests: build programs, compile them with `tarnc` and run them
//! on the host runtime.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use tarn_runtime::{Continuation, Handled, HostRuntime, HostValue, RuntimeConfig, RuntimeError, TaskState};
use tarnc::config::CompileOptions;
use tarnc::hir::{op, tail_op, BodyBuilder, DefId, Expr, Program, ProgramBuilder, Type};
use tarnc::protocol::PayloadKind;

fn load(program: &Program) -> HostRuntime {
    let compiled = tarnc::compile_program(program, &CompileOptions::default()).expect("program compiles");
    HostRuntime::new(&compiled.to_bytes(), RuntimeConfig::default()).expect("module loads")
}

/// `twice(x) { let a = await(x); let b = await(a); a + b }`
fn twice(pb: &mut ProgramBuilder, async_fx: DefId) -> DefId {
    let def = pb.fresh_def();
    let b = BodyBuilder::new();
    let x = b.param("x", Type::I32);
    let a = b.constant("a", Type::I32);
    let c = b.constant("b", Type::I32);
    let body = b.block(
        vec![
            b.let_(a, b.perform(async_fx, 0, Type::I32, vec![b.var(x)])),
            b.let_(c, b.perform(async_fx, 0, Type::I32, vec![b.var(a)])),
        ],
        Some(b.add(b.var(a), b.var(c))),
    );
    pb.function(b.finish(def, "twice", Type::I32, body))
}

/// `main() { twice(6) + 6 }`, performing `Async.await` towards the host.
fn nested_await_program() -> Program {
    let mut pb = ProgramBuilder::new("app");
    let async_fx = pb.effect("Async", vec![op("await", vec![Type::I32], Type::I32)]);
    let twice = twice(&mut pb, async_fx);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.add(b.call(twice, Type::I32, vec![b.int(6)]), b.int(6));
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));
    pb.finish()
}

/// `main() { Log.write(1); 7 }` with `write` a tail operation.
fn tail_log_program() -> Program {
    let mut pb = ProgramBuilder::new("app");
    let log = pb.effect("Log", vec![tail_op("write", vec![Type::I32], Type::Unit)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.block(
        vec![b.stmt(b.perform(log, 0, Type::Unit, vec![b.int(1)]))],
        Some(b.int(7)),
    );
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));
    pb.finish()
}

#[test]
fn test_host_handler_folds_nested_awaits() {
    let mut rt = load(&nested_await_program());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let key = rt.op_by_label("Async.await").expect("op published").key();
    let log = Rc::clone(&seen);
    rt.register(key, move |call| {
        let x = call.arg(0).unwrap_or_default();
        log.borrow_mut().push(x);
        Ok(Handled::Resumed(call.cont.resume(x)?))
    });

    assert_eq!(rt.run("main", vec![]).unwrap(), HostValue::Int(18));
    assert_eq!(*seen.borrow(), vec![6, 6]);
}

#[test]
fn test_in_module_handler_folds_nested_awaits() {
    let mut pb = ProgramBuilder::new("app");
    let async_fx = pb.effect("Async", vec![op("await", vec![Type::I32], Type::I32)]);
    let twice = twice(&mut pb, async_fx);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let v = b.constant("v", Type::I32);
    let k = b.constant("k", Type::cont(Type::I32, Type::I32));
    let body = b.handle(
        b.add(b.call(twice, Type::I32, vec![b.int(6)]), b.int(6)),
        async_fx,
        vec![],
        vec![b.clause(0, vec![v], k, b.resume(k, b.var(v)))],
    );
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));

    let mut rt = load(&pb.finish());
    assert_eq!(rt.run("main", vec![]).unwrap(), HostValue::Int(18));
}

#[test]
fn test_handler_key_string_registration() {
    let mut rt = load(&nested_await_program());
    let key = rt.op_by_label("Async.await").unwrap().key().to_string();
    rt.register_handler_key(&key, |call| {
        let x = call.arg(0).unwrap_or_default();
        Ok(Handled::Resumed(call.cont.resume(x + 1)?))
    })
    .unwrap();
    // await(6) = 7, await(7) = 8
    assert_eq!(rt.run("main", vec![]).unwrap(), HostValue::Int(21));
}

#[test]
fn test_malformed_handler_key_is_rejected() {
    let mut rt = load(&nested_await_program());
    let err = rt
        .register_handler_key("no-colons", |_| Ok(Handled::Pending))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::HandlerKey(_)));
}

#[test]
fn test_mismatched_signature_hash_is_unhandled() {
    let mut rt = load(&nested_await_program());
    let op = rt.op_by_label("Async.await").unwrap().clone();
    rt.register_handler(
        op.effect_id.as_str(),
        op.op_id.0,
        op.signature_hash.as_u64() ^ 1,
        |call| Ok(Handled::Resumed(call.cont.resume(0)?)),
    );

    let err = rt.run("main", vec![]).unwrap_err();
    assert!(err.to_string().contains("Unhandled effect"), "{}", err);
}

#[test]
fn test_tail_continuation_never_resumed() {
    let mut rt = load(&tail_log_program());
    let key = rt.op_by_label("Log.write").unwrap().key();
    rt.register(key, |_| Ok(Handled::Pending));

    let task = rt.spawn("main", vec![]).unwrap();
    let err = rt.run_until_idle().unwrap_err();
    assert!(err.to_string().to_lowercase().contains("resumed exactly once"), "{}", err);
    assert_eq!(rt.task_state(task), Some(TaskState::Failed));
}

#[test]
fn test_tail_continuation_resumed_twice() {
    let mut rt = load(&tail_log_program());
    let key = rt.op_by_label("Log.write").unwrap().key();
    rt.register(key, |call| {
        call.cont.tail(0)?;
        Ok(Handled::Resumed(call.cont.tail(0)?))
    });

    let err = rt.run("main", vec![]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "tail continuation `Log.write` must be resumed exactly once (observed 2 calls)"
    );
}

#[test]
fn test_tail_continuation_resumed_once() {
    let mut rt = load(&tail_log_program());
    let key = rt.op_by_label("Log.write").unwrap().key();
    let written = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&written);
    rt.register(key, move |call| {
        sink.borrow_mut().push(call.arg(0).unwrap_or_default());
        Ok(Handled::Resumed(call.cont.tail(0)?))
    });

    assert_eq!(rt.run("main", vec![]).unwrap(), HostValue::Int(7));
    assert_eq!(*written.borrow(), vec![1]);
}

#[test]
fn test_unsupported_host_type_is_a_compile_error() {
    let mut pb = ProgramBuilder::new("app");
    let point = pb.structure("Point", 0, vec![("x", Type::I32), ("y", Type::I32)]);
    let point_ty = Type::structure(point, vec![]);
    let draw = pb.effect("Draw", vec![op("draw", vec![point_ty], Type::Unit)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.perform(
        draw,
        0,
        Type::Unit,
        vec![b.struct_lit(point, vec![], vec![b.int(1), b.int(2)])],
    );
    pb.function(b.finish(main, "main", Type::Unit, body).exported("main"));

    let errors = tarnc::compile_program(&pb.finish(), &CompileOptions::default()).unwrap_err();
    assert!(errors.iter().any(|d| d.message.contains("unsupported type")));
    assert!(errors.iter().any(|d| d.code.as_deref() == Some("CG0001")));
}

/// `count(n) { let i = 0; let s = 0; while i < n { s = s + tick(i); i = i + 1 }; s }`
fn counting_program() -> Program {
    let mut pb = ProgramBuilder::new("app");
    let tick = pb.effect("Tick", vec![op("tick", vec![Type::I32], Type::I32)]);
    let count = pb.fresh_def();
    let b = BodyBuilder::new();
    let n = b.param("n", Type::I32);
    let i = b.local("i", Type::I32);
    let s = b.local("s", Type::I32);
    let step = b.block(
        vec![
            b.stmt(b.assign(s, b.add(b.var(s), b.perform(tick, 0, Type::I32, vec![b.var(i)])))),
            b.stmt(b.assign(i, b.add(b.var(i), b.int(1)))),
        ],
        None,
    );
    let body = b.block(
        vec![
            b.let_(i, b.int(0)),
            b.let_(s, b.int(0)),
            b.stmt(b.while_loop(b.lt(b.var(i), b.var(n)), step)),
        ],
        Some(b.var(s)),
    );
    pb.function(b.finish(count, "count", Type::I32, body).exported("count"));
    pb.finish()
}

fn run_counting(n: i64) -> (HostValue, Vec<i64>) {
    let mut rt = load(&counting_program());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    let key = rt.op_by_label("Tick.tick").unwrap().key();
    rt.register(key, move |call| {
        let i = call.arg(0).unwrap_or_default();
        log.borrow_mut().push(i);
        Ok(Handled::Resumed(call.cont.resume(i + 1)?))
    });
    let value = rt.run("count", vec![n]).unwrap();
    let seen = seen.borrow().clone();
    (value, seen)
}

#[test]
fn test_resuming_inside_loop_does_not_repeat_iterations() {
    let (value, seen) = run_counting(4);
    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert_eq!(value, HostValue::Int(10));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Every iteration performs exactly once, in order.
    #[test]
    fn loop_performs_once_per_iteration(n in 0i64..8) {
        let (value, seen) = run_counting(n);
        prop_assert_eq!(seen, (0..n).collect::<Vec<_>>());
        prop_assert_eq!(value, HostValue::Int(n * (n + 1) / 2));
    }
}

#[test]
fn test_resume_continuation_is_multi_shot() {
    let mut pb = ProgramBuilder::new("app");
    let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.add(b.perform(ask, 0, Type::I32, vec![]), b.int(100));
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));

    let mut rt = load(&pb.finish());
    let stash: Rc<RefCell<Option<Continuation>>> = Rc::default();
    let slot = Rc::clone(&stash);
    let key = rt.op_by_label("Ask.ask").unwrap().key();
    rt.register(key, move |call| {
        *slot.borrow_mut() = Some(call.cont.clone());
        Ok(Handled::Resumed(call.cont.resume(1)?))
    });

    let task = rt.spawn("main", vec![]).unwrap();
    rt.run_until_idle().unwrap();
    assert_eq!(rt.task_result(task), Some(HostValue::Int(101)));

    let k = stash.borrow_mut().take().unwrap();
    k.resume(2).unwrap();
    rt.run_until_idle().unwrap();
    assert_eq!(rt.task_result(task), Some(HostValue::Int(101)));
    assert_eq!(rt.later_results(task), vec![HostValue::Int(102)]);

    k.end(3).unwrap();
    assert!(k.resume(4).is_err());
    rt.run_until_idle().unwrap();
    assert_eq!(rt.later_results(task), vec![HostValue::Int(102), HostValue::Int(103)]);
}

#[test]
fn test_dropping_resume_continuation_cancels_task() {
    let mut rt = load(&nested_await_program());
    let key = rt.op_by_label("Async.await").unwrap().key();
    rt.register(key, |_| Ok(Handled::Pending));

    let task = rt.spawn("main", vec![]).unwrap();
    rt.run_until_idle().unwrap();
    assert_eq!(rt.task_state(task), Some(TaskState::Cancelled));
    assert!(matches!(rt.run("main", vec![]), Err(RuntimeError::Cancelled(_))));
}

#[test]
fn test_generic_instances_dispatch_separately() {
    let mut pb = ProgramBuilder::new("app");
    let put = pb.effect_with("Put", None, 1, vec![op("put", vec![Type::Param(0)], Type::Param(0))]);
    let relay = pb.fresh_def();
    let b = BodyBuilder::new();
    let x = b.param("x", Type::Param(0));
    let y = b.constant("y", Type::Param(0));
    let body = b.block(
        vec![b.let_(y, b.perform_generic(put, vec![Type::Param(0)], 0, Type::Param(0), vec![b.var(x)]))],
        Some(b.var(y)),
    );
    pb.function(b.finish(relay, "relay", Type::Param(0), body).with_generics(1));

    let signed = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.add(b.call_generic(relay, vec![Type::I32], Type::I32, vec![b.int(5)]), b.int(1));
    pb.function(b.finish(signed, "signed", Type::I32, body).exported("signed"));

    let unsigned = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.call_generic(relay, vec![Type::U32], Type::U32, vec![b.int_of(7, Type::U32)]);
    pb.function(b.finish(unsigned, "unsigned", Type::U32, body).exported("unsigned"));

    let mut rt = load(&pb.finish());
    let i32_op = rt.op_by_label("Put<i32>.put").unwrap().clone();
    let u32_op = rt.op_by_label("Put<u32>.put").unwrap().clone();
    assert_eq!(i32_op.effect_id, u32_op.effect_id);
    assert_ne!(i32_op.signature_hash, u32_op.signature_hash);

    rt.register(i32_op.key(), |call| {
        let v = call.arg(0).unwrap_or_default();
        Ok(Handled::Resumed(call.cont.resume(v * 2)?))
    });
    rt.register(u32_op.key(), |call| {
        let v = call.arg(0).unwrap_or_default();
        Ok(Handled::Resumed(call.cont.resume(v * 3)?))
    });

    assert_eq!(rt.run("signed", vec![]).unwrap(), HostValue::Int(11));
    assert_eq!(rt.run("unsigned", vec![]).unwrap(), HostValue::Int(21));
}

#[test]
fn test_unknown_export_and_arity() {
    let mut rt = load(&counting_program());
    assert!(matches!(rt.spawn("nope", vec![]), Err(RuntimeError::UnknownExport(_))));
    assert!(matches!(
        rt.spawn("count", vec![]),
        Err(RuntimeError::ArgumentCount { expected: 1, found: 0, .. })
    ));
}

/// `main() { handle { body(await, ask) } with ask(k) => resume k(10) }`, where
/// `await` goes to the host and `ask` is answered in the module.
fn mixed_program(body: impl FnOnce(&BodyBuilder, DefId, DefId) -> Expr) -> Program {
    let mut pb = ProgramBuilder::new("app");
    let async_fx = pb.effect("Async", vec![op("await", vec![Type::I32], Type::I32)]);
    let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = body(&b, async_fx, ask);
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));
    pb.finish()
}

fn run_doubling_awaits(program: &Program) -> HostValue {
    let mut rt = load(program);
    let key = rt.op_by_label("Async.await").unwrap().key();
    rt.register(key, |call| {
        let x = call.arg(0).unwrap_or_default();
        Ok(Handled::Resumed(call.cont.resume(x * 2)?))
    });
    rt.run("main", vec![]).unwrap()
}

#[test]
fn test_in_module_op_after_host_resume() {
    // handle { let a = await(4); a + ask() } with ask(k) => resume k(10)
    let program = mixed_program(|b, async_fx, ask| {
        let a = b.constant("a", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let handled = b.block(
            vec![b.let_(a, b.perform(async_fx, 0, Type::I32, vec![b.int(4)]))],
            Some(b.add(b.var(a), b.perform(ask, 0, Type::I32, vec![]))),
        );
        b.handle(handled, ask, vec![], vec![b.clause(0, vec![], k, b.resume(k, b.int(10)))])
    });
    assert_eq!(run_doubling_awaits(&program), HostValue::Int(18));
}

#[test]
fn test_outer_local_survives_host_suspension() {
    // let total = 1;
    // handle { total = total + await(2); total = total + ask() } with ask(k) => resume k(10);
    // total
    let program = mixed_program(|b, async_fx, ask| {
        let total = b.local("total", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::Unit));
        let awaited = b.perform(async_fx, 0, Type::I32, vec![b.int(2)]);
        let asked = b.perform(ask, 0, Type::I32, vec![]);
        let handled = b.block(
            vec![b.stmt(b.assign(total, b.add(b.var(total), awaited)))],
            Some(b.assign(total, b.add(b.var(total), asked))),
        );
        b.block(
            vec![
                b.let_(total, b.int(1)),
                b.stmt(b.handle(handled, ask, vec![], vec![b.clause(0, vec![], k, b.resume(k, b.int(10)))])),
            ],
            Some(b.var(total)),
        )
    });
    assert_eq!(run_doubling_awaits(&program), HostValue::Int(15));
}

#[test]
fn test_return_from_handled_body_after_host_resume() {
    // let x = handle { let a = await(4); return a + 1; 0 } with ask(k) => resume k(10);
    // x + 100
    let program = mixed_program(|b, async_fx, ask| {
        let a = b.constant("a", Type::I32);
        let x = b.constant("x", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let handled = b.block(
            vec![
                b.let_(a, b.perform(async_fx, 0, Type::I32, vec![b.int(4)])),
                b.stmt(b.ret(b.add(b.var(a), b.int(1)))),
            ],
            Some(b.int(0)),
        );
        let handle = b.handle(handled, ask, vec![], vec![b.clause(0, vec![], k, b.resume(k, b.int(10)))]);
        b.block(vec![b.let_(x, handle)], Some(b.add(b.var(x), b.int(100))))
    });
    assert_eq!(run_doubling_awaits(&program), HostValue::Int(9));
}

/// `Meters { value: i64 }` crosses the boundary through a serializer pair:
/// `encode` adds 1000 to the value, `decode` wraps the word as is.
///
/// `main(m: Meters) -> Meters { let s = scale(m); Meters { value: s.value + 1 } }`
fn serialized_program() -> Program {
    let mut pb = ProgramBuilder::new("app");
    let meters = pb.structure("Meters", 0, vec![("value", Type::I64)]);
    let meters_ty = Type::structure(meters, vec![]);
    let measure = pb.effect("Measure", vec![op("scale", vec![meters_ty.clone()], meters_ty.clone())]);

    let encode = pb.fresh_def();
    let b = BodyBuilder::new();
    let m = b.param("m", meters_ty.clone());
    let body = b.add(b.field(b.var(m), 0, Type::I64), b.int_of(1000, Type::I64));
    pb.function(b.finish(encode, "encode_meters", Type::I64, body));

    let decode = pb.fresh_def();
    let b = BodyBuilder::new();
    let w = b.param("w", Type::I64);
    let body = b.struct_lit(meters, vec![], vec![b.var(w)]);
    pb.function(b.finish(decode, "decode_meters", meters_ty.clone(), body));
    pb.serializer(meters_ty.clone(), encode, decode);

    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let m = b.param("m", meters_ty.clone());
    let s = b.constant("s", meters_ty.clone());
    let body = b.block(
        vec![b.let_(s, b.perform(measure, 0, meters_ty.clone(), vec![b.var(m)]))],
        Some(b.struct_lit(
            meters,
            vec![],
            vec![b.add(b.field(b.var(s), 0, Type::I64), b.int_of(1, Type::I64))],
        )),
    );
    pb.function(b.finish(main, "main", meters_ty, body).exported("main"));
    pb.finish()
}

#[test]
fn test_serializer_pair_marshals_payloads() {
    let mut rt = load(&serialized_program());
    let scale = rt.op_by_label("Measure.scale").unwrap().clone();
    assert_eq!(scale.params, vec![PayloadKind::Serialized]);
    assert_eq!(scale.result, PayloadKind::Serialized);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    rt.register(scale.key(), move |call| {
        let word = call.arg(0).unwrap_or_default();
        log.borrow_mut().push(word);
        Ok(Handled::Resumed(call.cont.resume(word * 2)?))
    });

    // decode(5) = 5, encode = 1005; decode(2010) + 1 = 2011, encode = 3011
    assert_eq!(rt.run("main", vec![5]).unwrap(), HostValue::Serialized(3011));
    assert_eq!(*seen.borrow(), vec![1005]);
}
