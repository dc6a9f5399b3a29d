//! Handlers installed by the module itself: resumption loops, shared locals,
//! early returns and the tail-operation guard.

use tarn_runtime::{HostRuntime, HostValue, RuntimeConfig};
use tarnc::config::CompileOptions;
use tarnc::hir::{op, tail_op, BodyBuilder, DefId, Expr, LocalId, Program, ProgramBuilder, Type};

fn load(program: &Program) -> HostRuntime {
    let compiled = tarnc::compile_program(program, &CompileOptions::default()).expect("program compiles");
    HostRuntime::new(&compiled.to_bytes(), RuntimeConfig::default()).expect("module loads")
}

/// A module exporting `main() -> i32` with `body`.
fn main_program(build: impl FnOnce(&mut ProgramBuilder, &BodyBuilder) -> Expr) -> Program {
    let mut pb = ProgramBuilder::new("app");
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = build(&mut pb, &b);
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));
    pb.finish()
}

fn ask_effect(pb: &mut ProgramBuilder) -> DefId {
    pb.effect("Ask", vec![op("ask", vec![], Type::I32)])
}

/// `run(n) { handle { let i = 0; let s = 0; while i < n { s = s + tick(i); i = i + 1 }; s }
/// with tick(x, k) => resume k(1) }`
fn ticking_program() -> Program {
    let mut pb = ProgramBuilder::new("app");
    let tick = pb.effect("Tick", vec![op("tick", vec![Type::I32], Type::I32)]);
    let run = pb.fresh_def();
    let b = BodyBuilder::new();
    let n = b.param("n", Type::I32);
    let i = b.local("i", Type::I32);
    let s = b.local("s", Type::I32);
    let x = b.constant("x", Type::I32);
    let k = b.constant("k", Type::cont(Type::I32, Type::I32));
    let step = b.block(
        vec![
            b.stmt(b.assign(s, b.add(b.var(s), b.perform(tick, 0, Type::I32, vec![b.var(i)])))),
            b.stmt(b.assign(i, b.add(b.var(i), b.int(1)))),
        ],
        None,
    );
    let handled = b.block(
        vec![
            b.let_(i, b.int(0)),
            b.let_(s, b.int(0)),
            b.stmt(b.while_loop(b.lt(b.var(i), b.var(n)), step)),
        ],
        Some(b.var(s)),
    );
    let body = b.handle(handled, tick, vec![], vec![b.clause(0, vec![x], k, b.resume(k, b.int(1)))]);
    pb.function(b.finish(run, "run", Type::I32, body).exported("run"));
    pb.finish()
}

#[test]
fn test_thousands_of_in_module_resumes() {
    let mut rt = load(&ticking_program());
    assert_eq!(rt.run("run", vec![0]).unwrap(), HostValue::Int(0));
    assert_eq!(rt.run("run", vec![3000]).unwrap(), HostValue::Int(3000));
}

#[test]
fn test_clause_resuming_twice() {
    // handle { choose() + 10 } with choose(k) => resume k(1) + resume k(2)
    let program = main_program(|pb, b| {
        let choose = pb.effect("Choose", vec![op("choose", vec![], Type::I32)]);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let clause = b.clause(0, vec![], k, b.add(b.resume(k, b.int(1)), b.resume(k, b.int(2))));
        b.handle(
            b.add(b.perform(choose, 0, Type::I32, vec![]), b.int(10)),
            choose,
            vec![],
            vec![clause],
        )
    });
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(23));
}

#[test]
fn test_clause_that_never_resumes_aborts_the_body() {
    // handle { ask() + 1 } with ask(k) => 99
    let program = main_program(|pb, b| {
        let ask = ask_effect(pb);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        b.handle(
            b.add(b.perform(ask, 0, Type::I32, vec![]), b.int(1)),
            ask,
            vec![],
            vec![b.clause(0, vec![], k, b.int(99))],
        )
    });
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(99));
}

#[test]
fn test_handled_body_updates_outer_local() {
    // let total = 10;
    // let r = handle { total = total + ask(); total = total + ask(); 1 } with ask(k) => resume k(5);
    // total + r
    let program = main_program(|pb, b| {
        let ask = ask_effect(pb);
        let total = b.local("total", Type::I32);
        let r = b.constant("r", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let bump = |b: &BodyBuilder| {
            let asked = b.perform(ask, 0, Type::I32, vec![]);
            b.stmt(b.assign(total, b.add(b.var(total), asked)))
        };
        let handled = b.block(vec![bump(b), bump(b)], Some(b.int(1)));
        let clause = b.clause(0, vec![], k, b.resume(k, b.int(5)));
        b.block(
            vec![
                b.let_(total, b.int(10)),
                b.let_(r, b.handle(handled, ask, vec![], vec![clause])),
            ],
            Some(b.add(b.var(total), b.var(r))),
        )
    });
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(21));
}

#[test]
fn test_clause_updates_outer_local() {
    // let count = 0;
    // handle { log(1); log(2); log(3) } with log(x, k) => { count = count + x; resume k(()) };
    // count
    let program = main_program(|pb, b| {
        let log = pb.effect("Log", vec![op("log", vec![Type::I32], Type::Unit)]);
        let count = b.local("count", Type::I32);
        let x = b.constant("x", Type::I32);
        let k = b.constant("k", Type::cont(Type::Unit, Type::Unit));
        let handled = b.block(
            vec![
                b.stmt(b.perform(log, 0, Type::Unit, vec![b.int(1)])),
                b.stmt(b.perform(log, 0, Type::Unit, vec![b.int(2)])),
            ],
            Some(b.perform(log, 0, Type::Unit, vec![b.int(3)])),
        );
        let clause_body = b.block(
            vec![b.stmt(b.assign(count, b.add(b.var(count), b.var(x))))],
            Some(b.resume(k, b.unit())),
        );
        b.block(
            vec![
                b.let_(count, b.int(0)),
                b.stmt(b.handle(handled, log, vec![], vec![b.clause(0, vec![x], k, clause_body)])),
            ],
            Some(b.var(count)),
        )
    });
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(6));
}

#[test]
fn test_return_from_handled_loop_leaves_function() {
    // let x = handle {
    //     let i = 0;
    //     while i < 100 { let t = tick(i); if 6 < t { return t }; i = i + 1 };
    //     0
    // } with tick(v, k) => resume k(v + 1);
    // x + 1000
    let program = main_program(|pb, b| {
        let tick = pb.effect("Tick", vec![op("tick", vec![Type::I32], Type::I32)]);
        let x = b.constant("x", Type::I32);
        let i = b.local("i", Type::I32);
        let t = b.constant("t", Type::I32);
        let v = b.constant("v", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let step = b.block(
            vec![
                b.let_(t, b.perform(tick, 0, Type::I32, vec![b.var(i)])),
                b.stmt(b.if_else(b.lt(b.int(6), b.var(t)), b.ret(b.var(t)), None)),
                b.stmt(b.assign(i, b.add(b.var(i), b.int(1)))),
            ],
            None,
        );
        let handled = b.block(
            vec![b.let_(i, b.int(0)), b.stmt(b.while_loop(b.lt(b.var(i), b.int(100)), step))],
            Some(b.int(0)),
        );
        let clause = b.clause(0, vec![v], k, b.resume(k, b.add(b.var(v), b.int(1))));
        b.block(
            vec![b.let_(x, b.handle(handled, tick, vec![], vec![clause]))],
            Some(b.add(b.var(x), b.int(1000))),
        )
    });
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(7));
}

#[test]
fn test_return_from_inner_handled_body() {
    // let r = handle {
    //     handle { if ask() < 5 { return 3 }; 0 } with log(x, k) => resume k(())
    // } with ask(k) => resume k(1);
    // r + 100
    let program = main_program(|pb, b| {
        let ask = ask_effect(pb);
        let log = pb.effect("Log", vec![op("log", vec![Type::I32], Type::Unit)]);
        let r = b.constant("r", Type::I32);
        let x = b.constant("x", Type::I32);
        let log_k = b.constant("log_k", Type::cont(Type::Unit, Type::I32));
        let ask_k = b.constant("ask_k", Type::cont(Type::I32, Type::I32));
        let inner_body = b.block(
            vec![b.stmt(b.if_else(
                b.lt(b.perform(ask, 0, Type::I32, vec![]), b.int(5)),
                b.ret(b.int(3)),
                None,
            ))],
            Some(b.int(0)),
        );
        let inner = b.handle(
            inner_body,
            log,
            vec![],
            vec![b.clause(0, vec![x], log_k, b.resume(log_k, b.unit()))],
        );
        let outer = b.handle(inner, ask, vec![], vec![b.clause(0, vec![], ask_k, b.resume(ask_k, b.int(1)))]);
        b.block(vec![b.let_(r, outer)], Some(b.add(b.var(r), b.int(100))))
    });
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(3));
}

#[test]
fn test_return_from_clause_without_resuming() {
    // let r = handle { ask() + 1 } with ask(k) => { return 42; 0 };
    // r + 100
    let program = main_program(|pb, b| {
        let ask = ask_effect(pb);
        let r = b.constant("r", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let clause_body = b.block(vec![b.stmt(b.ret(b.int(42)))], Some(b.int(0)));
        let handled = b.add(b.perform(ask, 0, Type::I32, vec![]), b.int(1));
        b.block(
            vec![b.let_(r, b.handle(handled, ask, vec![], vec![b.clause(0, vec![], k, clause_body)]))],
            Some(b.add(b.var(r), b.int(100))),
        )
    });
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(42));
}

#[test]
fn test_return_from_clause_after_resuming() {
    // let r = handle { ask() + 1 } with ask(k) => { let v = resume k(1); return v + 1000; 0 };
    // r + 100
    let program = main_program(|pb, b| {
        let ask = ask_effect(pb);
        let r = b.constant("r", Type::I32);
        let v = b.constant("v", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let clause_body = b.block(
            vec![
                b.let_(v, b.resume(k, b.int(1))),
                b.stmt(b.ret(b.add(b.var(v), b.int(1000)))),
            ],
            Some(b.int(0)),
        );
        let handled = b.add(b.perform(ask, 0, Type::I32, vec![]), b.int(1));
        b.block(
            vec![b.let_(r, b.handle(handled, ask, vec![], vec![b.clause(0, vec![], k, clause_body)]))],
            Some(b.add(b.var(r), b.int(100))),
        )
    });
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(1002));
}

/// `main() { handle { write(1); 7 } with write(x, k) => clause }` with `write`
/// a tail operation. `forward(k)` is available to the clause.
fn tail_program(clause: impl FnOnce(&BodyBuilder, DefId, LocalId) -> Expr) -> Program {
    let mut pb = ProgramBuilder::new("app");
    let log = pb.effect("Log", vec![tail_op("write", vec![Type::I32], Type::Unit)]);
    let cont_ty = Type::cont(Type::Unit, Type::Unit);

    // forward(k) { tail k(()); tail k(()) }
    let forward = pb.fresh_def();
    let b = BodyBuilder::new();
    let fk = b.param("k", cont_ty.clone());
    let body = b.block(vec![b.stmt(b.tail(fk, b.unit()))], Some(b.tail(fk, b.unit())));
    pb.function(b.finish(forward, "forward", Type::Unit, body));

    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let x = b.constant("x", Type::I32);
    let k = b.constant("k", cont_ty);
    let clause_body = clause(&b, forward, k);
    let handled = b.block(
        vec![b.stmt(b.perform(log, 0, Type::Unit, vec![b.int(1)]))],
        Some(b.int(7)),
    );
    let body = b.handle(handled, log, vec![], vec![b.clause(0, vec![x], k, clause_body)]);
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));
    pb.finish()
}

#[test]
fn test_in_module_tail_clause_resumed_once() {
    let program = tail_program(|b, _, k| b.tail(k, b.unit()));
    assert_eq!(load(&program).run("main", vec![]).unwrap(), HostValue::Int(7));
}

#[test]
fn test_in_module_tail_clause_never_resumed() {
    let program = tail_program(|b, _, _| b.unit());
    let err = load(&program).run("main", vec![]).unwrap_err();
    assert!(err.to_string().contains("must be resumed exactly once (observed 0 calls)"), "{}", err);
}

#[test]
fn test_in_module_tail_clause_resumed_twice() {
    let program = tail_program(|b, forward, k| b.call(forward, Type::Unit, vec![b.var(k)]));
    let err = load(&program).run("main", vec![]).unwrap_err();
    assert!(
        err.to_string()
            .contains("tail continuation `Log.write` must be resumed exactly once (observed 2 calls)"),
        "{}",
        err
    );
}
