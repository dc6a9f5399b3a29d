//! Timer-driven effect resumption on the virtual clock.

use std::cell::RefCell;
use std::rc::Rc;

use tarn_runtime::{Handled, HostRuntime, HostValue, RuntimeConfig, TaskState};
use tarnc::config::CompileOptions;
use tarnc::hir::{op, BodyBuilder, ProgramBuilder, Type};

/// `main() { let a = sleep(10); let b = sleep(20); a + b }`
fn sleeper() -> HostRuntime {
    let mut pb = ProgramBuilder::new("app");
    let timer = pb.effect("Timer", vec![op("sleep", vec![Type::I32], Type::I32)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let a = b.constant("a", Type::I32);
    let c = b.constant("b", Type::I32);
    let body = b.block(
        vec![
            b.let_(a, b.perform(timer, 0, Type::I32, vec![b.int(10)])),
            b.let_(c, b.perform(timer, 0, Type::I32, vec![b.int(20)])),
        ],
        Some(b.add(b.var(a), b.var(c))),
    );
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));

    let compiled = tarnc::compile_program(&pb.finish(), &CompileOptions::default()).unwrap();
    let mut rt = HostRuntime::new(&compiled.to_bytes(), RuntimeConfig::default()).unwrap();
    let key = rt.op_by_label("Timer.sleep").unwrap().key();
    rt.register(key, |call| {
        let millis = call.arg(0).unwrap_or_default();
        let cont = call.cont.clone();
        let clock = call.scheduler.clone();
        call.scheduler.sleep_millis(millis as u64, move || {
            // Resume with the time the timer fired at.
            let _ = cont.resume(clock.now() as i64);
        });
        Ok(Handled::Pending)
    });
    rt
}

#[test]
fn test_advance_by_fires_due_timers_only() {
    let mut rt = sleeper();
    let task = rt.spawn("main", vec![]).unwrap();
    rt.run_until_idle().unwrap();
    assert_eq!(rt.task_state(task), Some(TaskState::Suspended));

    rt.advance_by(5).unwrap();
    assert_eq!(rt.now(), 5);
    assert_eq!(rt.task_state(task), Some(TaskState::Suspended));

    // First sleep fires at 10; the second is set then and is due at 30.
    rt.advance_by(5).unwrap();
    assert_eq!(rt.now(), 10);
    assert_eq!(rt.task_state(task), Some(TaskState::Suspended));
    assert_eq!(rt.scheduler().pending_timers(), 1);

    rt.advance_by(19).unwrap();
    assert_eq!(rt.task_state(task), Some(TaskState::Suspended));

    rt.advance_by(1).unwrap();
    assert_eq!(rt.now(), 30);
    assert_eq!(rt.task_result(task), Some(HostValue::Int(40)));
}

#[test]
fn test_run_jumps_clock_to_next_timer() {
    let mut rt = sleeper();
    assert_eq!(rt.run("main", vec![]).unwrap(), HostValue::Int(40));
    assert_eq!(rt.now(), 30);
}

#[test]
fn test_tasks_interleave_in_timer_order() {
    let mut rt = sleeper();
    let first = rt.spawn("main", vec![]).unwrap();
    rt.advance_by(5).unwrap();
    let second = rt.spawn("main", vec![]).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..40 {
        rt.advance_by(1).unwrap();
        for task in [first, second] {
            if rt.task_state(task) == Some(TaskState::Done) && !order.borrow().contains(&task) {
                order.borrow_mut().push(task);
            }
        }
    }
    assert_eq!(*order.borrow(), vec![first, second]);
    assert_eq!(rt.task_result(first), Some(HostValue::Int(40)));
    // Started at 5: timers fire at 15 and 35.
    assert_eq!(rt.task_result(second), Some(HostValue::Int(50)));
}

#[test]
fn test_cancel_suspended_task() {
    let mut rt = sleeper();
    let task = rt.spawn("main", vec![]).unwrap();
    rt.run_until_idle().unwrap();
    assert!(rt.cancel(task).unwrap());
    rt.advance_by(100).unwrap();
    assert_eq!(rt.task_state(task), Some(TaskState::Cancelled));
    assert_eq!(rt.task_result(task), None);
    assert!(!rt.cancel(task).unwrap());
}
