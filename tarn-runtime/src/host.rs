//! # Host Runtime
//!
//! Runs a compiled module and dispatches the effects it hands to the host.
//!
//! ## Flow
//!
//! ```text
//! spawn(export) -> Start job -> export returns $EffectResult
//!     done       -> write_value  -> task Done
//!     suspended  -> write_effect -> look up handler by (effectId, opId, hash)
//!                -> handler gets a Continuation -> continuation call queued
//!                -> effect_resume(result, scratch) -> settle again
//! ```
//!
//! Everything runs on one thread. Between a suspension and its resumption
//! no module code is on the stack: the export has genuinely returned, so a
//! handler may keep the continuation across timers and jobs for as long as
//! it likes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use tarnc::codegen::runtime::{effect_result, exports, imports, memory};
use tarnc::effects::{EffectId, OpId, SignatureHash};
use tarnc::hir::ResumeKind;
use tarnc::protocol::{HandlerKey, PayloadKind, ProtocolOp, ProtocolTable, PROTOCOL_SECTION};
use tarnc::target::{self, Import};

use crate::config::RuntimeConfig;
use crate::continuation::{CallMode, Continuation, ContinuationCall, ContinuationId, Mailbox, WeakContinuation};
use crate::error::RuntimeError;
use crate::machine::{Imports, Instance, MachineError, Memory, Value};
use crate::scheduler::{Job, Scheduler, SchedulerHandle, TaskId, TaskState};

/// A value reported by a finished export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostValue {
    /// `()`.
    Unit,
    /// An integer widened to 64 bits.
    Int(i64),
    /// A word produced by a declared serializer.
    Serialized(i64),
}

impl HostValue {
    /// The payload word; zero for `Unit`.
    pub fn as_i64(self) -> i64 {
        match self {
            HostValue::Unit => 0,
            HostValue::Int(v) | HostValue::Serialized(v) => v,
        }
    }

    fn from_tag(tag: i32, payload: i64) -> Self {
        match tag {
            1 => HostValue::Int(payload),
            2 => HostValue::Serialized(payload),
            _ => HostValue::Unit,
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Unit => write!(f, "()"),
            HostValue::Int(v) => write!(f, "{}", v),
            HostValue::Serialized(v) => write!(f, "<serialized {:#x}>", v),
        }
    }
}

/// A request reported through `write_effect`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HostRequest {
    op_index: u32,
    effect_id: String,
    op_id: u32,
    hash: u64,
    args: Vec<i64>,
}

impl HostRequest {
    fn key(&self) -> HandlerKey {
        HandlerKey {
            effect_id: EffectId::new(self.effect_id.as_str()),
            op_id: OpId(self.op_id),
            signature_hash: SignatureHash(self.hash),
        }
    }
}

/// The host imports. Records what the module reports during one call.
#[derive(Debug, Default)]
struct Boundary {
    value: Option<HostValue>,
    request: Option<HostRequest>,
}

impl Boundary {
    fn clear(&mut self) {
        self.value = None;
        self.request = None;
    }
}

fn int_arg(args: &[Value], i: usize) -> Result<i64, MachineError> {
    match args.get(i) {
        Some(Value::I32(v)) => Ok(i64::from(*v)),
        Some(Value::I64(v)) => Ok(*v),
        other => Err(MachineError::Malformed(format!(
            "import argument {} is not an integer: {:?}",
            i, other
        ))),
    }
}

impl Imports for Boundary {
    fn call_import(
        &mut self,
        import: &Import,
        args: &[Value],
        memory: &mut Memory,
    ) -> Result<Option<Value>, MachineError> {
        if import.module != imports::MODULE {
            return Err(MachineError::UnknownImport {
                module: import.module.clone(),
                name: import.name.clone(),
            });
        }
        match import.name.as_str() {
            imports::WRITE_VALUE => {
                let value = HostValue::from_tag(int_arg(args, 0)? as i32, int_arg(args, 1)?);
                tracing::trace!(%value, "write_value");
                self.value = Some(value);
                Ok(Some(Value::I32(0)))
            }
            imports::WRITE_EFFECT => {
                let id_ptr = int_arg(args, 1)? as u32;
                let id_len = int_arg(args, 2)? as u32;
                let args_ptr = int_arg(args, 5)? as u64;
                let argc = int_arg(args, 6)? as u64;
                let words = (0..argc)
                    .map(|i| memory.read_u64(args_ptr + i * u64::from(memory::WORD)).map(|w| w as i64))
                    .collect::<Result<Vec<_>, _>>()?;
                let request = HostRequest {
                    op_index: int_arg(args, 0)? as u32,
                    effect_id: memory.read_str(id_ptr, id_len)?,
                    op_id: int_arg(args, 3)? as u32,
                    hash: int_arg(args, 4)? as u64,
                    args: words,
                };
                tracing::trace!(op_index = request.op_index, "write_effect");
                self.request = Some(request);
                Ok(Some(Value::I32(0)))
            }
            imports::READ_VALUE => {
                let ptr = int_arg(args, 0)? as u64;
                Ok(Some(Value::I64(memory.read_u64(ptr)? as i64)))
            }
            _ => Err(MachineError::UnknownImport {
                module: import.module.clone(),
                name: import.name.clone(),
            }),
        }
    }
}

/// What an effect handler receives.
#[derive(Debug)]
pub struct EffectCall {
    /// The operation's protocol entry.
    pub op: ProtocolOp,
    /// Argument words, one per operation parameter.
    pub args: Vec<i64>,
    /// The suspended computation.
    pub cont: Continuation,
    /// Clock and job queue, for handlers that resume later.
    pub scheduler: SchedulerHandle,
    /// The task that performed the operation.
    pub task: TaskId,
}

impl EffectCall {
    /// Argument word `i`.
    pub fn arg(&self, i: usize) -> Option<i64> {
        self.args.get(i).copied()
    }
}

/// How a handler disposed of its continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The continuation was called before the handler returned.
    Resumed(ContinuationCall),
    /// The handler kept the continuation to call later.
    Pending,
}

/// A host effect handler.
pub type HandlerFn = Box<dyn FnMut(EffectCall) -> Result<Handled, RuntimeError>>;

#[derive(Debug)]
struct Suspension {
    task: TaskId,
    result: Value,
    kind: ResumeKind,
    cont: WeakContinuation,
}

/// Runs one module instance and its tasks.
pub struct HostRuntime {
    instance: Instance,
    protocol: ProtocolTable,
    boundary: Boundary,
    handlers: HashMap<HandlerKey, HandlerFn>,
    scheduler: Scheduler,
    mailbox: Mailbox,
    suspensions: BTreeMap<ContinuationId, Suspension>,
    next_continuation: u64,
}

impl fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRuntime")
            .field("ops", &self.protocol.ops.len())
            .field("handlers", &self.handlers.len())
            .field("suspensions", &self.suspensions.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl HostRuntime {
    /// Decode a module, read its protocol table and initialize its effects
    /// support.
    pub fn new(bytes: &[u8], config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let module = target::decode(bytes)?;
        let section = module
            .custom_section(PROTOCOL_SECTION)
            .ok_or(RuntimeError::MissingProtocol(PROTOCOL_SECTION))?;
        let protocol = ProtocolTable::from_json(section)?;
        let mut instance = Instance::new(module, config.machine)?;
        let mut boundary = Boundary::default();
        instance.invoke_export(exports::INIT_EFFECTS, Vec::new(), &mut boundary)?;
        tracing::debug!(
            ops = protocol.ops.len(),
            exports = protocol.exports.len(),
            "module loaded"
        );
        Ok(Self {
            instance,
            protocol,
            boundary,
            handlers: HashMap::new(),
            scheduler: Scheduler::new(),
            mailbox: Mailbox::default(),
            suspensions: BTreeMap::new(),
            next_continuation: 0,
        })
    }

    /// The module's protocol table.
    pub fn protocol(&self) -> &ProtocolTable {
        &self.protocol
    }

    /// The operation with this display label, e.g. `Async.await`.
    pub fn op_by_label(&self, label: &str) -> Option<&ProtocolOp> {
        self.protocol.ops.iter().find(|op| op.display_label() == label)
    }

    /// A handle on the scheduler's clock and queues.
    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.scheduler.now()
    }

    /// Register `handler` for the operation keyed by
    /// `(effect_id, op_id, signature_hash)`. Replaces any earlier handler.
    pub fn register_handler<F>(&mut self, effect_id: &str, op_id: u32, signature_hash: u64, handler: F)
    where
        F: FnMut(EffectCall) -> Result<Handled, RuntimeError> + 'static,
    {
        let key = HandlerKey {
            effect_id: EffectId::new(effect_id),
            op_id: OpId(op_id),
            signature_hash: SignatureHash(signature_hash),
        };
        self.register(key, handler);
    }

    /// Register `handler` under a key of the form
    /// `<effectId>:<opId>:<signatureHash>`.
    pub fn register_handler_key<F>(&mut self, key: &str, handler: F) -> Result<(), RuntimeError>
    where
        F: FnMut(EffectCall) -> Result<Handled, RuntimeError> + 'static,
    {
        let key: HandlerKey = key.parse()?;
        self.register(key, handler);
        Ok(())
    }

    /// Register `handler` under `key`.
    pub fn register<F>(&mut self, key: HandlerKey, handler: F)
    where
        F: FnMut(EffectCall) -> Result<Handled, RuntimeError> + 'static,
    {
        if self.protocol.find(&key).is_none() {
            tracing::warn!(%key, "handler registered for an operation this module does not perform");
        }
        self.handlers.insert(key, Box::new(handler));
    }

    /// Queue a task calling `export` with `args`.
    pub fn spawn(&mut self, export: &str, args: Vec<i64>) -> Result<TaskId, RuntimeError> {
        let expected = self
            .protocol
            .export(export)
            .ok_or_else(|| RuntimeError::UnknownExport(export.to_string()))?
            .params
            .len();
        if args.len() != expected {
            return Err(RuntimeError::ArgumentCount {
                export: export.to_string(),
                expected,
                found: args.len(),
            });
        }
        Ok(self.scheduler.spawn(export, args))
    }

    /// State of a task.
    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.scheduler.task_state(task)
    }

    /// The first completion of a finished task.
    pub fn task_result(&self, task: TaskId) -> Option<HostValue> {
        self.scheduler.task(task).and_then(|t| t.result)
    }

    /// Completions after the first, produced by resuming a continuation again.
    pub fn later_results(&self, task: TaskId) -> Vec<HostValue> {
        self.scheduler.task(task).map(|t| t.later.clone()).unwrap_or_default()
    }

    /// Cancel a task and forget its suspensions. Returns whether the task was
    /// still live.
    pub fn cancel(&mut self, task: TaskId) -> Result<bool, RuntimeError> {
        if self.scheduler.task(task).is_none() {
            return Err(RuntimeError::UnknownTask(task));
        }
        self.suspensions.retain(|_, s| s.task != task);
        Ok(self.scheduler.cancel(task))
    }

    /// Run queued jobs and continuation calls until nothing is ready.
    /// Does not advance the clock.
    pub fn run_until_idle(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.drain_mailbox()?;
            self.prune();
            match self.scheduler.pop_job() {
                Some(Job::Start(task)) => self.start(task)?,
                Some(Job::Callback(f)) => f(),
                None => return Ok(()),
            }
        }
    }

    /// Advance the virtual clock by `millis`, firing every timer that falls
    /// due on the way in order.
    pub fn advance_by(&mut self, millis: u64) -> Result<(), RuntimeError> {
        let target = self.scheduler.now().saturating_add(millis);
        loop {
            self.run_until_idle()?;
            if !self.scheduler.fire_next_timer(Some(target)) {
                break;
            }
        }
        self.scheduler.set_now(target);
        Ok(())
    }

    /// Spawn `export` and drive it to completion, jumping the clock to the
    /// next timer whenever no other work is ready.
    pub fn run(&mut self, export: &str, args: Vec<i64>) -> Result<HostValue, RuntimeError> {
        let task = self.spawn(export, args)?;
        loop {
            self.run_until_idle()?;
            let Some(state) = self.scheduler.task(task) else {
                return Err(RuntimeError::UnknownTask(task));
            };
            match state.state {
                TaskState::Done => return state.result.ok_or(RuntimeError::NoReport),
                TaskState::Cancelled => return Err(RuntimeError::Cancelled(task)),
                TaskState::Failed => {
                    return Err(RuntimeError::Handler(state.error.clone().unwrap_or_default()));
                }
                _ => {}
            }
            if !self.scheduler.fire_next_timer(None) {
                return Err(RuntimeError::Stalled(task));
            }
        }
    }

    fn start(&mut self, task: TaskId) -> Result<(), RuntimeError> {
        let outcome = self.try_start(task);
        self.record_failure(task, outcome)
    }

    fn try_start(&mut self, task: TaskId) -> Result<(), RuntimeError> {
        let (export, args) = match self.scheduler.task(task) {
            Some(t) if t.state == TaskState::Pending => (t.export.clone(), t.args.clone()),
            _ => return Ok(()),
        };
        let kinds = self
            .protocol
            .export(&export)
            .map(|e| e.params.clone())
            .ok_or_else(|| RuntimeError::UnknownExport(export.clone()))?;
        let values = args
            .iter()
            .zip(&kinds)
            .map(|(arg, kind)| match kind {
                PayloadKind::Serialized => Value::I64(*arg),
                _ => Value::I32(*arg as i32),
            })
            .collect();

        tracing::debug!(%task, export = %export, "task start");
        self.scheduler.set_state(task, TaskState::Running);
        self.boundary.clear();
        let result = self
            .instance
            .invoke_export(&export, values, &mut self.boundary)?
            .ok_or(RuntimeError::NoReport)?;
        self.settle(task, result)
    }

    fn record_failure(&mut self, task: TaskId, outcome: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
        if let Err(err) = &outcome {
            tracing::debug!(%task, error = %err, "task failed");
            self.scheduler.fail(task, err.to_string());
            self.suspensions.retain(|_, s| s.task != task);
        }
        outcome
    }

    fn status(&mut self, result: &Value) -> Result<i32, RuntimeError> {
        let mut boundary = Boundary::default();
        match self
            .instance
            .invoke_export(exports::EFFECT_STATUS, vec![result.clone()], &mut boundary)?
        {
            Some(Value::I32(status)) => Ok(status),
            other => Err(MachineError::Malformed(format!("effect_status returned {:?}", other)).into()),
        }
    }

    /// Handle the `$EffectResult` of an export or a resumption.
    fn settle(&mut self, task: TaskId, result: Value) -> Result<(), RuntimeError> {
        if self.status(&result)? == effect_result::DONE {
            let value = self.boundary.value.take().ok_or(RuntimeError::NoReport)?;
            self.scheduler.complete(task, value);
            return Ok(());
        }

        let request = self.boundary.request.take().ok_or(RuntimeError::NoReport)?;
        let op = self
            .protocol
            .op(request.op_index)
            .cloned()
            .ok_or(RuntimeError::UnknownOp(request.op_index))?;
        let key = request.key();
        let label = op.display_label();
        if !self.handlers.contains_key(&key) {
            return Err(RuntimeError::Unhandled {
                label,
                key: key.to_string(),
            });
        }

        self.next_continuation += 1;
        let id = ContinuationId(self.next_continuation);
        let cont = Continuation::new(id, label, op.resume_kind, Rc::clone(&self.mailbox));
        self.suspensions.insert(
            id,
            Suspension {
                task,
                result,
                kind: op.resume_kind,
                cont: cont.downgrade(),
            },
        );
        self.scheduler.set_state(task, TaskState::Suspended);
        tracing::debug!(%task, continuation = %id, %key, "dispatch");

        let call = EffectCall {
            op,
            args: request.args,
            cont: cont.clone(),
            scheduler: self.scheduler.handle(),
            task,
        };
        let handled = match self.handlers.get_mut(&key) {
            Some(handler) => handler(call)?,
            None => return Err(RuntimeError::Unhandled {
                label: cont.label().to_string(),
                key: key.to_string(),
            }),
        };
        if cont.kind() == ResumeKind::Tail {
            cont.finalize()?;
        }
        tracing::trace!(continuation = %id, ?handled, "handler returned");
        Ok(())
    }

    /// Feed queued continuation calls back into the module.
    fn drain_mailbox(&mut self) -> Result<(), RuntimeError> {
        loop {
            let next = self.mailbox.borrow_mut().pop_front();
            let Some(call) = next else {
                return Ok(());
            };
            let Some(suspension) = self.suspensions.get(&call.continuation) else {
                tracing::trace!(continuation = %call.continuation, "call for a forgotten continuation");
                continue;
            };
            let task = suspension.task;
            if matches!(
                self.scheduler.task_state(task),
                Some(TaskState::Cancelled | TaskState::Failed) | None
            ) {
                continue;
            }
            let result = suspension.result.clone();
            if call.mode == CallMode::End || suspension.kind == ResumeKind::Tail {
                self.suspensions.remove(&call.continuation);
            }
            let outcome = self.resume(task, result, call.value);
            self.record_failure(task, outcome)?;
        }
    }

    fn resume(&mut self, task: TaskId, result: Value, value: i64) -> Result<(), RuntimeError> {
        tracing::debug!(%task, value, "resume");
        self.instance
            .memory_mut()
            .write_u64(u64::from(memory::SCRATCH_BASE), value as u64)?;
        self.scheduler.set_state(task, TaskState::Running);
        self.boundary.clear();
        let args = vec![
            result,
            Value::I32(memory::SCRATCH_BASE as i32),
            Value::I32(memory::WORD as i32),
        ];
        let next = self
            .instance
            .invoke_export(exports::EFFECT_RESUME, args, &mut self.boundary)?
            .ok_or(RuntimeError::NoReport)?;
        self.settle(task, next)
    }

    /// Forget suspensions no handler holds any more. A suspended task left
    /// with none is cancelled.
    fn prune(&mut self) {
        let dead: Vec<_> = self
            .suspensions
            .iter()
            .filter(|(_, s)| !s.cont.is_alive())
            .map(|(id, s)| (*id, s.task))
            .collect();
        for (id, task) in dead {
            self.suspensions.remove(&id);
            let orphaned = !self.suspensions.values().any(|s| s.task == task);
            if orphaned && self.scheduler.task_state(task) == Some(TaskState::Suspended) {
                tracing::debug!(%task, continuation = %id, "continuation dropped");
                self.scheduler.cancel(task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_value_tags() {
        assert_eq!(HostValue::from_tag(0, 9), HostValue::Unit);
        assert_eq!(HostValue::from_tag(1, -3), HostValue::Int(-3));
        assert_eq!(HostValue::from_tag(2, 7), HostValue::Serialized(7));
        assert_eq!(HostValue::Int(-3).as_i64(), -3);
        assert_eq!(HostValue::Unit.to_string(), "()");
    }

    #[test]
    fn test_request_key_matches_protocol_format() {
        let request = HostRequest {
            op_index: 0,
            effect_id: "com.example:async".into(),
            op_id: 2,
            hash: 0xab,
            args: vec![],
        };
        assert_eq!(request.key().to_string(), "com.example:async:2:00000000000000ab");
    }

    #[test]
    fn test_boundary_reads_request_words() {
        let mut memory = Memory::new(64);
        memory.write_bytes(0, b"fx").unwrap();
        memory.write_u64(16, 5).unwrap();
        memory.write_u64(24, u64::MAX).unwrap();
        let import = Import {
            module: imports::MODULE.into(),
            name: imports::WRITE_EFFECT.into(),
            ty: 0,
        };
        let args = [
            Value::I32(3),
            Value::I32(0),
            Value::I32(2),
            Value::I32(1),
            Value::I64(42),
            Value::I32(16),
            Value::I32(2),
        ];
        let mut boundary = Boundary::default();
        boundary.call_import(&import, &args, &mut memory).unwrap();
        let request = boundary.request.unwrap();
        assert_eq!(request.effect_id, "fx");
        assert_eq!(request.op_index, 3);
        assert_eq!(request.hash, 42);
        assert_eq!(request.args, vec![5, -1]);
    }

    #[test]
    fn test_boundary_rejects_foreign_imports() {
        let mut memory = Memory::new(8);
        let import = Import {
            module: "env".into(),
            name: "write_value".into(),
            ty: 0,
        };
        let err = Boundary::default().call_import(&import, &[], &mut memory).unwrap_err();
        assert_eq!(err.to_string(), "unresolved import `env.write_value`");
    }
}
