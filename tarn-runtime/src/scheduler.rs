//! # Deterministic Task Scheduler
//!
//! Single-threaded scheduler with a FIFO job queue and a virtual clock.
//!
//! ## Design
//!
//! - Jobs run strictly in the order they were queued.
//! - Timers are keyed by `(due, sequence)`, so timers due at the same
//!   virtual instant fire in the order they were set.
//! - Time only moves when the driver advances it; nothing ever waits on the
//!   wall clock.
//!
//! The scheduler does not execute module code itself. [`crate::HostRuntime`]
//! pops jobs, starts tasks on the machine and records their outcome here.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use crate::host::HostValue;

/// Identifier of a task spawned on the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskState {
    /// Spawned, waiting for its start job.
    #[default]
    Pending,
    /// Executing module code.
    Running,
    /// Waiting for a host handler to call its continuation.
    Suspended,
    /// Completed with a value.
    Done,
    /// Cancelled by the host.
    Cancelled,
    /// Failed with an error.
    Failed,
}

impl TaskState {
    /// Whether the task will never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled | TaskState::Failed)
    }
}

/// A queued unit of work.
pub(crate) enum Job {
    /// Call the task's export.
    Start(TaskId),
    /// Run a host callback.
    Callback(Box<dyn FnOnce()>),
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Start(id) => write!(f, "Start({})", id),
            Job::Callback(_) => write!(f, "Callback"),
        }
    }
}

#[derive(Default)]
struct Core {
    now: u64,
    seq: u64,
    queue: VecDeque<Job>,
    timers: BTreeMap<(u64, u64), Box<dyn FnOnce()>>,
}

/// Cloneable access to the clock and queues, handed to effect handlers.
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    core: Rc<RefCell<Core>>,
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("SchedulerHandle")
            .field("now", &core.now)
            .field("queued", &core.queue.len())
            .field("timers", &core.timers.len())
            .finish()
    }
}

impl SchedulerHandle {
    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.core.borrow().now
    }

    /// Queue `f` behind every job already queued.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.core.borrow_mut().queue.push_back(Job::Callback(Box::new(f)));
    }

    /// Run `f` once the virtual clock has advanced by `millis`.
    pub fn sleep_millis(&self, millis: u64, f: impl FnOnce() + 'static) {
        let mut core = self.core.borrow_mut();
        let due = core.now.saturating_add(millis);
        let seq = core.seq;
        core.seq += 1;
        core.timers.insert((due, seq), Box::new(f));
        tracing::trace!(due, seq, "timer set");
    }

    /// Number of timers that have not fired.
    pub fn pending_timers(&self) -> usize {
        self.core.borrow().timers.len()
    }

    /// Number of queued jobs.
    pub fn queued(&self) -> usize {
        self.core.borrow().queue.len()
    }

    fn push(&self, job: Job) {
        self.core.borrow_mut().queue.push_back(job);
    }

    fn pop(&self) -> Option<Job> {
        self.core.borrow_mut().queue.pop_front()
    }

    fn next_due(&self) -> Option<u64> {
        self.core.borrow().timers.keys().next().map(|(due, _)| *due)
    }

    /// Queue the earliest timer due no later than `limit`, moving the clock
    /// to its due time.
    fn fire_next(&self, limit: Option<u64>) -> bool {
        let mut core = self.core.borrow_mut();
        let Some(&key) = core.timers.keys().next() else {
            return false;
        };
        if limit.is_some_and(|limit| key.0 > limit) {
            return false;
        }
        if let Some(f) = core.timers.remove(&key) {
            core.now = core.now.max(key.0);
            core.queue.push_back(Job::Callback(f));
        }
        true
    }

    fn set_now(&self, now: u64) {
        let mut core = self.core.borrow_mut();
        core.now = core.now.max(now);
    }
}

/// Bookkeeping for one task.
#[derive(Debug, Clone)]
pub struct Task {
    /// Export the task calls.
    pub export: String,
    /// Argument words.
    pub args: Vec<i64>,
    /// Current state.
    pub state: TaskState,
    /// The first completion.
    pub result: Option<HostValue>,
    /// Completions after the first, from continuations resumed again.
    pub later: Vec<HostValue>,
    /// Error message of a failed task.
    pub error: Option<String>,
}

/// The task table plus the clock and job queue.
#[derive(Debug, Default)]
pub struct Scheduler {
    handle: SchedulerHandle,
    tasks: BTreeMap<TaskId, Task>,
    next_task: u64,
}

impl Scheduler {
    /// Create an empty scheduler at virtual time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle sharing this scheduler's clock and queues.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.handle.now()
    }

    /// Register a task and queue its start job.
    pub fn spawn(&mut self, export: &str, args: Vec<i64>) -> TaskId {
        self.next_task += 1;
        let id = TaskId(self.next_task);
        self.tasks.insert(
            id,
            Task {
                export: export.to_string(),
                args,
                state: TaskState::Pending,
                result: None,
                later: Vec::new(),
                error: None,
            },
        );
        self.handle.push(Job::Start(id));
        tracing::debug!(task = %id, export, "spawned");
        id
    }

    pub(crate) fn pop_job(&self) -> Option<Job> {
        self.handle.pop()
    }

    /// Due time of the earliest pending timer.
    pub fn next_timer(&self) -> Option<u64> {
        self.handle.next_due()
    }

    /// Queue the earliest timer due no later than `limit` (any timer when
    /// `limit` is `None`). Returns whether one fired.
    pub fn fire_next_timer(&self, limit: Option<u64>) -> bool {
        self.handle.fire_next(limit)
    }

    /// Move the clock forward to `now`. The clock never moves backwards.
    pub fn set_now(&self, now: u64) {
        self.handle.set_now(now);
    }

    /// Look up a task.
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// State of a task.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|t| t.state)
    }

    /// Set the state of a live task. Terminal states are final.
    pub fn set_state(&mut self, id: TaskId, state: TaskState) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if !task.state.is_terminal() {
                task.state = state;
            }
        }
    }

    /// Record a completion. The first one is the task's result; later ones
    /// come from a continuation resumed again and are kept separately.
    pub fn complete(&mut self, id: TaskId, value: HostValue) {
        let Some(task) = self.tasks.get_mut(&id) else { return };
        match task.state {
            TaskState::Cancelled | TaskState::Failed => {}
            TaskState::Done => task.later.push(value),
            _ => {
                task.state = TaskState::Done;
                task.result = Some(value);
            }
        }
        tracing::debug!(task = %id, "completed");
    }

    /// Mark a task failed.
    pub fn fail(&mut self, id: TaskId, error: impl Into<String>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if !task.state.is_terminal() {
                task.state = TaskState::Failed;
                task.error = Some(error.into());
            }
        }
    }

    /// Cancel a task that has not finished. Returns whether it was live.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if !task.state.is_terminal() => {
                task.state = TaskState::Cancelled;
                tracing::debug!(task = %id, "cancelled");
                true
            }
            _ => false,
        }
    }
}
