//! # Host Continuations
//!
//! The host-side view of a suspended computation.
//!
//! ## Design
//!
//! Compiled code never pauses mid-stack: when an operation reaches the host
//! the export returns an `$EffectResult` holding the continuation as a GC
//! object. The host wraps that result in a [`Continuation`] and hands it to
//! the registered handler. Calling [`Continuation::resume`],
//! [`Continuation::tail`] or [`Continuation::end`] does not re-enter the
//! module directly; it records a [`ContinuationCall`] in the runtime's
//! mailbox, which [`crate::HostRuntime`] drains once the handler (or the
//! timer callback holding the continuation) has returned.
//!
//! ## Resumption Discipline
//!
//! - `resume` continuations are multi-shot: each call re-enters from the same
//!   snapshot. Dropping or cancelling one is legal.
//! - `tail` continuations must be called exactly once. The host calls
//!   [`Continuation::finalize`] when the handler returns, which rejects zero
//!   calls; a second call is rejected immediately.
//! - After `end`, every further call is rejected.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tarnc::hir::ResumeKind;

use crate::error::RuntimeError;

/// Unique identifier for a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContinuationId(pub u64);

impl ContinuationId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContinuationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

/// How a continuation was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMode {
    /// Re-enter; the continuation stays usable.
    Resume,
    /// Re-enter as the single tail call of a `tail` operation.
    Tail,
    /// Re-enter for the last time.
    End,
}

impl CallMode {
    /// The mode code generated code expects.
    pub fn code(self) -> i32 {
        use tarnc::codegen::runtime::hcont;
        match self {
            CallMode::Resume => hcont::MODE_RESUME,
            CallMode::Tail => hcont::MODE_TAIL,
            CallMode::End => hcont::MODE_END,
        }
    }
}

/// A recorded continuation call. Handlers return it as proof they invoked
/// their continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationCall {
    /// The continuation that was called.
    pub continuation: ContinuationId,
    /// How it was called.
    pub mode: CallMode,
    /// The resume value word.
    pub value: i64,
}

pub(crate) type Mailbox = Rc<RefCell<VecDeque<ContinuationCall>>>;

struct ContState {
    id: ContinuationId,
    label: String,
    kind: ResumeKind,
    calls: Cell<u32>,
    ended: Cell<bool>,
    mailbox: Mailbox,
}

/// A continuation handed to an effect handler.
#[derive(Clone)]
pub struct Continuation {
    state: Rc<ContState>,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.state.id)
            .field("label", &self.state.label)
            .field("kind", &self.state.kind)
            .field("calls", &self.state.calls.get())
            .field("ended", &self.state.ended.get())
            .finish()
    }
}

impl Continuation {
    pub(crate) fn new(id: ContinuationId, label: String, kind: ResumeKind, mailbox: Mailbox) -> Self {
        Self {
            state: Rc::new(ContState {
                id,
                label,
                kind,
                calls: Cell::new(0),
                ended: Cell::new(false),
                mailbox,
            }),
        }
    }

    /// The continuation's ID.
    pub fn id(&self) -> ContinuationId {
        self.state.id
    }

    /// Label of the operation that suspended, e.g. `Async.await`.
    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// Resume discipline of the operation.
    pub fn kind(&self) -> ResumeKind {
        self.state.kind
    }

    /// Number of times the continuation has been called.
    pub fn calls(&self) -> u32 {
        self.state.calls.get()
    }

    /// Whether `end` was called or the continuation was cancelled.
    pub fn is_ended(&self) -> bool {
        self.state.ended.get()
    }

    /// Resume with `value`.
    pub fn resume(&self, value: i64) -> Result<ContinuationCall, RuntimeError> {
        self.call(CallMode::Resume, value)
    }

    /// Resume a `tail` operation with `value`.
    pub fn tail(&self, value: i64) -> Result<ContinuationCall, RuntimeError> {
        self.call(CallMode::Tail, value)
    }

    /// Resume with `value` for the last time.
    pub fn end(&self, value: i64) -> Result<ContinuationCall, RuntimeError> {
        self.call(CallMode::End, value)
    }

    fn call(&self, mode: CallMode, value: i64) -> Result<ContinuationCall, RuntimeError> {
        let state = &self.state;
        if state.ended.get() {
            return Err(RuntimeError::ContinuationEnded {
                label: state.label.clone(),
            });
        }
        let calls = state.calls.get() + 1;
        state.calls.set(calls);
        if state.kind == ResumeKind::Tail && calls > 1 {
            return Err(RuntimeError::TailResumption {
                label: state.label.clone(),
                calls,
            });
        }
        if mode == CallMode::End {
            state.ended.set(true);
        }
        let call = ContinuationCall {
            continuation: state.id,
            mode,
            value,
        };
        state.mailbox.borrow_mut().push_back(call);
        tracing::trace!(continuation = %state.id, ?mode, value, "continuation called");
        Ok(call)
    }

    /// Check the tail guard. A `tail` continuation must have been called
    /// exactly once by now; other kinds always pass.
    pub fn finalize(&self) -> Result<(), RuntimeError> {
        let calls = self.state.calls.get();
        if self.state.kind == ResumeKind::Tail && calls != 1 {
            return Err(RuntimeError::TailResumption {
                label: self.state.label.clone(),
                calls,
            });
        }
        Ok(())
    }

    /// Give up on the continuation without calling it.
    ///
    /// Legal for `resume` continuations; a `tail` continuation that was never
    /// called cannot be cancelled.
    pub fn cancel(&self) -> Result<(), RuntimeError> {
        if self.state.kind == ResumeKind::Tail && self.state.calls.get() == 0 {
            return Err(RuntimeError::CancelTail {
                label: self.state.label.clone(),
            });
        }
        self.state.ended.set(true);
        Ok(())
    }

    pub(crate) fn downgrade(&self) -> WeakContinuation {
        WeakContinuation(Rc::downgrade(&self.state))
    }
}

/// A reference that does not keep the continuation alive.
#[derive(Clone)]
pub(crate) struct WeakContinuation(Weak<ContState>);

impl WeakContinuation {
    /// Whether any handler still holds the continuation.
    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakContinuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakContinuation(alive: {})", self.is_alive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cont(kind: ResumeKind) -> (Continuation, Mailbox) {
        let mailbox = Mailbox::default();
        let k = Continuation::new(ContinuationId(1), "Log.write".into(), kind, Rc::clone(&mailbox));
        (k, mailbox)
    }

    #[test]
    fn test_resume_is_multi_shot() {
        let (k, mailbox) = cont(ResumeKind::Resume);
        k.resume(1).unwrap();
        k.resume(2).unwrap();
        assert_eq!(k.calls(), 2);
        let values: Vec<_> = mailbox.borrow().iter().map(|c| c.value).collect();
        assert_eq!(values, vec![1, 2]);
        assert!(k.finalize().is_ok());
    }

    #[test]
    fn test_end_rejects_later_calls() {
        let (k, mailbox) = cont(ResumeKind::Resume);
        let call = k.end(7).unwrap();
        assert_eq!(call.mode, CallMode::End);
        assert!(k.is_ended());
        let err = k.resume(8).unwrap_err();
        assert_eq!(err.to_string(), "continuation `Log.write` was already ended");
        assert_eq!(mailbox.borrow().len(), 1);
    }

    #[test]
    fn test_tail_exactly_once() {
        let (k, _) = cont(ResumeKind::Tail);
        assert!(k.finalize().unwrap_err().to_string().contains("resumed exactly once"));
        k.tail(3).unwrap();
        assert!(k.finalize().is_ok());
        let err = k.tail(4).unwrap_err();
        assert_eq!(
            err.to_string(),
            "tail continuation `Log.write` must be resumed exactly once (observed 2 calls)"
        );
        assert!(k.finalize().is_err());
    }

    #[test]
    fn test_cancel() {
        let (k, mailbox) = cont(ResumeKind::Resume);
        k.cancel().unwrap();
        assert!(k.resume(1).is_err());
        assert!(mailbox.borrow().is_empty());

        let (t, _) = cont(ResumeKind::Tail);
        assert!(matches!(t.cancel(), Err(RuntimeError::CancelTail { .. })));
    }

    #[test]
    fn test_weak_reference_tracks_handlers() {
        let (k, _) = cont(ResumeKind::Resume);
        let weak = k.downgrade();
        let held = k.clone();
        drop(k);
        assert!(weak.is_alive());
        drop(held);
        assert!(!weak.is_alive());
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(CallMode::Resume.code(), 0);
        assert_eq!(CallMode::Tail.code(), 1);
        assert_eq!(CallMode::End.code(), 2);
    }
}
