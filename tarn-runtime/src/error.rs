//! Errors raised by the host runtime.
//!
//! Dispatch and resumption errors are returned from the runtime call that
//! triggered them. Nothing is retried: a resumption-discipline violation is a
//! defect in handler code.

use thiserror::Error;

use tarnc::protocol::{HandlerKeyError, ProtocolError};
use tarnc::target::DecodeError;

use crate::config::ConfigError;
use crate::machine::MachineError;
use crate::scheduler::TaskId;

/// Errors produced by [`crate::HostRuntime`] and [`crate::Continuation`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The machine failed or generated code trapped.
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// No handler is registered under the request's key.
    #[error("Unhandled effect `{label}` ({key})")]
    Unhandled {
        /// Operation label.
        label: String,
        /// The key the request was looked up under.
        key: String,
    },

    /// A tail continuation was not called exactly once.
    #[error("tail continuation `{label}` must be resumed exactly once (observed {calls} calls)")]
    TailResumption {
        /// Operation label.
        label: String,
        /// Observed call count.
        calls: u32,
    },

    /// A continuation was called after `end` or cancellation.
    #[error("continuation `{label}` was already ended")]
    ContinuationEnded {
        /// Operation label.
        label: String,
    },

    /// A tail continuation cannot be dropped without being called.
    #[error("tail continuation `{label}` cannot be cancelled before it is resumed")]
    CancelTail {
        /// Operation label.
        label: String,
    },

    /// The protocol table could not be parsed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The module carries no protocol table.
    #[error("module has no `{0}` section")]
    MissingProtocol(&'static str),

    /// The protocol table lists no export with this name.
    #[error("module does not export `{0}` to the host")]
    UnknownExport(String),

    /// Wrong number of arguments for an export.
    #[error("export `{export}` takes {expected} arguments, got {found}")]
    ArgumentCount {
        /// Export name.
        export: String,
        /// Declared parameter count.
        expected: usize,
        /// Supplied argument count.
        found: usize,
    },

    /// A request named an operation missing from the protocol table.
    #[error("request for unknown operation index {0}")]
    UnknownOp(u32),

    /// No task with this ID.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// The task is suspended and no timer or job can wake it.
    #[error("{0} is suspended with no pending work")]
    Stalled(TaskId),

    /// The task was cancelled before it completed.
    #[error("{0} was cancelled")]
    Cancelled(TaskId),

    /// A handler reported a failure of its own.
    #[error("handler failed: {0}")]
    Handler(String),

    /// An export returned without reporting a value or a request.
    #[error("module settled without reporting a value or request")]
    NoReport,

    /// The module bytes could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The runtime configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A handler key string is malformed.
    #[error(transparent)]
    HandlerKey(#[from] HandlerKeyError),
}
