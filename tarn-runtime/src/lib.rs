//! # Tarn Runtime Library
//!
//! The host side of compiled Tarn modules:
//!
//! - **Machine**: executes target modules with GC structs, linear memory and
//!   host imports
//! - **Host Runtime**: reads the protocol table, dispatches effect requests
//!   to registered handlers and feeds continuation calls back in
//! - **Continuations**: the handler-facing `resume`/`tail`/`end` objects and
//!   the tail guard
//! - **Scheduler**: FIFO task queue and virtual clock, so timer-driven
//!   resumption is reproducible
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         TARN RUNTIME                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────┐      │
//! │  │  Scheduler   │  │  Host Runtime  │  │ Continuation │      │
//! │  │(scheduler.rs)│◄─┤   (host.rs)    ├─►│(continuation)│      │
//! │  └──────────────┘  └───────┬────────┘  └──────────────┘      │
//! │                            │ imports / exports                │
//! │                    ┌───────▼────────┐                         │
//! │                    │    Machine     │                         │
//! │                    │  (machine.rs)  │                         │
//! │                    └────────────────┘                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tarn_runtime::{Handled, HostRuntime, RuntimeConfig};
//! use tarnc::hir::{op, BodyBuilder, ProgramBuilder, Type};
//!
//! let mut pb = ProgramBuilder::new("app");
//! let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
//! let main = pb.fresh_def();
//! let b = BodyBuilder::new();
//! let body = b.perform(ask, 0, Type::I32, vec![]);
//! pb.function(b.finish(main, "main", Type::I32, body).exported("main"));
//! let compiled = tarnc::compile_program(&pb.finish(), &Default::default()).unwrap();
//!
//! let mut rt = HostRuntime::new(&compiled.to_bytes(), RuntimeConfig::default()).unwrap();
//! let key = rt.op_by_label("Ask.ask").unwrap().key();
//! rt.register(key, |call| Ok(Handled::Resumed(call.cont.resume(42)?)));
//! assert_eq!(rt.run("main", vec![]).unwrap().as_i64(), 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod continuation;
pub mod error;
pub mod host;
pub mod machine;
pub mod scheduler;

// Re-exports
pub use config::{init_logging, ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use continuation::{CallMode, Continuation, ContinuationCall, ContinuationId};
pub use error::RuntimeError;
pub use host::{EffectCall, Handled, HandlerFn, HostRuntime, HostValue};
pub use machine::{Imports, Instance, MachineError, Memory, NoImports, Value};
pub use scheduler::{Scheduler, SchedulerHandle, TaskId, TaskState};
