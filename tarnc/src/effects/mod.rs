//! # Effects System
//!
//! Tarn compiles algebraic effects by lowering them to explicit
//! continuation-passing over a trampoline. This module owns the front half
//! of that pipeline: knowing which effects exist and which code performs
//! them.
//!
//! ## Implementation Strategy
//!
//! ```text
//! // Source (with effects)
//! fn increment() / {State<i32>} {
//!     let x = perform State.get()
//!     perform State.put(x + 1)
//! }
//!
//! // After analysis: the function's row is {State<i32>}, both performs are
//! // continuation sites, and any caller of `increment` is one too.
//! ```
//!
//! ## Module Structure
//!
//! - [`table`] - Effect identities, operation ids and signature hashes
//! - [`row`] - Effect row sets
//! - [`infer`] - Validation, row inference and call classification
//! - [`handler`] - Static checks on handler clauses

pub mod handler;
pub mod infer;
pub mod row;
pub mod table;

pub use handler::{analyze_resume_mode, check_tail_clause, is_tail_resume, ResumeMode};
pub use infer::{analyze_program, CallClass, EffectAnalysis, EffectsIr, FunctionEffects};
pub use row::{EffectRef, EffectRow};
pub use table::{
    signature_hash, EffectEntry, EffectId, EffectTable, OpId, OperationEntry, SignatureHash,
    FORMAT_VERSION,
};
