//! # Tarn Compiler Library
//!
//! The effects half of the Tarn compiler. It takes a type-checked program,
//! works out which code performs which algebraic effects, and compiles it to
//! a module for a garbage-collected register machine that has no native
//! continuations.
//!
//! ## Compiler Pipeline
//!
//! ```text
//! HIR -> Effect Table -> Effects Analysis -> EIR -> GC Trampoline -> Module
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tarnc::config::CompileOptions;
//! use tarnc::hir::{op, BodyBuilder, ProgramBuilder, Type};
//!
//! let mut pb = ProgramBuilder::new("app");
//! let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
//! let main = pb.fresh_def();
//! let b = BodyBuilder::new();
//! let body = b.perform(ask, 0, Type::I32, vec![]);
//! pb.function(b.finish(main, "main", Type::I32, body).exported("main"));
//!
//! let compiled = tarnc::compile_program(&pb.finish(), &CompileOptions::default()).unwrap();
//! assert_eq!(compiled.protocol.ops[0].label.as_deref(), Some("Ask.ask"));
//! ```
//!
//! ## Module Overview
//!
//! - [`hir`] - The typed input program
//! - [`effects`] - Effect table, row inference and call classification
//! - [`eir`] - Continuation sites and their environments
//! - [`codegen`] - The GC trampoline backend
//! - [`target`] - The target module and its binary encoding
//! - [`protocol`] - The host protocol table
//! - [`config`] - Compile options
//! - [`diagnostics`] - Error reporting infrastructure
//! - [`span`] - Source location tracking

pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod effects;
pub mod eir;
pub mod hir;
pub mod protocol;
pub mod span;
pub mod target;

// Re-export commonly used types
pub use codegen::{compile_program, CompiledModule};
pub use config::CompileOptions;
pub use diagnostics::{Diagnostic, DiagnosticEmitter, DiagnosticKind, ErrorCode};
pub use span::Span;
