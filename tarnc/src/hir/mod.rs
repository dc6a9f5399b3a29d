//! High-level Intermediate Representation (HIR) for Tarn.
//!
//! The HIR is the resolved, typed tree the front end hands to the effects
//! pipeline:
//!
//! 1. **Types are resolved** - every expression carries its [`Type`]
//! 2. **Names are resolved** - identifiers are [`DefId`]s or [`LocalId`]s
//! 3. **Effects are explicit** - `perform`, `handle` and continuation calls
//!    are dedicated expression forms
//!
//! # HIR Structure
//!
//! - [`Program`] - Root node with effects, structs, functions and serializers
//! - [`FnDecl`] - A function with its local table and body
//! - [`Expr`] - Typed expressions
//! - [`SymbolTypes`] - The type checker's resolved signatures
//!
//! # Lowering Pipeline
//!
//! ```text
//! HIR -> Effects Analysis -> EIR -> GC Trampoline Backend -> module
//! ```

pub mod builder;
pub mod def;
pub mod expr;
pub mod item;
pub mod ty;

pub use builder::{op, tail_op, BodyBuilder, ProgramBuilder};
pub use def::{DefId, ExprId, LocalId};
pub use expr::{BinOp, ContinuationCall, Expr, ExprKind, Handler, HandlerClause, Literal, Stmt};
pub use item::{
    EffectDecl, FnDecl, FnSignature, LocalDecl, OpDecl, Program, ResumeKind, SerializerDecl,
    StructDecl, SymbolTypes,
};
pub use ty::Type;
