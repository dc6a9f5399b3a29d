//! # Effect Lowering IR (EIR)
//!
//! The target-independent half of effect lowering. For one function
//! instance the EIR lists every continuation site, grouped by the owner
//! (the function itself, a handled body, or a handler clause) whose code it
//! interrupts, together with the exact environment a suspension there must
//! carry.
//!
//! ```text
//! fn inner(x: i32) -> i32 / {Async} {
//!     let a = perform Async.await(x);   // site 0: env = [handlers]
//!     let b = perform Async.await(a);   // site 1: env = [a]
//!     a + b
//! }
//! ```
//!
//! Backends consume sites exactly once; nothing here depends on how a
//! continuation is materialized.

pub mod builder;
pub mod liveness;

pub use builder::{build_effect_lowering_eir, instance_name};

use std::collections::BTreeSet;
use std::fmt;

use crate::effects::{EffectRef, OpId};
use crate::hir::{ContinuationCall, DefId, ExprId, Literal, LocalId, ResumeKind, Type};
use crate::span::Span;

/// Session-wide source of site ids.
///
/// One counter is shared by every function compiled in a session so that
/// ids never collide across generic instantiations.
#[derive(Debug, Default)]
pub struct SiteCounter {
    next: u32,
}

impl SiteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> SiteId {
        let id = SiteId(self.next);
        self.next += 1;
        id
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u32 {
        self.next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteId(pub u32);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site{}", self.0)
    }
}

/// The code region a site interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SiteOwner {
    Function,
    /// The handled body of the `handle` expression with this id.
    HandleBody(ExprId),
    /// The clause for operation `op` of the `handle` expression `handle`.
    Clause { handle: ExprId, op: u32 },
}

impl SiteOwner {
    /// Whether the owner is a lambda: a handled body or a clause.
    pub fn is_lambda(self) -> bool {
        !matches!(self, SiteOwner::Function)
    }
}

/// What kind of expression a site is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    Perform {
        effect: EffectRef,
        op: OpId,
        resume_kind: ResumeKind,
    },
    Call {
        callee: DefId,
        type_args: Vec<Type>,
    },
    Handle {
        effect: EffectRef,
    },
    Resume {
        call: ContinuationCall,
        cont: LocalId,
    },
}

/// Where a captured environment value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnvSource {
    /// The handler-stack reference active at the site.
    Handler,
    Param(LocalId),
    Local(LocalId),
    /// A sibling operand evaluated before the site and still pending.
    Temporary(ExprId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvField {
    pub source: EnvSource,
    /// Concrete type of the value; `None` for the handler reference.
    pub ty: Option<Type>,
}

/// A value re-established by the continuation instead of being captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rematerialized {
    pub target: EnvSource,
    pub value: Literal,
    pub ty: Type,
}

/// One point where execution may suspend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationSite {
    pub id: SiteId,
    /// Position among the sites of the same owner.
    pub order: u32,
    pub expr: ExprId,
    pub owner: SiteOwner,
    pub kind: SiteKind,
    pub result_ty: Type,
    /// Handler reference, parameters, locals by id, then temporaries in
    /// evaluation order.
    pub env: Vec<EnvField>,
    pub rematerialized: Vec<Rematerialized>,
    /// A perform whose owner is a handled body installing exactly the
    /// performed effect instance.
    pub direct_handler: bool,
    pub span: Span,
}

impl ContinuationSite {
    /// Whether resuming this site must run the result through the handler
    /// frame it tracks.
    pub fn tracks_frame(&self) -> bool {
        matches!(self.kind, SiteKind::Handle { .. } | SiteKind::Resume { .. })
    }
}

/// Pending operands of one call-like expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgTemporaries {
    pub call: ExprId,
    /// Per argument: whether evaluating it may suspend.
    pub resumable: Vec<bool>,
    /// Earlier arguments whose values are captured across a later
    /// argument's suspension.
    pub captured: Vec<ExprId>,
}

/// Sites of one owner.
#[derive(Debug, Clone)]
pub struct OwnerEir {
    pub owner: SiteOwner,
    /// Outer locals a lambda receives by value, sorted by id.
    pub captures: Vec<LocalId>,
    pub sites: Vec<ContinuationSite>,
    pub temporaries: Vec<ArgTemporaries>,
}

impl OwnerEir {
    pub fn site_at(&self, expr: ExprId) -> Option<&ContinuationSite> {
        self.sites.iter().find(|s| s.expr == expr)
    }
}

/// EIR of one function instance.
#[derive(Debug, Clone)]
pub struct FunctionEir {
    pub def_id: DefId,
    pub type_args: Vec<Type>,
    pub name: String,
    pub effectful: bool,
    /// The function owner first, lambdas in discovery order.
    pub owners: Vec<OwnerEir>,
    /// Locals a lambda assigns while they are bound outside it. They live in
    /// a heap cell, and every owner refers to them through it.
    pub cells: BTreeSet<LocalId>,
}

impl FunctionEir {
    pub fn is_cell(&self, local: LocalId) -> bool {
        self.cells.contains(&local)
    }

    pub fn owner(&self, owner: SiteOwner) -> Option<&OwnerEir> {
        self.owners.iter().find(|o| o.owner == owner)
    }

    /// Union of the captures of every clause of `handle`: the fields of the
    /// environment its clauses share.
    pub fn clause_captures(&self, handle: ExprId) -> Vec<LocalId> {
        let mut out: Vec<LocalId> = self
            .owners
            .iter()
            .filter(|o| matches!(o.owner, SiteOwner::Clause { handle: h, .. } if h == handle))
            .flat_map(|o| o.captures.iter().copied())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn sites(&self) -> impl Iterator<Item = &ContinuationSite> {
        self.owners.iter().flat_map(|o| o.sites.iter())
    }

    pub fn site_count(&self) -> usize {
        self.owners.iter().map(|o| o.sites.len()).sum()
    }
}
