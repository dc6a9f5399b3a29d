//! HIR expressions.
//!
//! Expressions are fully typed and name-resolved. Every node carries an
//! [`ExprId`] unique within its function; the effects analysis keys its
//! classification on these ids and the EIR builder keys continuation sites
//! on them.

use crate::span::Span;

use super::{DefId, ExprId, LocalId, Type};

/// A typed expression.
#[derive(Debug, Clone)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
    pub ty: Type,
    pub span: Span,
}

/// A literal value. Integer literals take the width of the expression type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Literal {
    Unit,
    Bool(bool),
    Int(i64),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuiting `&&`.
    And,
    /// Short-circuiting `||`.
    Or,
}

impl BinOp {
    /// Whether the result is `bool` regardless of the operand type.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    /// Whether the right operand is evaluated conditionally.
    pub fn is_short_circuit(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

/// The three ways a handler clause may invoke its continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContinuationCall {
    /// Resume the performing computation.
    Resume,
    /// Resume as the final action of a `tail` operation's clause.
    Tail,
    /// Resume and mark the continuation as finished.
    End,
}

impl ContinuationCall {
    pub fn keyword(self) -> &'static str {
        match self {
            ContinuationCall::Resume => "resume",
            ContinuationCall::Tail => "tail",
            ContinuationCall::End => "end",
        }
    }
}

/// Expression kinds.
#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    /// Read a local variable or parameter.
    Local(LocalId),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },
    While {
        cond: Box<Expr>,
        body: Box<Expr>,
    },
    Block {
        stmts: Vec<Stmt>,
        tail: Option<Box<Expr>>,
    },
    Assign {
        local: LocalId,
        value: Box<Expr>,
    },
    /// Direct call of a function, with the type arguments of this
    /// instantiation.
    Call {
        callee: DefId,
        type_args: Vec<Type>,
        args: Vec<Expr>,
    },
    /// Perform operation `op` of `effect` instantiated with `type_args`.
    Perform {
        effect: DefId,
        type_args: Vec<Type>,
        op: u32,
        args: Vec<Expr>,
    },
    /// Run `body` with `handler` installed.
    Handle {
        body: Box<Expr>,
        handler: Handler,
    },
    /// Invoke a clause's continuation parameter.
    Resume {
        call: ContinuationCall,
        cont: LocalId,
        value: Box<Expr>,
    },
    StructLit {
        def_id: DefId,
        args: Vec<Type>,
        fields: Vec<Expr>,
    },
    Field {
        base: Box<Expr>,
        index: u32,
    },
    Return(Box<Expr>),
}

/// A statement inside a block.
#[derive(Debug, Clone)]
pub enum Stmt {
    Let { local: LocalId, init: Expr },
    Expr(Expr),
}

/// A handler installed by a `handle` expression.
#[derive(Debug, Clone)]
pub struct Handler {
    pub effect: DefId,
    pub type_args: Vec<Type>,
    pub clauses: Vec<HandlerClause>,
}

impl Handler {
    /// The clause handling operation `op`, if any.
    pub fn clause(&self, op: u32) -> Option<&HandlerClause> {
        self.clauses.iter().find(|c| c.op == op)
    }
}

/// One operation clause: `op(params..., cont) => body`.
#[derive(Debug, Clone)]
pub struct HandlerClause {
    pub op: u32,
    pub params: Vec<LocalId>,
    pub cont: LocalId,
    pub body: Expr,
    pub span: Span,
}

impl Expr {
    /// Direct sub-expressions in evaluation order.
    ///
    /// Handled bodies and clause bodies are included after everything the
    /// `handle` expression itself evaluates.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Local(_) => Vec::new(),
            ExprKind::Binary { lhs, rhs, .. } => vec![&**lhs, &**rhs],
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut out: Vec<&Expr> = vec![&**cond, &**then_branch];
                if let Some(e) = else_branch {
                    out.push(&**e);
                }
                out
            }
            ExprKind::While { cond, body } => vec![&**cond, &**body],
            ExprKind::Block { stmts, tail } => {
                let mut out: Vec<&Expr> = stmts
                    .iter()
                    .map(|s| match s {
                        Stmt::Let { init, .. } => init,
                        Stmt::Expr(e) => e,
                    })
                    .collect();
                if let Some(t) = tail {
                    out.push(&**t);
                }
                out
            }
            ExprKind::Assign { value, .. } => vec![&**value],
            ExprKind::Call { args, .. } | ExprKind::Perform { args, .. } => args.iter().collect(),
            ExprKind::Handle { body, handler } => {
                let mut out: Vec<&Expr> = vec![&**body];
                out.extend(handler.clauses.iter().map(|c| &c.body));
                out
            }
            ExprKind::Resume { value, .. } => vec![&**value],
            ExprKind::StructLit { fields, .. } => fields.iter().collect(),
            ExprKind::Field { base, .. } => vec![&**base],
            ExprKind::Return(value) => vec![&**value],
        }
    }

    /// Pre-order traversal over this expression and all descendants.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    /// Find a descendant (or self) by id.
    pub fn find(&self, id: ExprId) -> Option<&Expr> {
        if self.id == id {
            return Some(self);
        }
        self.children().into_iter().find_map(|c| c.find(id))
    }

    /// Whether this expression is a literal.
    pub fn as_literal(&self) -> Option<Literal> {
        match self.kind {
            ExprKind::Literal(lit) => Some(lit),
            _ => None,
        }
    }
}
