//! # Handler Clause Analysis
//!
//! Static checks on handler clauses that the backend relies on.
//!
//! ## Tail Operations
//!
//! A `tail` operation's clause is dispatched in place: the performing code
//! does not suspend, the clause runs and its continuation call simply hands
//! the value back. That is only sound when the continuation call is the last
//! thing the clause does, so every direct continuation call in such a clause
//! must sit in tail position. Forwarding the continuation to another function
//! cannot be checked statically; the runtime guard catches misuse there.

use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::hir::{Expr, ExprKind, HandlerClause, LocalId, Stmt};
use crate::span::Span;

/// How a clause uses its continuation, as far as the static shape shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Every path ends in exactly one continuation call in tail position.
    Tail,
    /// The continuation is called, but not only in tail position.
    Direct,
    /// More than one continuation call appears in the clause.
    MultiShot,
    /// The continuation is never called directly (dropped or forwarded).
    Unused,
}

/// Classify how a clause body uses continuation `cont`.
pub fn analyze_resume_mode(body: &Expr, cont: LocalId) -> ResumeMode {
    match count_continuation_calls(body, cont) {
        0 => ResumeMode::Unused,
        1 if is_tail_resume(body, cont) => ResumeMode::Tail,
        1 => ResumeMode::Direct,
        _ if is_tail_resume(body, cont) && tail_position_violations(body, cont).is_empty() => ResumeMode::Tail,
        _ => ResumeMode::MultiShot,
    }
}

/// Whether every path through `expr` ends with a call of `cont`.
pub fn is_tail_resume(expr: &Expr, cont: LocalId) -> bool {
    match &expr.kind {
        ExprKind::Resume { cont: c, .. } => *c == cont,
        ExprKind::Block { tail: Some(tail), .. } => is_tail_resume(tail, cont),
        ExprKind::Block { tail: None, .. } => false,
        ExprKind::If {
            then_branch,
            else_branch: Some(else_branch),
            ..
        } => is_tail_resume(then_branch, cont) && is_tail_resume(else_branch, cont),
        ExprKind::If { else_branch: None, .. } => false,
        _ => false,
    }
}

/// Count the direct calls of `cont` in a tree.
pub fn count_continuation_calls(expr: &Expr, cont: LocalId) -> usize {
    let mut count = 0;
    expr.walk(&mut |e| {
        if let ExprKind::Resume { cont: c, .. } = &e.kind {
            if *c == cont {
                count += 1;
            }
        }
    });
    count
}

/// Whether `cont` is read as a plain value (forwarded somewhere).
pub fn is_forwarded(expr: &Expr, cont: LocalId) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let ExprKind::Local(l) = &e.kind {
            if *l == cont {
                found = true;
            }
        }
    });
    found
}

/// Spans of continuation calls of `cont` that are not in tail position.
pub fn tail_position_violations(body: &Expr, cont: LocalId) -> Vec<Span> {
    let mut out = Vec::new();
    collect_violations(body, cont, true, &mut out);
    out
}

fn collect_violations(expr: &Expr, cont: LocalId, in_tail: bool, out: &mut Vec<Span>) {
    match &expr.kind {
        ExprKind::Resume { cont: c, value, .. } => {
            if *c == cont && !in_tail {
                out.push(expr.span);
            }
            collect_violations(value, cont, false, out);
        }
        ExprKind::Block { stmts, tail } => {
            for stmt in stmts {
                match stmt {
                    Stmt::Let { init, .. } => collect_violations(init, cont, false, out),
                    Stmt::Expr(e) => collect_violations(e, cont, false, out),
                }
            }
            if let Some(tail) = tail {
                collect_violations(tail, cont, in_tail, out);
            }
        }
        ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            collect_violations(cond, cont, false, out);
            collect_violations(then_branch, cont, in_tail, out);
            if let Some(e) = else_branch {
                collect_violations(e, cont, in_tail, out);
            }
        }
        _ => {
            for child in expr.children() {
                collect_violations(child, cont, false, out);
            }
        }
    }
}

/// Check the clause of a `tail` operation.
///
/// Misplaced continuation calls are errors. A clause that neither calls nor
/// forwards its continuation gets a warning: it is certain to trip the
/// runtime guard.
pub fn check_tail_clause(clause: &HandlerClause, op_name: &str) -> Vec<Diagnostic> {
    let mut diags: Vec<Diagnostic> = tail_position_violations(&clause.body, clause.cont)
        .into_iter()
        .map(|span| {
            Diagnostic::error(
                format!("continuation of tail operation `{}` is invoked outside tail position", op_name),
                span,
            )
            .with_error_code(ErrorCode::TailResumeNotInTailPosition)
        })
        .collect();
    if analyze_resume_mode(&clause.body, clause.cont) == ResumeMode::Unused
        && !is_forwarded(&clause.body, clause.cont)
    {
        diags.push(Diagnostic::warning(
            format!("clause for tail operation `{}` never resumes its continuation", op_name),
            clause.span,
        ));
    }
    diags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{BodyBuilder, Type};

    #[test]
    fn test_direct_resume_is_tail_resumptive() {
        let b = BodyBuilder::new();
        let k = b.param("k", Type::cont(Type::I32, Type::I32));
        let body = b.tail(k, b.int(1));
        assert!(is_tail_resume(&body, k));
        assert_eq!(analyze_resume_mode(&body, k), ResumeMode::Tail);
    }

    #[test]
    fn test_block_without_tail_not_tail_resumptive() {
        let b = BodyBuilder::new();
        let k = b.param("k", Type::cont(Type::I32, Type::I32));
        let body = b.block(vec![b.stmt(b.tail(k, b.int(1)))], None);
        assert!(!is_tail_resume(&body, k));
        assert_eq!(tail_position_violations(&body, k).len(), 1);
    }

    #[test]
    fn test_if_branches_in_tail_position() {
        let b = BodyBuilder::new();
        let k = b.param("k", Type::cont(Type::I32, Type::I32));
        let body = b.if_else(b.boolean(true), b.tail(k, b.int(1)), Some(b.tail(k, b.int(2))));
        assert!(is_tail_resume(&body, k));
        assert!(tail_position_violations(&body, k).is_empty());
        assert_eq!(count_continuation_calls(&body, k), 2);
        assert_eq!(analyze_resume_mode(&body, k), ResumeMode::Tail);
    }

    #[test]
    fn test_resume_inside_operand_is_violation() {
        let b = BodyBuilder::new();
        let k = b.param("k", Type::cont(Type::I32, Type::I32));
        let body = b.add(b.tail(k, b.int(1)), b.int(2));
        assert_eq!(tail_position_violations(&body, k).len(), 1);
        assert_eq!(analyze_resume_mode(&body, k), ResumeMode::Direct);
    }

    #[test]
    fn test_unused_clause_warns() {
        let b = BodyBuilder::new();
        let k = b.param("k", Type::cont(Type::Unit, Type::Unit));
        let clause = b.clause(0, vec![], k, b.unit());
        let diags = check_tail_clause(&clause, "log");
        assert_eq!(diags.len(), 1);
        assert!(!diags[0].is_error());
    }
}
