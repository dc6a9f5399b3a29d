//! Programmatic HIR construction.
//!
//! The front end is not part of this crate, so tests and tools assemble
//! type-checked programs directly. [`BodyBuilder`] takes `&self` everywhere
//! so that nested construction such as `b.call(f, ty, vec![b.int(1)])`
//! borrows cleanly.

use std::cell::{Cell, RefCell};

use crate::span::Span;

use super::{
    BinOp, ContinuationCall, DefId, EffectDecl, Expr, ExprId, ExprKind, FnDecl, Handler,
    HandlerClause, Literal, LocalDecl, LocalId, OpDecl, Program, ResumeKind, SerializerDecl, Stmt,
    StructDecl, Type,
};

/// Build a `resume`-kind operation declaration.
pub fn op(name: &str, params: Vec<Type>, ret: Type) -> OpDecl {
    OpDecl {
        name: name.to_string(),
        params,
        ret,
        resume_kind: ResumeKind::Resume,
        span: Span::dummy(),
    }
}

/// Build a `tail`-kind operation declaration.
pub fn tail_op(name: &str, params: Vec<Type>, ret: Type) -> OpDecl {
    OpDecl {
        resume_kind: ResumeKind::Tail,
        ..op(name, params, ret)
    }
}

/// Assembles a [`Program`], handing out `DefId`s in declaration order.
pub struct ProgramBuilder {
    program: Program,
    next_def: u32,
    next_effect: u32,
}

impl ProgramBuilder {
    pub fn new(module_path: &str) -> Self {
        Self {
            program: Program::new(module_path),
            next_def: 0,
            next_effect: 0,
        }
    }

    /// Reserve a `DefId`, e.g. for a function referenced before it is built.
    pub fn fresh_def(&mut self) -> DefId {
        let id = DefId::new(self.next_def);
        self.next_def += 1;
        id
    }

    /// Declare a non-generic effect without an explicit id.
    pub fn effect(&mut self, name: &str, ops: Vec<OpDecl>) -> DefId {
        self.effect_with(name, None, 0, ops)
    }

    /// Declare an effect with an optional explicit id and generic arity.
    pub fn effect_with(
        &mut self,
        name: &str,
        explicit_id: Option<&str>,
        generics: u32,
        ops: Vec<OpDecl>,
    ) -> DefId {
        let def_id = self.fresh_def();
        let decl_index = self.next_effect;
        self.next_effect += 1;
        self.program.effects.insert(
            def_id,
            EffectDecl {
                def_id,
                name: name.to_string(),
                module_path: self.program.module_path.clone(),
                decl_index,
                explicit_id: explicit_id.map(str::to_string),
                generics,
                ops,
                span: Span::dummy(),
            },
        );
        def_id
    }

    pub fn structure(&mut self, name: &str, generics: u32, fields: Vec<(&str, Type)>) -> DefId {
        let def_id = self.fresh_def();
        self.program.structs.insert(
            def_id,
            StructDecl {
                def_id,
                name: name.to_string(),
                generics,
                fields: fields.into_iter().map(|(n, t)| (n.to_string(), t)).collect(),
                span: Span::dummy(),
            },
        );
        def_id
    }

    /// Add a finished function.
    pub fn function(&mut self, decl: FnDecl) -> DefId {
        let def_id = decl.def_id;
        self.next_def = self.next_def.max(def_id.index + 1);
        self.program.functions.insert(def_id, decl);
        def_id
    }

    pub fn serializer(&mut self, ty: Type, encode: DefId, decode: DefId) {
        self.program.serializers.push(SerializerDecl { ty, encode, decode });
    }

    pub fn finish(self) -> Program {
        self.program
    }
}

/// Builds one function body, allocating expression and local ids.
#[derive(Default)]
pub struct BodyBuilder {
    next_expr: Cell<u32>,
    locals: RefCell<Vec<LocalDecl>>,
    params: RefCell<Vec<LocalId>>,
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn declare(&self, name: &str, ty: Type, mutable: bool) -> LocalId {
        let mut locals = self.locals.borrow_mut();
        let id = LocalId::new(locals.len() as u32);
        locals.push(LocalDecl {
            id,
            name: name.to_string(),
            ty,
            mutable,
        });
        id
    }

    /// Declare a function parameter.
    pub fn param(&self, name: &str, ty: Type) -> LocalId {
        let id = self.declare(name, ty, false);
        self.params.borrow_mut().push(id);
        id
    }

    /// Declare a mutable local.
    pub fn local(&self, name: &str, ty: Type) -> LocalId {
        self.declare(name, ty, true)
    }

    /// Declare an immutable local.
    pub fn constant(&self, name: &str, ty: Type) -> LocalId {
        self.declare(name, ty, false)
    }

    pub fn local_type(&self, id: LocalId) -> Type {
        self.locals
            .borrow()
            .get(id.index as usize)
            .map(|l| l.ty.clone())
            .unwrap_or(Type::Unit)
    }

    pub fn expr(&self, kind: ExprKind, ty: Type) -> Expr {
        let id = ExprId::new(self.next_expr.get());
        self.next_expr.set(id.index + 1);
        Expr {
            id,
            kind,
            ty,
            span: Span::dummy(),
        }
    }

    pub fn unit(&self) -> Expr {
        self.expr(ExprKind::Literal(Literal::Unit), Type::Unit)
    }

    pub fn int(&self, value: i64) -> Expr {
        self.int_of(value, Type::I32)
    }

    pub fn int_of(&self, value: i64, ty: Type) -> Expr {
        self.expr(ExprKind::Literal(Literal::Int(value)), ty)
    }

    pub fn boolean(&self, value: bool) -> Expr {
        self.expr(ExprKind::Literal(Literal::Bool(value)), Type::Bool)
    }

    pub fn var(&self, id: LocalId) -> Expr {
        self.expr(ExprKind::Local(id), self.local_type(id))
    }

    pub fn binary(&self, op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        let ty = if op.is_comparison() || op.is_short_circuit() {
            Type::Bool
        } else {
            lhs.ty.clone()
        };
        self.expr(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        )
    }

    pub fn add(&self, lhs: Expr, rhs: Expr) -> Expr {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn lt(&self, lhs: Expr, rhs: Expr) -> Expr {
        self.binary(BinOp::Lt, lhs, rhs)
    }

    pub fn if_else(&self, cond: Expr, then_branch: Expr, else_branch: Option<Expr>) -> Expr {
        let ty = if else_branch.is_some() {
            then_branch.ty.clone()
        } else {
            Type::Unit
        };
        self.expr(
            ExprKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: else_branch.map(Box::new),
            },
            ty,
        )
    }

    pub fn while_loop(&self, cond: Expr, body: Expr) -> Expr {
        self.expr(
            ExprKind::While {
                cond: Box::new(cond),
                body: Box::new(body),
            },
            Type::Unit,
        )
    }

    pub fn block(&self, stmts: Vec<Stmt>, tail: Option<Expr>) -> Expr {
        let ty = tail.as_ref().map(|t| t.ty.clone()).unwrap_or(Type::Unit);
        self.expr(
            ExprKind::Block {
                stmts,
                tail: tail.map(Box::new),
            },
            ty,
        )
    }

    pub fn let_(&self, local: LocalId, init: Expr) -> Stmt {
        Stmt::Let { local, init }
    }

    pub fn stmt(&self, expr: Expr) -> Stmt {
        Stmt::Expr(expr)
    }

    pub fn assign(&self, local: LocalId, value: Expr) -> Expr {
        self.expr(
            ExprKind::Assign {
                local,
                value: Box::new(value),
            },
            Type::Unit,
        )
    }

    pub fn call(&self, callee: DefId, ret: Type, args: Vec<Expr>) -> Expr {
        self.call_generic(callee, Vec::new(), ret, args)
    }

    pub fn call_generic(&self, callee: DefId, type_args: Vec<Type>, ret: Type, args: Vec<Expr>) -> Expr {
        self.expr(
            ExprKind::Call {
                callee,
                type_args,
                args,
            },
            ret,
        )
    }

    pub fn perform(&self, effect: DefId, op: u32, ret: Type, args: Vec<Expr>) -> Expr {
        self.perform_generic(effect, Vec::new(), op, ret, args)
    }

    pub fn perform_generic(
        &self,
        effect: DefId,
        type_args: Vec<Type>,
        op: u32,
        ret: Type,
        args: Vec<Expr>,
    ) -> Expr {
        self.expr(
            ExprKind::Perform {
                effect,
                type_args,
                op,
                args,
            },
            ret,
        )
    }

    pub fn clause(&self, op: u32, params: Vec<LocalId>, cont: LocalId, body: Expr) -> HandlerClause {
        HandlerClause {
            op,
            params,
            cont,
            body,
            span: Span::dummy(),
        }
    }

    /// `handle body with effect<type_args> { clauses }`
    pub fn handle(&self, body: Expr, effect: DefId, type_args: Vec<Type>, clauses: Vec<HandlerClause>) -> Expr {
        let ty = body.ty.clone();
        self.expr(
            ExprKind::Handle {
                body: Box::new(body),
                handler: Handler {
                    effect,
                    type_args,
                    clauses,
                },
            },
            ty,
        )
    }

    fn continuation_call(&self, call: ContinuationCall, cont: LocalId, value: Expr) -> Expr {
        let ty = match self.local_type(cont) {
            Type::Cont { answer, .. } => *answer,
            _ => Type::Unit,
        };
        self.expr(
            ExprKind::Resume {
                call,
                cont,
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn resume(&self, cont: LocalId, value: Expr) -> Expr {
        self.continuation_call(ContinuationCall::Resume, cont, value)
    }

    pub fn tail(&self, cont: LocalId, value: Expr) -> Expr {
        self.continuation_call(ContinuationCall::Tail, cont, value)
    }

    pub fn end(&self, cont: LocalId, value: Expr) -> Expr {
        self.continuation_call(ContinuationCall::End, cont, value)
    }

    pub fn struct_lit(&self, def_id: DefId, args: Vec<Type>, fields: Vec<Expr>) -> Expr {
        let ty = Type::structure(def_id, args.clone());
        self.expr(
            ExprKind::StructLit {
                def_id,
                args,
                fields,
            },
            ty,
        )
    }

    pub fn field(&self, base: Expr, index: u32, ty: Type) -> Expr {
        self.expr(
            ExprKind::Field {
                base: Box::new(base),
                index,
            },
            ty,
        )
    }

    pub fn ret(&self, value: Expr) -> Expr {
        self.expr(ExprKind::Return(Box::new(value)), Type::Unit)
    }

    /// Finish the function. It starts out non-generic, unexported and
    /// without a declared row.
    pub fn finish(self, def_id: DefId, name: &str, ret: Type, body: Expr) -> FnDecl {
        FnDecl {
            def_id,
            name: name.to_string(),
            generics: 0,
            params: self.params.into_inner(),
            ret,
            declared_effects: None,
            locals: self.locals.into_inner(),
            body,
            export: None,
            span: Span::dummy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_construction_allocates_unique_ids() {
        let b = BodyBuilder::new();
        let x = b.param("x", Type::I32);
        let e = b.add(b.var(x), b.int(1));
        let mut ids = Vec::new();
        e.walk(&mut |n| ids.push(n.id));
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(e.ty, Type::I32);
    }

    #[test]
    fn test_program_builder_orders_effects() {
        let mut pb = ProgramBuilder::new("app");
        let a = pb.effect("A", vec![op("a", vec![], Type::Unit)]);
        let b = pb.effect_with("B", Some("com.example.b"), 1, vec![tail_op("b", vec![Type::Param(0)], Type::Unit)]);
        let program = pb.finish();
        assert_eq!(program.effects[&a].decl_index, 0);
        assert_eq!(program.effects[&b].decl_index, 1);
        assert_eq!(program.effects[&b].ops[0].resume_kind, ResumeKind::Tail);
    }

    #[test]
    fn test_resume_takes_answer_type() {
        let b = BodyBuilder::new();
        let k = b.param("k", Type::cont(Type::I32, Type::Bool));
        let e = b.resume(k, b.int(1));
        assert_eq!(e.ty, Type::Bool);
    }
}
