//! EIR construction.
//!
//! Walks one function instance in evaluation order, one owner at a time,
//! creating a [`ContinuationSite`] for every expression the effects analysis
//! classified as a perform or an effectful call. Environments come from
//! liveness over the owner's flow graph; operands evaluated before a site
//! and still waiting for their siblings are captured as temporaries.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::liveness::{BlockId, Event, FlowGraph, Var, ENTRY, EXIT};
use super::{
    ArgTemporaries, ContinuationSite, EnvField, EnvSource, FunctionEir, OwnerEir, Rematerialized,
    SiteCounter, SiteKind, SiteOwner,
};
use crate::diagnostics::Diagnostic;
use crate::effects::{EffectRef, EffectTable, EffectsIr, FunctionEffects, OpId};
use crate::hir::{
    DefId, Expr, ExprId, ExprKind, FnDecl, Literal, LocalId, Program, ResumeKind, Stmt, SymbolTypes,
    Type,
};
use crate::span::Span;

/// Display name of a function instance, e.g. `get<i32>`.
pub fn instance_name(program: &Program, def_id: DefId, type_args: &[Type]) -> String {
    let base = program
        .symbol_name(def_id)
        .map(str::to_string)
        .unwrap_or_else(|| def_id.to_string());
    if type_args.is_empty() {
        return base;
    }
    let args: Vec<String> = type_args.iter().map(|t| program.type_name(t)).collect();
    format!("{}<{}>", base, args.join(", "))
}

/// Build the EIR of `def_id` instantiated with `type_args`.
pub fn build_effect_lowering_eir(
    program: &Program,
    effects: &EffectsIr,
    table: &EffectTable,
    def_id: DefId,
    type_args: &[Type],
    counter: &mut SiteCounter,
) -> Result<FunctionEir, Vec<Diagnostic>> {
    let f = program
        .function(def_id)
        .ok_or_else(|| vec![Diagnostic::ice(format!("no body for {}", def_id), Span::dummy())])?;
    let fx = effects
        .function(def_id)
        .ok_or_else(|| vec![Diagnostic::ice(format!("`{}` was never analyzed", f.name), f.span)])?;
    let cells = shared_cells(f);
    let remat = rematerializable_locals(f, &cells);

    let mut queue = VecDeque::new();
    queue.push_back(Lambda {
        owner: SiteOwner::Function,
        root: &f.body,
        bound: Vec::new(),
        handled: None,
        cont: None,
        tail_cont: None,
    });

    let mut owners = Vec::new();
    let mut diagnostics = Vec::new();
    while let Some(lambda) = queue.pop_front() {
        let captures = if lambda.owner.is_lambda() {
            free_locals(lambda.root, &lambda.bound)
        } else {
            Vec::new()
        };
        let mut walker = OwnerWalker {
            table,
            fx,
            f,
            type_args,
            remat: &remat,
            cells: &cells,
            owner: lambda.owner,
            cont: lambda.cont,
            handled: lambda.handled,
            graph: FlowGraph::new(),
            current: ENTRY,
            pending: Vec::new(),
            sites: Vec::new(),
            temporaries: Vec::new(),
            nested: Vec::new(),
            diagnostics: Vec::new(),
        };
        walker.walk(lambda.root);
        walker.finish_exit(lambda.tail_cont);
        queue.extend(walker.nested.drain(..));
        diagnostics.append(&mut walker.diagnostics);
        owners.push(walker.into_owner(captures, counter));
    }

    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(diagnostics);
    }

    let eir = FunctionEir {
        def_id,
        type_args: type_args.to_vec(),
        name: instance_name(program, def_id, type_args),
        effectful: fx.is_effectful(),
        owners,
        cells,
    };
    tracing::debug!(function = %eir.name, owners = eir.owners.len(), sites = eir.site_count(), "built EIR");
    Ok(eir)
}

/// Locals assigned inside a handled body or clause that bind them outside.
///
/// Lambdas receive outer locals by value, so such a local is moved into a
/// heap cell for its whole lifetime; the function and every lambda then
/// read and write the same storage.
fn shared_cells(f: &FnDecl) -> BTreeSet<LocalId> {
    let mut cells = BTreeSet::new();
    f.body.walk(&mut |e| {
        if let ExprKind::Handle { body, handler } = &e.kind {
            let free = free_locals(body, &[]);
            cells.extend(assigned_locals(body).into_iter().filter(|l| free.contains(l)));
            for clause in &handler.clauses {
                let mut bound = clause.params.clone();
                bound.push(clause.cont);
                let free = free_locals(&clause.body, &bound);
                cells.extend(assigned_locals(&clause.body).into_iter().filter(|l| free.contains(l)));
            }
        }
    });
    cells
}

fn assigned_locals(root: &Expr) -> BTreeSet<LocalId> {
    let mut out = BTreeSet::new();
    root.walk(&mut |e| {
        if let ExprKind::Assign { local, .. } = &e.kind {
            out.insert(*local);
        }
    });
    out
}

/// Immutable locals bound exactly once to a literal.
fn rematerializable_locals(f: &FnDecl, cells: &BTreeSet<LocalId>) -> BTreeMap<LocalId, Literal> {
    let mut bindings: BTreeMap<LocalId, (usize, Option<Literal>)> = BTreeMap::new();
    f.body.walk(&mut |e| {
        if let ExprKind::Block { stmts, .. } = &e.kind {
            for stmt in stmts {
                if let Stmt::Let { local, init } = stmt {
                    let slot = bindings.entry(*local).or_insert((0, None));
                    slot.0 += 1;
                    slot.1 = init.as_literal();
                }
            }
        }
    });
    bindings
        .into_iter()
        .filter(|(local, (count, _))| {
            *count == 1 && !cells.contains(local) && f.local(*local).is_some_and(|d| !d.mutable)
        })
        .filter_map(|(local, (_, lit))| lit.map(|l| (local, l)))
        .collect()
}

/// Locals referenced in `root` but bound outside it, sorted by id.
fn free_locals(root: &Expr, bound: &[LocalId]) -> Vec<LocalId> {
    let mut uses = BTreeSet::new();
    let mut binders: BTreeSet<LocalId> = bound.iter().copied().collect();
    root.walk(&mut |e| match &e.kind {
        ExprKind::Local(l) => {
            uses.insert(*l);
        }
        ExprKind::Assign { local, .. } => {
            uses.insert(*local);
        }
        ExprKind::Resume { cont, .. } => {
            uses.insert(*cont);
        }
        ExprKind::Block { stmts, .. } => {
            for stmt in stmts {
                if let Stmt::Let { local, .. } = stmt {
                    binders.insert(*local);
                }
            }
        }
        ExprKind::Handle { handler, .. } => {
            for clause in &handler.clauses {
                binders.extend(clause.params.iter().copied());
                binders.insert(clause.cont);
            }
        }
        _ => {}
    });
    uses.difference(&binders).copied().collect()
}

/// An owner waiting to be walked.
struct Lambda<'a> {
    owner: SiteOwner,
    root: &'a Expr,
    /// Locals bound on entry besides the captures (clause params and
    /// continuation).
    bound: Vec<LocalId>,
    /// The effect instance installed around a handled body.
    handled: Option<EffectRef>,
    /// A clause's continuation parameter.
    cont: Option<LocalId>,
    /// Continuation of a `tail` operation's clause, checked on exit.
    tail_cont: Option<LocalId>,
}

#[derive(Debug, Clone)]
struct Pending {
    expr: ExprId,
    literal: Option<Literal>,
    ty: Type,
}

struct SiteDraft {
    expr: ExprId,
    kind: SiteKind,
    result_ty: Type,
    pending: Vec<Pending>,
    direct_handler: bool,
    span: Span,
}

struct OwnerWalker<'a> {
    table: &'a EffectTable,
    fx: &'a FunctionEffects,
    f: &'a FnDecl,
    type_args: &'a [Type],
    remat: &'a BTreeMap<LocalId, Literal>,
    cells: &'a BTreeSet<LocalId>,
    owner: SiteOwner,
    cont: Option<LocalId>,
    handled: Option<EffectRef>,
    graph: FlowGraph,
    current: BlockId,
    pending: Vec<Pending>,
    sites: Vec<SiteDraft>,
    temporaries: Vec<ArgTemporaries>,
    nested: Vec<Lambda<'a>>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> OwnerWalker<'a> {
    fn concrete(&self, ty: &Type) -> Type {
        ty.substitute(self.type_args)
    }

    fn concrete_args(&self, args: &[Type]) -> Vec<Type> {
        args.iter().map(|t| self.concrete(t)).collect()
    }

    fn use_var(&mut self, var: Var) {
        self.graph.push(self.current, Event::Use(var));
    }

    fn def_var(&mut self, var: Var) {
        self.graph.push(self.current, Event::Def(var));
    }

    fn is_site(&self, e: &Expr) -> bool {
        self.fx.calls.get(&e.id).is_some_and(|c| c.is_site())
    }

    fn site(&mut self, e: &Expr, kind: SiteKind) {
        let direct_handler = match (&kind, &self.handled) {
            (SiteKind::Perform { effect, .. }, Some(handled)) => effect == handled,
            _ => false,
        };
        let index = self.sites.len();
        self.graph.push(self.current, Event::Site(index));
        self.sites.push(SiteDraft {
            expr: e.id,
            kind,
            result_ty: self.concrete(&e.ty),
            pending: self.pending.clone(),
            direct_handler,
            span: e.span,
        });
    }

    fn push_pending(&mut self, e: &Expr) {
        self.pending.push(Pending {
            expr: e.id,
            literal: e.as_literal(),
            ty: self.concrete(&e.ty),
        });
    }

    fn walk(&mut self, e: &'a Expr) {
        match &e.kind {
            ExprKind::Literal(_) => {}
            ExprKind::Local(l) => self.use_var(Var::Local(*l)),
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_short_circuit() {
                    self.walk(lhs);
                    let rhs_block = self.graph.new_block();
                    let join = self.graph.new_block();
                    self.graph.edge(self.current, rhs_block);
                    self.graph.edge(self.current, join);
                    self.current = rhs_block;
                    self.walk(rhs);
                    self.graph.edge(self.current, join);
                    self.current = join;
                } else {
                    let base = self.pending.len();
                    self.walk(lhs);
                    self.push_pending(lhs);
                    self.walk(rhs);
                    self.pending.truncate(base);
                }
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.walk(cond);
                let then_block = self.graph.new_block();
                let else_block = self.graph.new_block();
                let join = self.graph.new_block();
                self.graph.edge(self.current, then_block);
                self.graph.edge(self.current, else_block);
                self.current = then_block;
                self.walk(then_branch);
                self.graph.edge(self.current, join);
                self.current = else_block;
                if let Some(else_branch) = else_branch {
                    self.walk(else_branch);
                }
                self.graph.edge(self.current, join);
                self.current = join;
            }
            ExprKind::While { cond, body } => {
                let header = self.graph.new_block();
                self.graph.edge(self.current, header);
                self.current = header;
                self.walk(cond);
                let body_block = self.graph.new_block();
                let after = self.graph.new_block();
                self.graph.edge(self.current, body_block);
                self.graph.edge(self.current, after);
                self.current = body_block;
                self.walk(body);
                self.graph.edge(self.current, header);
                self.current = after;
            }
            ExprKind::Block { stmts, tail } => {
                for stmt in stmts {
                    match stmt {
                        Stmt::Let { local, init } => {
                            self.walk(init);
                            self.def_var(Var::Local(*local));
                        }
                        Stmt::Expr(expr) => self.walk(expr),
                    }
                }
                if let Some(tail) = tail {
                    self.walk(tail);
                }
            }
            ExprKind::Assign { local, value } => {
                self.walk(value);
                // Writing a cell needs the cell itself.
                if self.cells.contains(local) {
                    self.use_var(Var::Local(*local));
                } else {
                    self.def_var(Var::Local(*local));
                }
            }
            ExprKind::Call {
                callee,
                type_args,
                args,
            } => {
                self.walk_args(e.id, args);
                if self.is_site(e) {
                    self.use_var(Var::Handlers);
                    let kind = SiteKind::Call {
                        callee: *callee,
                        type_args: self.concrete_args(type_args),
                    };
                    self.site(e, kind);
                }
            }
            ExprKind::Perform {
                effect,
                type_args,
                op,
                args,
            } => {
                self.walk_args(e.id, args);
                self.use_var(Var::Handlers);
                let table = self.table;
                match table.resolve(*effect, *op, e.span) {
                    Ok((_, operation)) => {
                        let kind = SiteKind::Perform {
                            effect: EffectRef::new(*effect, self.concrete_args(type_args)),
                            op: OpId(*op),
                            resume_kind: operation.resume_kind,
                        };
                        self.site(e, kind);
                    }
                    Err(diag) => self.diagnostics.push(diag),
                }
            }
            ExprKind::Handle { body, handler } => {
                let effect = EffectRef::new(handler.effect, self.concrete_args(&handler.type_args));
                self.nested.push(Lambda {
                    owner: SiteOwner::HandleBody(e.id),
                    root: &**body,
                    bound: Vec::new(),
                    handled: Some(effect.clone()),
                    cont: None,
                    tail_cont: None,
                });
                let mut used = free_locals(body, &[]);
                for clause in &handler.clauses {
                    let kind = self
                        .table
                        .operation(handler.effect, clause.op)
                        .map(|o| o.resume_kind)
                        .unwrap_or_default();
                    let mut bound = clause.params.clone();
                    bound.push(clause.cont);
                    used.extend(free_locals(&clause.body, &bound));
                    self.nested.push(Lambda {
                        owner: SiteOwner::Clause {
                            handle: e.id,
                            op: clause.op,
                        },
                        root: &clause.body,
                        bound,
                        handled: None,
                        cont: Some(clause.cont),
                        tail_cont: (kind == ResumeKind::Tail).then_some(clause.cont),
                    });
                }
                used.sort();
                used.dedup();
                for local in used {
                    self.use_var(Var::Local(local));
                }
                self.use_var(Var::Handlers);
                if self.is_site(e) {
                    self.site(e, SiteKind::Handle { effect });
                }
            }
            ExprKind::Resume { call, cont, value } => {
                self.walk(value);
                self.use_var(Var::Local(*cont));
                if self.is_site(e) {
                    self.site(
                        e,
                        SiteKind::Resume {
                            call: *call,
                            cont: *cont,
                        },
                    );
                }
            }
            ExprKind::StructLit { fields, .. } => self.walk_args(e.id, fields),
            ExprKind::Field { base, .. } => self.walk(base),
            ExprKind::Return(value) => {
                self.walk(value);
                // A lambda tags its early return with the frame it leaves:
                // the body's handler reference, a clause's continuation.
                match (self.owner, self.cont) {
                    (SiteOwner::HandleBody(_), _) => self.use_var(Var::Handlers),
                    (SiteOwner::Clause { .. }, Some(cont)) => self.use_var(Var::Local(cont)),
                    _ => {}
                }
                self.graph.edge(self.current, EXIT);
                self.current = self.graph.new_block();
            }
        }
    }

    /// Walk operands left to right, keeping earlier ones pending while
    /// later ones are evaluated.
    fn walk_args(&mut self, call: ExprId, args: &'a [Expr]) {
        let base = self.pending.len();
        let mut resumable = Vec::with_capacity(args.len());
        let mut captured = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let before = self.sites.len();
            self.walk(arg);
            let suspends = self.sites.len() > before;
            resumable.push(suspends);
            if suspends {
                for earlier in &args[..i] {
                    if earlier.as_literal().is_none() && !captured.contains(&earlier.id) {
                        captured.push(earlier.id);
                    }
                }
            }
            if i + 1 < args.len() {
                self.push_pending(arg);
            }
        }
        self.pending.truncate(base);
        if resumable.iter().any(|r| *r) {
            self.temporaries.push(ArgTemporaries {
                call,
                resumable,
                captured,
            });
        }
    }

    fn finish_exit(&mut self, tail_cont: Option<LocalId>) {
        self.graph.edge(self.current, EXIT);
        if let Some(cont) = tail_cont {
            self.graph.push(EXIT, Event::Use(Var::Local(cont)));
        }
    }

    fn local_field(&self, local: LocalId, env: &mut Vec<EnvField>, remat: &mut Vec<Rematerialized>) {
        let source = if self.f.params.contains(&local) {
            EnvSource::Param(local)
        } else {
            EnvSource::Local(local)
        };
        let ty = self
            .f
            .local(local)
            .map(|d| self.concrete(&d.ty))
            .unwrap_or(Type::Unit);
        match self.remat.get(&local) {
            Some(value) => remat.push(Rematerialized {
                target: source,
                value: *value,
                ty,
            }),
            None => env.push(EnvField { source, ty: Some(ty) }),
        }
    }

    fn into_owner(self, captures: Vec<LocalId>, counter: &mut SiteCounter) -> OwnerEir {
        let live = self.graph.live_after_sites(self.sites.len());
        let mut sites = Vec::with_capacity(self.sites.len());
        for (order, (draft, live)) in self.sites.iter().zip(live).enumerate() {
            let mut env = Vec::new();
            let mut rematerialized = Vec::new();
            if live.contains(&Var::Handlers) {
                env.push(EnvField {
                    source: EnvSource::Handler,
                    ty: None,
                });
            }
            for param in &self.f.params {
                if live.contains(&Var::Local(*param)) {
                    self.local_field(*param, &mut env, &mut rematerialized);
                }
            }
            for var in &live {
                if let Var::Local(local) = var {
                    if !self.f.params.contains(local) {
                        self.local_field(*local, &mut env, &mut rematerialized);
                    }
                }
            }
            for pending in &draft.pending {
                let target = EnvSource::Temporary(pending.expr);
                match pending.literal {
                    Some(value) => rematerialized.push(Rematerialized {
                        target,
                        value,
                        ty: pending.ty.clone(),
                    }),
                    None => env.push(EnvField {
                        source: target,
                        ty: Some(pending.ty.clone()),
                    }),
                }
            }
            let id = counter.next_id();
            tracing::trace!(site = %id, owner = ?self.owner, fields = env.len(), "continuation site");
            sites.push(ContinuationSite {
                id,
                order: order as u32,
                expr: draft.expr,
                owner: self.owner,
                kind: draft.kind.clone(),
                result_ty: draft.result_ty.clone(),
                env,
                rematerialized,
                direct_handler: draft.direct_handler,
                span: draft.span,
            });
        }
        OwnerEir {
            owner: self.owner,
            captures,
            sites,
            temporaries: self.temporaries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::analyze_program;
    use crate::hir::{op, BodyBuilder, ProgramBuilder};

    struct Fixture {
        program: Program,
        target: DefId,
    }

    fn build(fixture: &Fixture) -> Result<FunctionEir, Vec<Diagnostic>> {
        let table = EffectTable::build(&fixture.program);
        let effects = analyze_program(&fixture.program, &table)?;
        let mut counter = SiteCounter::new();
        build_effect_lowering_eir(&fixture.program, &effects, &table, fixture.target, &[], &mut counter)
    }

    /// `fn inner(x) { let a = await(x); let b = await(a); a + b }`
    fn sequential() -> Fixture {
        let mut pb = ProgramBuilder::new("app");
        let async_ = pb.effect("Async", vec![op("await", vec![Type::I32], Type::I32)]);
        let inner = pb.fresh_def();
        let b = BodyBuilder::new();
        let x = b.param("x", Type::I32);
        let a = b.constant("a", Type::I32);
        let bb = b.constant("b", Type::I32);
        let body = b.block(
            vec![
                b.let_(a, b.perform(async_, 0, Type::I32, vec![b.var(x)])),
                b.let_(bb, b.perform(async_, 0, Type::I32, vec![b.var(a)])),
            ],
            Some(b.add(b.var(a), b.var(bb))),
        );
        pb.function(b.finish(inner, "inner", Type::I32, body));
        Fixture {
            program: pb.finish(),
            target: inner,
        }
    }

    #[test]
    fn test_environments_are_live_after_sets() {
        let eir = build(&sequential()).unwrap();
        let owner = &eir.owners[0];
        assert_eq!(owner.sites.len(), 2);
        let first: Vec<EnvSource> = owner.sites[0].env.iter().map(|f| f.source).collect();
        assert_eq!(first, vec![EnvSource::Handler]);
        let second: Vec<EnvSource> = owner.sites[1].env.iter().map(|f| f.source).collect();
        assert_eq!(second, vec![EnvSource::Local(LocalId::new(1))]);
    }

    #[test]
    fn test_site_ids_are_deterministic() {
        let fixture = sequential();
        let a = build(&fixture).unwrap();
        let b = build(&fixture).unwrap();
        let ids = |e: &FunctionEir| e.sites().map(|s| (s.id, s.order, s.env.clone())).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_pending_operand_is_temporary() {
        let mut pb = ProgramBuilder::new("app");
        let async_ = pb.effect("Async", vec![op("await", vec![Type::I32], Type::I32)]);
        let helper = pb.fresh_def();
        let main = pb.fresh_def();

        let b = BodyBuilder::new();
        let body = b.perform(async_, 0, Type::I32, vec![b.int(1)]);
        pb.function(b.finish(helper, "helper", Type::I32, body));

        let b = BodyBuilder::new();
        let lhs = b.call(helper, Type::I32, vec![]);
        let lhs_id = lhs.id;
        let body = b.add(lhs, b.perform(async_, 0, Type::I32, vec![b.int(6)]));
        pb.function(b.finish(main, "main", Type::I32, body));

        let eir = build(&Fixture {
            program: pb.finish(),
            target: main,
        })
        .unwrap();
        let sites = &eir.owners[0].sites;
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].env[0].source, EnvSource::Handler);
        assert_eq!(sites[1].env.len(), 1);
        assert_eq!(sites[1].env[0].source, EnvSource::Temporary(lhs_id));
    }

    #[test]
    fn test_literal_locals_are_rematerialized() {
        let mut pb = ProgramBuilder::new("app");
        let async_ = pb.effect("Async", vec![op("await", vec![Type::I32], Type::I32)]);
        let f = pb.fresh_def();
        let b = BodyBuilder::new();
        let n = b.constant("n", Type::I32);
        let a = b.constant("a", Type::I32);
        let body = b.block(
            vec![
                b.let_(n, b.int(5)),
                b.let_(a, b.perform(async_, 0, Type::I32, vec![b.int(1)])),
            ],
            Some(b.add(b.var(a), b.var(n))),
        );
        pb.function(b.finish(f, "f", Type::I32, body));
        let eir = build(&Fixture {
            program: pb.finish(),
            target: f,
        })
        .unwrap();
        let site = &eir.owners[0].sites[0];
        assert!(site.env.is_empty());
        assert_eq!(site.rematerialized.len(), 1);
        assert_eq!(site.rematerialized[0].value, Literal::Int(5));
    }

    #[test]
    fn test_loop_counter_is_captured() {
        let mut pb = ProgramBuilder::new("app");
        let tick = pb.effect("Tick", vec![op("tick", vec![Type::I32], Type::Unit)]);
        let f = pb.fresh_def();
        let b = BodyBuilder::new();
        let i = b.local("i", Type::I32);
        let body = b.block(
            vec![
                b.let_(i, b.int(0)),
                b.stmt(b.while_loop(
                    b.lt(b.var(i), b.int(3)),
                    b.block(
                        vec![
                            b.stmt(b.perform(tick, 0, Type::Unit, vec![b.var(i)])),
                            b.stmt(b.assign(i, b.add(b.var(i), b.int(1)))),
                        ],
                        None,
                    ),
                )),
            ],
            None,
        );
        pb.function(b.finish(f, "f", Type::Unit, body));
        let eir = build(&Fixture {
            program: pb.finish(),
            target: f,
        })
        .unwrap();
        let env: Vec<EnvSource> = eir.owners[0].sites[0].env.iter().map(|f| f.source).collect();
        assert_eq!(env, vec![EnvSource::Handler, EnvSource::Local(i)]);
    }

    #[test]
    fn test_handle_creates_lambda_owners() {
        let mut pb = ProgramBuilder::new("app");
        let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
        let f = pb.fresh_def();
        let b = BodyBuilder::new();
        let x = b.param("x", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let handled = b.add(b.perform(ask, 0, Type::I32, vec![]), b.var(x));
        let body = b.handle(
            handled,
            ask,
            vec![],
            vec![b.clause(0, vec![], k, b.resume(k, b.var(x)))],
        );
        let handle_id = body.id;
        pb.function(b.finish(f, "f", Type::I32, body));
        let eir = build(&Fixture {
            program: pb.finish(),
            target: f,
        })
        .unwrap();
        assert!(!eir.effectful);
        assert_eq!(eir.owners.len(), 3);
        let body_owner = eir.owner(SiteOwner::HandleBody(handle_id)).unwrap();
        assert_eq!(body_owner.captures, vec![x]);
        assert!(body_owner.sites[0].direct_handler);
        assert_eq!(eir.clause_captures(handle_id), vec![x]);
    }

    #[test]
    fn test_local_assigned_in_handled_body_becomes_cell() {
        let mut pb = ProgramBuilder::new("app");
        let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
        let f = pb.fresh_def();
        let b = BodyBuilder::new();
        let total = b.local("total", Type::I32);
        let seen = b.local("seen", Type::I32);
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let handled = b.block(
            vec![b.stmt(b.assign(total, b.add(b.perform(ask, 0, Type::I32, vec![]), b.var(total))))],
            Some(b.var(total)),
        );
        let handle = b.handle(handled, ask, vec![], vec![b.clause(0, vec![], k, b.resume(k, b.int(1)))]);
        let handle_id = handle.id;
        let body = b.block(
            vec![
                b.let_(total, b.int(0)),
                b.let_(seen, b.int(0)),
                b.stmt(handle),
                b.stmt(b.assign(seen, b.var(total))),
            ],
            Some(b.var(seen)),
        );
        pb.function(b.finish(f, "f", Type::I32, body));
        let eir = build(&Fixture {
            program: pb.finish(),
            target: f,
        })
        .unwrap();

        assert!(eir.is_cell(total));
        assert!(!eir.is_cell(seen));
        let body_owner = eir.owner(SiteOwner::HandleBody(handle_id)).unwrap();
        assert_eq!(body_owner.captures, vec![total]);
        let env: Vec<EnvSource> = body_owner.sites[0].env.iter().map(|f| f.source).collect();
        assert_eq!(env, vec![EnvSource::Local(total)]);
        // The cell is shared, never rematerialized from its literal.
        assert!(eir.sites().all(|s| s.rematerialized.is_empty()));
    }

    #[test]
    fn test_return_in_clause_keeps_its_continuation_live() {
        let mut pb = ProgramBuilder::new("app");
        let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
        let log = pb.effect("Log", vec![op("log", vec![Type::I32], Type::Unit)]);
        let f = pb.fresh_def();
        let b = BodyBuilder::new();
        let k = b.constant("k", Type::cont(Type::I32, Type::I32));
        let clause_body = b.block(
            vec![
                b.stmt(b.perform(log, 0, Type::Unit, vec![b.int(1)])),
                b.stmt(b.ret(b.int(1))),
            ],
            Some(b.int(2)),
        );
        let handle = b.handle(
            b.perform(ask, 0, Type::I32, vec![]),
            ask,
            vec![],
            vec![b.clause(0, vec![], k, clause_body)],
        );
        let handle_id = handle.id;
        pb.function(b.finish(f, "f", Type::I32, handle));
        let eir = build(&Fixture {
            program: pb.finish(),
            target: f,
        })
        .unwrap();

        let clause = eir.owner(SiteOwner::Clause { handle: handle_id, op: 0 }).unwrap();
        let env: Vec<EnvSource> = clause.sites[0].env.iter().map(|f| f.source).collect();
        assert_eq!(env, vec![EnvSource::Local(k)]);
    }
}
