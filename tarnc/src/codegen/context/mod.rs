//! Code generation context.
//!
//! [`CodegenContext`] owns everything one compilation session shares: the
//! module under construction, the support-type layout, memoized function
//! instances, effect instances with their dense operation indices, and the
//! cache of runtime support functions. Nothing in it is global; two
//! compilations never observe each other.
//!
//! [`OwnerCodegen`] compiles one owner (a function, a handled body or a
//! handler clause) of one function instance. The body is compiled once;
//! every entry point (the regular one and one per continuation site) is a
//! copy of it with its own prologue patched into instruction 0.

mod boundary;
mod dispatch;
mod effects;
mod expr;
mod handlers;
mod types;

#[cfg(test)]
mod tests;

pub use dispatch::SupportSymbol;
pub use types::{emit_literal, from_uniform, host_val_type, to_uniform, SupportLayout};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use crate::config::CompileOptions;
use crate::diagnostics::Diagnostic;
use crate::effects::{signature_hash, EffectId, EffectRef, EffectTable, EffectsIr, OpId, SignatureHash};
use crate::eir::{build_effect_lowering_eir, instance_name, FunctionEir, OwnerEir, SiteCounter, SiteOwner};
use crate::hir::{DefId, Expr, ExprId, ExprKind, FnDecl, Handler, LocalId, Program, ResumeKind, Type};
use crate::protocol::{ProtocolExport, ProtocolOp, ProtocolTable, PROTOCOL_SECTION};
use crate::span::Span;
use crate::target::{
    FuncIdx, FunctionBuilder, GlobalIdx, GlobalInit, ImportIdx, Instr, Label, Module, ModuleBuilder, Reg,
    TypeIdx, ValType,
};

use super::runtime::{imports, memory};

/// Turn a lower-level failure into an internal compiler error.
pub(crate) fn ice(err: impl fmt::Display) -> Diagnostic {
    Diagnostic::ice(err.to_string(), Span::dummy())
}

/// One operation of an effect instance.
#[derive(Debug, Clone)]
pub struct OpInstance {
    /// Dense index used by the dispatcher.
    pub op_index: u32,
    pub op_id: OpId,
    pub name: String,
    /// e.g. `State<i32>.get`
    pub label: String,
    pub resume_kind: ResumeKind,
    pub params: Vec<Type>,
    pub ret: Type,
    /// `{label}$args`, absent for operations without parameters.
    pub args_ty: Option<TypeIdx>,
    pub hash: SignatureHash,
    /// Location of the label in linear memory.
    pub label_str: (u32, u32),
    /// Whether the operation may be handed to the host.
    pub host: bool,
}

/// An effect declaration applied to concrete type arguments.
#[derive(Debug, Clone)]
pub struct EffectInstance {
    pub effect: EffectRef,
    pub name: String,
    pub effect_id: EffectId,
    pub index: u32,
    pub first_op: u32,
    pub ops: Vec<OpInstance>,
    pub id_str: (u32, u32),
}

/// Strings placed in linear memory after the argument scratch area.
#[derive(Debug)]
struct StringPool {
    base: u32,
    bytes: Vec<u8>,
    interned: HashMap<String, (u32, u32)>,
}

impl StringPool {
    fn new(base: u32) -> Self {
        Self {
            base,
            bytes: Vec::new(),
            interned: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> (u32, u32) {
        if let Some(loc) = self.interned.get(s) {
            return *loc;
        }
        let loc = (self.base + self.bytes.len() as u32, s.len() as u32);
        self.bytes.extend_from_slice(s.as_bytes());
        self.interned.insert(s.to_string(), loc);
        loc
    }

    fn end(&self) -> u32 {
        self.base + self.bytes.len() as u32
    }
}

/// Imports every module declares.
#[derive(Debug, Clone, Copy)]
pub struct HostImports {
    pub write_value: ImportIdx,
    pub write_effect: ImportIdx,
    pub read_value: ImportIdx,
}

/// Per-compilation code generation state.
pub struct CodegenContext<'a> {
    pub(crate) program: &'a Program,
    pub(crate) table: &'a EffectTable,
    pub(crate) effects: &'a EffectsIr,
    pub(crate) options: &'a CompileOptions,
    pub(crate) module: ModuleBuilder,
    pub(crate) layout: SupportLayout,
    pub(crate) imports: HostImports,
    /// Set by `init_effects`.
    pub(crate) ready: GlobalIdx,
    /// Address of the operation label table.
    pub(crate) op_table: GlobalIdx,
    sites: SiteCounter,
    instances: BTreeMap<(DefId, Vec<Type>), FuncIdx>,
    worklist: VecDeque<(DefId, Vec<Type>, FuncIdx)>,
    struct_types: HashMap<Type, TypeIdx>,
    cell_types: HashMap<ValType, TypeIdx>,
    pub(crate) effect_instances: Vec<EffectInstance>,
    effect_index: BTreeMap<EffectRef, usize>,
    next_op: u32,
    support: HashMap<SupportSymbol, FuncIdx>,
    support_pending: Vec<(SupportSymbol, FuncIdx)>,
    strings: StringPool,
    pub(crate) protocol_exports: Vec<ProtocolExport>,
}

impl<'a> CodegenContext<'a> {
    pub fn new(
        program: &'a Program,
        table: &'a EffectTable,
        effects: &'a EffectsIr,
        options: &'a CompileOptions,
    ) -> Self {
        use ValType::{I32, I64};
        let mut module = ModuleBuilder::new();
        let layout = SupportLayout::declare(&mut module);
        let imports = HostImports {
            write_value: module.import(imports::MODULE, imports::WRITE_VALUE, vec![I32, I64, I32, I32], vec![I32]),
            write_effect: module.import(
                imports::MODULE,
                imports::WRITE_EFFECT,
                vec![I32, I32, I32, I32, I64, I32, I32],
                vec![I32],
            ),
            read_value: module.import(imports::MODULE, imports::READ_VALUE, vec![I32, I32], vec![I64]),
        };
        let ready = module.add_global("effects_ready", I32, GlobalInit::I32(0));
        let op_table = module.add_global("op_table", I32, GlobalInit::I32(0));
        let strings = StringPool::new(memory::SCRATCH_BASE + memory::WORD * options.host_arg_words);
        Self {
            program,
            table,
            effects,
            options,
            module,
            layout,
            imports,
            ready,
            op_table,
            sites: SiteCounter::new(),
            instances: BTreeMap::new(),
            worklist: VecDeque::new(),
            struct_types: HashMap::new(),
            cell_types: HashMap::new(),
            effect_instances: Vec::new(),
            effect_index: BTreeMap::new(),
            next_op: 0,
            support: HashMap::new(),
            support_pending: Vec::new(),
            strings,
            protocol_exports: Vec::new(),
        }
    }

    /// The function compiled for `def_id` at `type_args`, queued for
    /// compilation on first request.
    pub fn instance(&mut self, def_id: DefId, type_args: Vec<Type>) -> FuncIdx {
        if let Some(idx) = self.instances.get(&(def_id, type_args.clone())) {
            return *idx;
        }
        let name = instance_name(self.program, def_id, &type_args);
        let idx = self.module.reserve_function(name.clone());
        tracing::trace!(function = %name, index = idx, "requested instance");
        self.instances.insert((def_id, type_args.clone()), idx);
        self.worklist.push_back((def_id, type_args, idx));
        idx
    }

    /// Number of continuation sites created so far.
    pub fn sites_issued(&self) -> u32 {
        self.sites.issued()
    }

    /// Intern an effect instance, assigning dense indices to its operations.
    pub fn effect_instance(&mut self, effect: &EffectRef) -> Result<usize, Diagnostic> {
        if let Some(index) = self.effect_index.get(effect) {
            return Ok(*index);
        }
        let table = self.table;
        let program = self.program;
        let entry = table
            .effect(effect.effect)
            .ok_or_else(|| Diagnostic::ice(format!("no effect table entry for {}", effect.effect), Span::dummy()))?;
        let name = program.effect_name(effect.effect, &effect.type_args);
        let first_op = self.next_op;
        let mut ops = Vec::with_capacity(entry.ops.len());
        for operation in &entry.ops {
            let params: Vec<Type> = operation.params.iter().map(|t| t.substitute(&effect.type_args)).collect();
            let ret = operation.ret.substitute(&effect.type_args);
            let label = format!("{}.{}", name, operation.name);
            let args_ty = if params.is_empty() {
                None
            } else {
                let mut fields = Vec::with_capacity(params.len());
                for p in &params {
                    fields.push(self.val_type(p)?);
                }
                Some(self.module.add_struct(format!("{}$args", label), fields))
            };
            ops.push(OpInstance {
                op_index: first_op + operation.op_id.0,
                op_id: operation.op_id,
                name: operation.name.clone(),
                label_str: self.strings.intern(&label),
                label,
                resume_kind: operation.resume_kind,
                hash: signature_hash(program, &params, &ret),
                params,
                ret,
                args_ty,
                host: false,
            });
        }
        self.next_op += ops.len() as u32;
        let index = self.effect_instances.len();
        tracing::debug!(effect = %name, first_op, ops = ops.len(), "effect instance");
        self.effect_instances.push(EffectInstance {
            effect: effect.clone(),
            name,
            effect_id: entry.effect_id.clone(),
            index: index as u32,
            first_op,
            ops,
            id_str: self.strings.intern(entry.effect_id.as_str()),
        });
        self.effect_index.insert(effect.clone(), index);
        Ok(index)
    }

    /// Every operation instance in dense index order.
    pub fn op_instances(&self) -> impl Iterator<Item = (&EffectInstance, &OpInstance)> {
        self.effect_instances
            .iter()
            .flat_map(|e| e.ops.iter().map(move |op| (e, op)))
    }

    /// Drain the instance worklist and pending support bodies, lay out
    /// memory and produce the module with its protocol table.
    pub fn finish(mut self) -> Result<(Module, ProtocolTable), Vec<Diagnostic>> {
        loop {
            if let Some((def_id, type_args, idx)) = self.worklist.pop_front() {
                self.compile_instance(def_id, &type_args, idx)?;
                continue;
            }
            if let Some((symbol, idx)) = self.support_pending.pop() {
                self.emit_support(symbol, idx).map_err(|d| vec![d])?;
                continue;
            }
            break;
        }

        let table_base = align8(self.strings.end());
        let mut words = Vec::new();
        for (_, op) in self.op_instances() {
            let (ptr, len) = op.label_str;
            let word = ptr as u64 | (len as u64) << 32;
            words.extend_from_slice(&word.to_le_bytes());
        }
        let end = table_base + words.len() as u32;
        self.module.set_global_init(self.op_table, GlobalInit::I32(table_base as i32));
        if !self.strings.bytes.is_empty() {
            let base = self.strings.base;
            self.module.data(base, std::mem::take(&mut self.strings.bytes));
        }
        if !words.is_empty() {
            self.module.data(table_base, words);
        }
        self.module.set_memory_size(end.div_ceil(memory::PAGE).max(1) * memory::PAGE);

        let protocol = self.protocol_table();
        if self.options.embed_protocol {
            let json = protocol.to_json().map_err(|e| vec![ice(e)])?;
            self.module.custom(PROTOCOL_SECTION, json);
        }
        let module = self.module.finish().map_err(|e| vec![ice(e)])?;
        tracing::debug!(
            functions = module.functions.len(),
            types = module.types.len(),
            ops = protocol.ops.len(),
            "module finished"
        );
        Ok((module, protocol))
    }

    fn protocol_table(&self) -> ProtocolTable {
        let mut table = ProtocolTable::new();
        for (effect, op) in self.op_instances() {
            table.ops.push(ProtocolOp {
                op_index: op.op_index,
                effect_id: effect.effect_id.clone(),
                op_id: op.op_id,
                op_name: op.name.clone(),
                resume_kind: op.resume_kind,
                signature_hash: op.hash,
                label: Some(op.label.clone()),
                params: op.params.iter().map(|t| self.payload_kind(t)).collect(),
                result: self.payload_kind(&op.ret),
            });
        }
        table.exports = self.protocol_exports.clone();
        table
    }

    /// `$Cell<val>`: the one-field box of a local shared with a lambda.
    pub(crate) fn cell_type(&mut self, val: ValType) -> TypeIdx {
        if let Some(idx) = self.cell_types.get(&val) {
            return *idx;
        }
        let idx = self.module.add_struct(format!("$Cell<{:?}>", val), vec![val]);
        self.cell_types.insert(val, idx);
        idx
    }

    fn local_val_type(&mut self, f: &FnDecl, local: LocalId, type_args: &[Type]) -> Result<ValType, Diagnostic> {
        let ty = f
            .local(local)
            .map(|l| l.ty.substitute(type_args))
            .ok_or_else(|| Diagnostic::ice(format!("`{}` has no local {}", f.name, local), f.span))?;
        self.val_type(&ty)
    }

    /// Register type of a local once bound: a cell reference for cells.
    fn stored_val_type(&mut self, eir: &FunctionEir, f: &FnDecl, local: LocalId) -> Result<ValType, Diagnostic> {
        if eir.is_cell(local) {
            return Ok(ValType::AnyRef);
        }
        self.local_val_type(f, local, &eir.type_args)
    }

    fn compile_instance(&mut self, def_id: DefId, type_args: &[Type], main: FuncIdx) -> Result<(), Vec<Diagnostic>> {
        let program = self.program;
        let eir = build_effect_lowering_eir(program, self.effects, self.table, def_id, type_args, &mut self.sites)?;
        let f = program
            .function(def_id)
            .ok_or_else(|| vec![Diagnostic::ice(format!("no body for {}", def_id), Span::dummy())])?;

        let mut funcs = BTreeMap::new();
        funcs.insert(SiteOwner::Function, main);
        for owner in &eir.owners {
            let name = match owner.owner {
                SiteOwner::Function => continue,
                SiteOwner::HandleBody(h) => format!("{}$handle{}", eir.name, h.index),
                SiteOwner::Clause { handle, op } => format!("{}$handle{}$op{}", eir.name, handle.index, op),
            };
            funcs.insert(owner.owner, self.module.reserve_function(name));
        }

        let mut handles = Vec::new();
        f.body.walk(&mut |e| {
            if let ExprKind::Handle { .. } = e.kind {
                handles.push(e.id);
            }
        });
        let mut clause_envs = BTreeMap::new();
        for handle in handles {
            let mut fields = vec![ValType::AnyRef];
            for local in eir.clause_captures(handle) {
                fields.push(self.stored_val_type(&eir, f, local).map_err(|d| vec![d])?);
            }
            let ty = self
                .module
                .add_struct(format!("{}$handle{}$env", eir.name, handle.index), fields);
            clause_envs.insert(handle, ty);
        }

        let inst = InstanceCode {
            eir: &eir,
            f,
            funcs,
            clause_envs,
        };
        for owner in &eir.owners {
            let (params, results) = self.owner_signature(&inst, owner).map_err(|d| vec![d])?;
            let base = params.len().max(3) as u32;
            OwnerCodegen::new(self, &inst, owner, base)
                .compile(params, results)
                .map_err(|d| vec![d])?;
        }
        tracing::debug!(function = %eir.name, owners = eir.owners.len(), sites = eir.site_count(), "compiled instance");
        Ok(())
    }

    fn owner_signature(
        &mut self,
        inst: &InstanceCode<'_>,
        owner: &OwnerEir,
    ) -> Result<(Vec<ValType>, Vec<ValType>), Diagnostic> {
        let type_args = &inst.eir.type_args;
        match owner.owner {
            SiteOwner::Function => {
                let mut params = Vec::new();
                if inst.eir.effectful {
                    params.push(ValType::AnyRef);
                }
                for p in &inst.f.params {
                    params.push(self.local_val_type(inst.f, *p, type_args)?);
                }
                let result = if inst.eir.effectful {
                    ValType::AnyRef
                } else {
                    self.val_type(&inst.f.ret.substitute(type_args))?
                };
                Ok((params, vec![result]))
            }
            SiteOwner::HandleBody(_) => {
                let mut params = vec![ValType::AnyRef];
                for c in &owner.captures {
                    params.push(self.stored_val_type(inst.eir, inst.f, *c)?);
                }
                Ok((params, vec![ValType::AnyRef]))
            }
            SiteOwner::Clause { .. } => Ok((vec![ValType::AnyRef; 3], vec![ValType::AnyRef])),
        }
    }
}

fn align8(n: u32) -> u32 {
    (n + 7) & !7
}

/// Shared data of the owners of one function instance.
pub(crate) struct InstanceCode<'i> {
    eir: &'i FunctionEir,
    f: &'i FnDecl,
    funcs: BTreeMap<SiteOwner, FuncIdx>,
    clause_envs: BTreeMap<ExprId, TypeIdx>,
}

/// Registers and labels of one continuation site.
#[derive(Debug, Clone)]
struct SiteSlot {
    /// Index into the owner's site list.
    site: usize,
    func: FuncIdx,
    env_ty: TypeIdx,
    /// The `$EffectResult` checked after the site.
    result: Reg,
    /// The handler frame a handle or continuation-call site tracks.
    frame: Option<Reg>,
    /// The site's typed value once it completed.
    value: Reg,
    check: Label,
}

/// Compiles one owner of a function instance.
pub(crate) struct OwnerCodegen<'c, 'a> {
    cx: &'c mut CodegenContext<'a>,
    inst: &'c InstanceCode<'c>,
    owner: &'c OwnerEir,
    fb: FunctionBuilder,
    /// The handler-stack reference of the owner.
    hs: Reg,
    locals: HashMap<LocalId, Reg>,
    exprs: HashMap<ExprId, Reg>,
    slots: Vec<SiteSlot>,
    body_start: u32,
}

impl<'c, 'a> OwnerCodegen<'c, 'a> {
    fn new(cx: &'c mut CodegenContext<'a>, inst: &'c InstanceCode<'c>, owner: &'c OwnerEir, base: u32) -> Self {
        let mut fb = FunctionBuilder::new(base);
        let hs = fb.reg(ValType::AnyRef);
        Self {
            cx,
            inst,
            owner,
            fb,
            hs,
            locals: HashMap::new(),
            exprs: HashMap::new(),
            slots: Vec::new(),
            body_start: 0,
        }
    }

    fn compile(mut self, params: Vec<ValType>, results: Vec<ValType>) -> Result<(), Diagnostic> {
        let ty = self.cx.module.func_type(params.clone(), results);
        self.fb.emit(Instr::Jump { target: 0 });
        self.body_start = self.fb.here();
        let root = self.root()?;
        let value = self.expr(root)?;
        let ret = self.concrete(&root.ty);
        self.exit(value, &ret)?;

        let body = self.fb.clone();
        let locals = self.locals.clone();

        self.main_entry()?;
        let main = self.func_of(self.owner.owner)?;
        let name = self.cx.module.function_name(main).unwrap_or_default().to_string();
        let fb = std::mem::replace(&mut self.fb, body.clone());
        let function = fb.finish(name, ty, &params).map_err(ice)?;
        self.cx.module.define_function(main, function).map_err(ice)?;

        let cont_ty = self.cx.layout.cont_fn;
        let cont_params = [ValType::AnyRef, ValType::I64, ValType::AnyRef];
        for index in 0..self.slots.len() {
            self.fb = body.clone();
            self.locals = locals.clone();
            self.continuation_entry(index)?;
            let func = self.slots[index].func;
            let name = self.cx.module.function_name(func).unwrap_or_default().to_string();
            let fb = std::mem::replace(&mut self.fb, FunctionBuilder::new(0));
            let function = fb.finish(name, cont_ty, &cont_params).map_err(ice)?;
            self.cx.module.define_function(func, function).map_err(ice)?;
        }
        Ok(())
    }

    fn func_of(&self, owner: SiteOwner) -> Result<FuncIdx, Diagnostic> {
        self.inst
            .funcs
            .get(&owner)
            .copied()
            .ok_or_else(|| Diagnostic::ice(format!("no function reserved for {:?}", owner), self.inst.f.span))
    }

    /// Whether the owner returns an `$EffectResult`.
    fn returns_result(&self) -> bool {
        self.owner.owner.is_lambda() || self.inst.eir.effectful
    }

    fn concrete(&self, ty: &Type) -> Type {
        ty.substitute(&self.inst.eir.type_args)
    }

    fn local_type(&self, local: LocalId) -> Result<Type, Diagnostic> {
        self.inst
            .f
            .local(local)
            .map(|l| self.concrete(&l.ty))
            .ok_or_else(|| Diagnostic::ice(format!("`{}` has no local {}", self.inst.f.name, local), self.inst.f.span))
    }

    /// The register a local is bound in. For a cell it holds the cell.
    fn local_reg(&mut self, local: LocalId) -> Result<Reg, Diagnostic> {
        if let Some(reg) = self.locals.get(&local) {
            return Ok(*reg);
        }
        let val = if self.inst.eir.is_cell(local) {
            ValType::AnyRef
        } else {
            let ty = self.local_type(local)?;
            self.cx.val_type(&ty)?
        };
        let reg = self.fb.reg(val);
        self.locals.insert(local, reg);
        Ok(reg)
    }

    fn cell_of(&mut self, local: LocalId) -> Result<Option<TypeIdx>, Diagnostic> {
        if !self.inst.eir.is_cell(local) {
            return Ok(None);
        }
        let ty = self.local_type(local)?;
        let val = self.cx.val_type(&ty)?;
        Ok(Some(self.cx.cell_type(val)))
    }

    /// The current value of `local` in a fresh register.
    fn read_local(&mut self, local: LocalId) -> Result<Reg, Diagnostic> {
        let src = self.local_reg(local)?;
        let ty = self.local_type(local)?;
        let val = self.cx.val_type(&ty)?;
        if let Some(cell) = self.cell_of(local)? {
            let typed = self.fb.cast(src, cell);
            return Ok(self.fb.get(typed, cell, 0, val));
        }
        let dst = self.fb.reg(val);
        self.fb.emit(Instr::Move { dst, src });
        Ok(dst)
    }

    /// Introduce a new binding of `local` holding `src`.
    fn bind_local(&mut self, local: LocalId, src: Reg) -> Result<(), Diagnostic> {
        let dst = self.local_reg(local)?;
        let src = match self.cell_of(local)? {
            Some(cell) => self.fb.new_struct(cell, vec![src]),
            None => src,
        };
        self.fb.emit(Instr::Move { dst, src });
        Ok(())
    }

    /// Overwrite the current binding of `local`.
    fn assign_local(&mut self, local: LocalId, src: Reg) -> Result<(), Diagnostic> {
        let dst = self.local_reg(local)?;
        match self.cell_of(local)? {
            Some(cell) => {
                let typed = self.fb.cast(dst, cell);
                self.fb.emit(Instr::StructSet {
                    obj: typed,
                    ty: cell,
                    field: 0,
                    src,
                });
            }
            None => self.fb.emit(Instr::Move { dst, src }),
        }
        Ok(())
    }

    /// The `handle` expression `id` of this instance.
    fn handle_parts(&self, id: ExprId) -> Result<(&'c Expr, &'c Handler), Diagnostic> {
        let f: &'c FnDecl = self.inst.f;
        match f.body.find(id).map(|e| &e.kind) {
            Some(ExprKind::Handle { body, handler }) => Ok((&**body, handler)),
            _ => Err(Diagnostic::ice(format!("{} is not a handle expression", id), f.span)),
        }
    }

    fn root(&self) -> Result<&'c Expr, Diagnostic> {
        match self.owner.owner {
            SiteOwner::Function => Ok(&self.inst.f.body),
            SiteOwner::HandleBody(h) => Ok(self.handle_parts(h)?.0),
            SiteOwner::Clause { handle, op } => {
                let (_, handler) = self.handle_parts(handle)?;
                handler
                    .clause(op)
                    .map(|c| &c.body)
                    .ok_or_else(|| Diagnostic::ice(format!("handler has no clause #{}", op), self.inst.f.span))
            }
        }
    }

    /// The continuation of a `tail` operation's clause.
    fn tail_cont(&self) -> Result<Option<LocalId>, Diagnostic> {
        let SiteOwner::Clause { handle, op } = self.owner.owner else {
            return Ok(None);
        };
        let (_, handler) = self.handle_parts(handle)?;
        let kind = self
            .cx
            .table
            .operation(handler.effect, op)
            .map(|o| o.resume_kind)
            .unwrap_or_default();
        Ok(match kind {
            ResumeKind::Tail => handler.clause(op).map(|c| c.cont),
            ResumeKind::Resume => None,
        })
    }

    /// Leave the owner with `value` of type `ty`.
    fn exit(&mut self, value: Reg, ty: &Type) -> Result<(), Diagnostic> {
        if !self.returns_result() {
            self.fb.ret(value);
            return Ok(());
        }
        if let Some(k) = self.tail_cont()? {
            let k = self.read_local(k)?;
            let finalize = self.cx.support(SupportSymbol::TailFinalize);
            self.fb.emit(Instr::Call {
                dst: None,
                func: finalize,
                args: vec![k],
            });
        }
        let (word, reference) = to_uniform(&mut self.fb, value, ty);
        let make_done = self.cx.support(SupportSymbol::MakeDone);
        let done = self.fb.call(make_done, vec![word, reference], ValType::AnyRef);
        self.fb.ret(done);
        Ok(())
    }

    /// Regular entry: move parameters into their registers.
    fn main_entry(&mut self) -> Result<(), Diagnostic> {
        let entry = self.fb.here();
        self.fb.patch(0, Instr::Jump { target: entry });
        let inst = self.inst;
        let owner = self.owner;
        match owner.owner {
            SiteOwner::Function => {
                let offset = if inst.eir.effectful {
                    self.fb.emit(Instr::Move { dst: self.hs, src: 0 });
                    1
                } else {
                    self.fb.emit(Instr::RefNull { dst: self.hs });
                    0
                };
                for (i, p) in inst.f.params.iter().enumerate() {
                    self.bind_local(*p, offset + i as u32)?;
                }
            }
            SiteOwner::HandleBody(_) => {
                self.fb.emit(Instr::Move { dst: self.hs, src: 0 });
                for (i, c) in owner.captures.iter().enumerate() {
                    let dst = self.local_reg(*c)?;
                    self.fb.emit(Instr::Move { dst, src: 1 + i as u32 });
                }
            }
            SiteOwner::Clause { handle, op } => self.clause_prologue(handle, op)?,
        }
        self.fb.emit(Instr::Jump { target: self.body_start });
        Ok(())
    }
}
