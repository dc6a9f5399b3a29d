//! HIR items and the program root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::effects::EffectRow;
use crate::span::Span;

use super::{DefId, Expr, LocalId, Type};

/// How an operation's continuation may be used by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeKind {
    /// The continuation may be invoked any number of times.
    #[default]
    Resume,
    /// The continuation must be invoked exactly once, in tail position.
    Tail,
}

impl ResumeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeKind::Resume => "resume",
            ResumeKind::Tail => "tail",
        }
    }
}

/// A local variable slot.
#[derive(Debug, Clone)]
pub struct LocalDecl {
    pub id: LocalId,
    pub name: String,
    pub ty: Type,
    pub mutable: bool,
}

/// A function declaration with its body.
#[derive(Debug, Clone)]
pub struct FnDecl {
    pub def_id: DefId,
    pub name: String,
    /// Number of generic type parameters.
    pub generics: u32,
    pub params: Vec<LocalId>,
    pub ret: Type,
    /// The effect row written in the signature, if any. Functions without a
    /// declared row get an inferred one.
    pub declared_effects: Option<EffectRow>,
    /// Every local of the function, including those of nested handled
    /// bodies and handler clauses, indexed by `LocalId`.
    pub locals: Vec<LocalDecl>,
    pub body: Expr,
    /// Name under which the function is exported to the host.
    pub export: Option<String>,
    pub span: Span,
}

impl FnDecl {
    pub fn local(&self, id: LocalId) -> Option<&LocalDecl> {
        self.locals.get(id.index as usize).filter(|l| l.id == id)
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.params
            .iter()
            .filter_map(|p| self.local(*p).map(|l| l.ty.clone()))
            .collect()
    }

    /// Mark the function as exported under `name`.
    pub fn exported(mut self, name: impl Into<String>) -> Self {
        self.export = Some(name.into());
        self
    }

    /// Attach a declared effect row.
    pub fn with_effects(mut self, row: EffectRow) -> Self {
        self.declared_effects = Some(row);
        self
    }

    /// Declare `count` generic type parameters.
    pub fn with_generics(mut self, count: u32) -> Self {
        self.generics = count;
        self
    }
}

/// One operation of an effect.
#[derive(Debug, Clone)]
pub struct OpDecl {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    pub resume_kind: ResumeKind,
    pub span: Span,
}

/// An effect declaration.
#[derive(Debug, Clone)]
pub struct EffectDecl {
    pub def_id: DefId,
    pub name: String,
    /// Path of the declaring module.
    pub module_path: String,
    /// Position of this declaration among the module's effects.
    pub decl_index: u32,
    /// User-assigned stable identity, e.g. `"com.example.log"`.
    pub explicit_id: Option<String>,
    pub generics: u32,
    pub ops: Vec<OpDecl>,
    pub span: Span,
}

/// A struct declaration. Field types may mention the struct's generics.
#[derive(Debug, Clone)]
pub struct StructDecl {
    pub def_id: DefId,
    pub name: String,
    pub generics: u32,
    pub fields: Vec<(String, Type)>,
    pub span: Span,
}

/// An explicit payload serializer: a pure function pair converting a type
/// to and from a single 64-bit word at the host boundary.
#[derive(Debug, Clone)]
pub struct SerializerDecl {
    pub ty: Type,
    /// `fn(T) -> i64`
    pub encode: DefId,
    /// `fn(i64) -> T`
    pub decode: DefId,
}

/// A resolved function signature as reported by the type checker.
#[derive(Debug, Clone, PartialEq)]
pub struct FnSignature {
    pub generics: u32,
    pub params: Vec<Type>,
    pub ret: Type,
    pub effects: Option<EffectRow>,
}

/// The type checker's view of resolved symbols.
///
/// The effects pipeline never infers ordinary types; it asks this
/// collaborator for them.
pub trait SymbolTypes {
    /// Resolved parameter and return types and declared effect row.
    fn signature(&self, def_id: DefId) -> Option<FnSignature>;

    /// Human readable name of a symbol, for generated names and messages.
    fn symbol_name(&self, def_id: DefId) -> Option<&str>;
}

/// A type-checked compilation unit.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub module_path: String,
    pub effects: BTreeMap<DefId, EffectDecl>,
    pub structs: BTreeMap<DefId, StructDecl>,
    pub functions: BTreeMap<DefId, FnDecl>,
    pub serializers: Vec<SerializerDecl>,
}

impl Program {
    pub fn new(module_path: impl Into<String>) -> Self {
        Self {
            module_path: module_path.into(),
            ..Self::default()
        }
    }

    pub fn function(&self, def_id: DefId) -> Option<&FnDecl> {
        self.functions.get(&def_id)
    }

    pub fn effect(&self, def_id: DefId) -> Option<&EffectDecl> {
        self.effects.get(&def_id)
    }

    pub fn struct_decl(&self, def_id: DefId) -> Option<&StructDecl> {
        self.structs.get(&def_id)
    }

    /// The serializer registered for exactly this type.
    pub fn serializer_for(&self, ty: &Type) -> Option<&SerializerDecl> {
        self.serializers.iter().find(|s| &s.ty == ty)
    }

    /// Concrete field types of a struct instantiation.
    pub fn struct_fields(&self, def_id: DefId, args: &[Type]) -> Option<Vec<Type>> {
        let decl = self.structs.get(&def_id)?;
        Some(decl.fields.iter().map(|(_, t)| t.substitute(args)).collect())
    }

    /// Source-level name of a type, e.g. `Pair<i32>`.
    pub fn type_name(&self, ty: &Type) -> String {
        match ty {
            Type::Struct { def_id, args } => {
                let mut out = self
                    .structs
                    .get(def_id)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| def_id.to_string());
                if !args.is_empty() {
                    let names: Vec<String> = args.iter().map(|a| self.type_name(a)).collect();
                    out.push('<');
                    out.push_str(&names.join(", "));
                    out.push('>');
                }
                out
            }
            Type::Cont { resume, answer } => {
                format!("cont({}) -> {}", self.type_name(resume), self.type_name(answer))
            }
            other => other.to_string(),
        }
    }

    /// Name of an effect instantiation, e.g. `State<i32>`.
    pub fn effect_name(&self, effect: DefId, args: &[Type]) -> String {
        let mut out = self
            .effects
            .get(&effect)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| effect.to_string());
        if !args.is_empty() {
            let names: Vec<String> = args.iter().map(|a| self.type_name(a)).collect();
            out.push('<');
            out.push_str(&names.join(", "));
            out.push('>');
        }
        out
    }
}

impl SymbolTypes for Program {
    fn signature(&self, def_id: DefId) -> Option<FnSignature> {
        let f = self.functions.get(&def_id)?;
        Some(FnSignature {
            generics: f.generics,
            params: f.param_types(),
            ret: f.ret.clone(),
            effects: f.declared_effects.clone(),
        })
    }

    fn symbol_name(&self, def_id: DefId) -> Option<&str> {
        if let Some(f) = self.functions.get(&def_id) {
            return Some(&f.name);
        }
        if let Some(e) = self.effects.get(&def_id) {
            return Some(&e.name);
        }
        self.structs.get(&def_id).map(|s| s.name.as_str())
    }
}
