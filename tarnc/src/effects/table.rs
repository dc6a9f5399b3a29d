//! # Effect Table
//!
//! Interns every effect declaration of a program together with its stable
//! cross-module identity and the numeric ids of its operations.
//!
//! ## Identities
//!
//! | Id              | Source                                                  |
//! |-----------------|---------------------------------------------------------|
//! | [`EffectId`]    | explicit string, or `"<module path>#<decl index>"`     |
//! | [`OpId`]        | zero-based position of the operation in its effect      |
//! | [`SignatureHash`] | BLAKE3 over params, return type and serializer metadata |
//!
//! The table is built once per compilation and is immutable afterwards.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use string_interner::{DefaultStringInterner, DefaultSymbol};

use crate::diagnostics::Diagnostic;
use crate::hir::{DefId, Program, ResumeKind, Type};
use crate::span::Span;

/// Format version mixed into every hash the table computes.
/// Increment when changing the canonical encoding.
pub const FORMAT_VERSION: u8 = 1;

/// Stable identity of an effect declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectId(String);

impl EffectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity derived for effects without an explicit id.
    pub fn derived(module_path: &str, decl_index: u32) -> Self {
        Self(format!("{}#{}", module_path, decl_index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hash of the identity string. Equal ids hash equally regardless of
    /// which module declared them.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[FORMAT_VERSION]);
        hasher.update(b"effect-id\0");
        hasher.update(self.0.as_bytes());
        first_word(hasher.finalize())
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Zero-based index of an operation within its declaring effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash over an operation's payload shape.
///
/// Rendered as 16 lowercase hex digits in protocol tables and handler keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignatureHash(pub u64);

impl SignatureHash {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SignatureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureHash({:016x})", self.0)
    }
}

impl fmt::Display for SignatureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SignatureHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(SignatureHash)
    }
}

impl Serialize for SignatureHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SignatureHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn first_word(hash: blake3::Hash) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(word)
}

/// Compute the signature hash of a concrete operation instance.
///
/// The encoding covers each parameter type, the return type, and for every
/// one of them how it is marshaled: through a declared serializer (named by
/// its encode/decode functions) or directly.
pub fn signature_hash(program: &Program, params: &[Type], ret: &Type) -> SignatureHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[FORMAT_VERSION]);
    hasher.update(b"op-signature\0");
    hasher.update(&(params.len() as u32).to_le_bytes());
    for ty in params.iter().chain(std::iter::once(ret)) {
        hasher.update(program.type_name(ty).as_bytes());
        hasher.update(&[0]);
        match program.serializer_for(ty) {
            Some(ser) => {
                let name = |d: DefId| program.function(d).map(|f| f.name.clone()).unwrap_or_default();
                hasher.update(b"ser:");
                hasher.update(name(ser.encode).as_bytes());
                hasher.update(b"/");
                hasher.update(name(ser.decode).as_bytes());
            }
            None => {
                hasher.update(b"raw");
            }
        }
        hasher.update(&[0]);
    }
    SignatureHash(first_word(hasher.finalize()))
}

/// An interned operation.
#[derive(Debug, Clone)]
pub struct OperationEntry {
    pub op_id: OpId,
    pub name: String,
    /// Parameter types; may mention the effect's generic parameters.
    pub params: Vec<Type>,
    pub ret: Type,
    pub resume_kind: ResumeKind,
}

/// An interned effect.
#[derive(Debug, Clone)]
pub struct EffectEntry {
    pub def_id: DefId,
    pub name: String,
    pub effect_id: EffectId,
    symbol: DefaultSymbol,
    pub generics: u32,
    pub ops: Vec<OperationEntry>,
}

impl EffectEntry {
    pub fn operation(&self, op: u32) -> Option<&OperationEntry> {
        self.ops.get(op as usize)
    }
}

/// Interned effect declarations of one compilation.
pub struct EffectTable {
    interner: DefaultStringInterner,
    entries: BTreeMap<DefId, EffectEntry>,
}

impl fmt::Debug for EffectTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectTable")
            .field("entries", &self.entries)
            .finish()
    }
}

impl EffectTable {
    /// Intern every effect declared by `program`.
    pub fn build(program: &Program) -> Self {
        let mut interner = DefaultStringInterner::new();
        let mut entries = BTreeMap::new();
        for (def_id, decl) in &program.effects {
            let effect_id = match &decl.explicit_id {
                Some(id) => EffectId::new(id.clone()),
                None => EffectId::derived(&decl.module_path, decl.decl_index),
            };
            let symbol = interner.get_or_intern(effect_id.as_str());
            let ops = decl
                .ops
                .iter()
                .enumerate()
                .map(|(i, op)| OperationEntry {
                    op_id: OpId(i as u32),
                    name: op.name.clone(),
                    params: op.params.clone(),
                    ret: op.ret.clone(),
                    resume_kind: op.resume_kind,
                })
                .collect();
            tracing::trace!(effect = %decl.name, id = %effect_id, "interned effect");
            entries.insert(
                *def_id,
                EffectEntry {
                    def_id: *def_id,
                    name: decl.name.clone(),
                    effect_id,
                    symbol,
                    generics: decl.generics,
                    ops,
                },
            );
        }
        Self { interner, entries }
    }

    pub fn effect(&self, def_id: DefId) -> Option<&EffectEntry> {
        self.entries.get(&def_id)
    }

    pub fn operation(&self, def_id: DefId, op: u32) -> Option<&OperationEntry> {
        self.entries.get(&def_id)?.operation(op)
    }

    /// Resolve a performed operation. Missing metadata at this stage is a
    /// compiler defect: analysis already rejected unknown operations.
    pub fn resolve(&self, def_id: DefId, op: u32, span: Span) -> Result<(&EffectEntry, &OperationEntry), Diagnostic> {
        let entry = self
            .entries
            .get(&def_id)
            .ok_or_else(|| Diagnostic::ice(format!("no effect table entry for {}", def_id), span))?;
        let operation = entry
            .operation(op)
            .ok_or_else(|| Diagnostic::ice(format!("effect `{}` has no operation #{}", entry.name, op), span))?;
        Ok((entry, operation))
    }

    /// Whether two declarations share one effect identity.
    pub fn same_identity(&self, a: DefId, b: DefId) -> bool {
        match (self.entries.get(&a), self.entries.get(&b)) {
            (Some(x), Some(y)) => x.symbol == y.symbol,
            _ => false,
        }
    }

    /// The identity string interned for a declaration.
    pub fn identity_str(&self, def_id: DefId) -> Option<&str> {
        self.interner.resolve(self.entries.get(&def_id)?.symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EffectEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{op, tail_op, ProgramBuilder};

    #[test]
    fn test_derived_ids_follow_declaration_order() {
        let mut pb = ProgramBuilder::new("app::io");
        let a = pb.effect("Log", vec![tail_op("log", vec![Type::I32], Type::Unit)]);
        let b = pb.effect("Async", vec![op("await", vec![Type::I32], Type::I32)]);
        let program = pb.finish();
        let table = EffectTable::build(&program);
        assert_eq!(table.effect(a).unwrap().effect_id.as_str(), "app::io#0");
        assert_eq!(table.effect(b).unwrap().effect_id.as_str(), "app::io#1");
        assert_eq!(table.operation(b, 0).unwrap().op_id, OpId(0));
        assert_eq!(table.operation(a, 0).unwrap().resume_kind, ResumeKind::Tail);
    }

    #[test]
    fn test_explicit_id_survives_rename() {
        let build = |name: &str| {
            let mut pb = ProgramBuilder::new("app");
            let e = pb.effect_with(name, Some("com.example.log"), 0, vec![op("log", vec![Type::I32], Type::Unit)]);
            let table = EffectTable::build(&pb.finish());
            table.effect(e).unwrap().effect_id.clone()
        };
        assert_eq!(build("Log"), build("Logger"));
        assert_eq!(build("Log").as_str(), "com.example.log");
    }

    #[test]
    fn test_same_explicit_id_is_same_identity() {
        let mut pb = ProgramBuilder::new("app");
        let a = pb.effect_with("A", Some("shared"), 0, vec![]);
        let b = pb.effect_with("B", Some("shared"), 0, vec![]);
        let c = pb.effect("C", vec![]);
        let table = EffectTable::build(&pb.finish());
        assert!(table.same_identity(a, b));
        assert!(!table.same_identity(a, c));
        assert_eq!(table.identity_str(b), Some("shared"));

        let other_module = EffectId::new("shared");
        assert_eq!(other_module.identity_hash(), table.effect(a).unwrap().effect_id.identity_hash());
    }

    #[test]
    fn test_resolve_missing_operation_is_ice() {
        let mut pb = ProgramBuilder::new("app");
        let a = pb.effect("A", vec![]);
        let table = EffectTable::build(&pb.finish());
        let err = table.resolve(a, 3, Span::dummy()).unwrap_err();
        assert!(err.message.contains("internal compiler error"));
    }

    #[test]
    fn test_signature_hash_tracks_shape() {
        let program = Program::new("app");
        let a = signature_hash(&program, &[Type::I32], &Type::I32);
        let b = signature_hash(&program, &[Type::I32], &Type::I32);
        let c = signature_hash(&program, &[Type::U32], &Type::I32);
        let d = signature_hash(&program, &[], &Type::I32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_signature_hash_text_round_trip() {
        let hash = SignatureHash(0x00ab_cdef_0123_4567);
        let text = hash.to_string();
        assert_eq!(text, "00abcdef01234567");
        assert_eq!(text.parse::<SignatureHash>().unwrap(), hash);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"00abcdef01234567\"");
    }
}
