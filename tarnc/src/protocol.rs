//! Host protocol table.
//!
//! Every compiled module publishes the operations it may hand to its host
//! and the exports the host may call. The table travels inside the module as
//! the JSON custom section [`PROTOCOL_SECTION`]:
//!
//! ```json
//! {
//!   "version": 1,
//!   "ops": [{ "opIndex": 0, "effectId": "app#0", "opId": 0, "opName": "await",
//!             "resumeKind": "resume", "signatureHash": "9c1e...", "label": "Async.await",
//!             "params": ["i32"], "result": "i32" }],
//!   "exports": [{ "name": "main", "params": [], "result": "i32", "effectful": true }]
//! }
//! ```
//!
//! `opIndex` is the dense index the module's dispatcher uses;
//! `(effectId, opId, signatureHash)` is the key hosts register handlers
//! against.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::effects::{EffectId, OpId, SignatureHash};
use crate::hir::ResumeKind;

/// Bump together with any change to the boundary imports or this table.
pub const PROTOCOL_VERSION: u32 = 1;

/// Name of the custom section holding the table.
pub const PROTOCOL_SECTION: &str = "tarn.effects";

/// How one payload word crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// `()`: the word is zero.
    None,
    /// Sign-extended `i32` (also `bool`).
    I32,
    /// Zero-extended `u32`.
    U32,
    /// A word produced by a declared serializer.
    Serialized,
    /// Cannot cross the boundary.
    Opaque,
}

impl PayloadKind {
    /// Write-value tag of a result of this kind.
    pub fn tag(self) -> i32 {
        match self {
            PayloadKind::None | PayloadKind::Opaque => 0,
            PayloadKind::I32 | PayloadKind::U32 => 1,
            PayloadKind::Serialized => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolOp {
    pub op_index: u32,
    pub effect_id: EffectId,
    pub op_id: OpId,
    pub op_name: String,
    pub resume_kind: ResumeKind,
    pub signature_hash: SignatureHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub params: Vec<PayloadKind>,
    #[serde(default = "opaque")]
    pub result: PayloadKind,
}

fn opaque() -> PayloadKind {
    PayloadKind::Opaque
}

impl ProtocolOp {
    pub fn key(&self) -> HandlerKey {
        HandlerKey {
            effect_id: self.effect_id.clone(),
            op_id: self.op_id,
            signature_hash: self.signature_hash,
        }
    }

    /// Human readable name, e.g. `Async.await`.
    pub fn display_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.effect_id, self.op_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolExport {
    pub name: String,
    pub params: Vec<PayloadKind>,
    pub result: PayloadKind,
    pub effectful: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolTable {
    pub version: u32,
    pub ops: Vec<ProtocolOp>,
    #[serde(default)]
    pub exports: Vec<ProtocolExport>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed protocol table: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ops: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let table: ProtocolTable = serde_json::from_slice(bytes)?;
        if table.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: table.version,
                expected: PROTOCOL_VERSION,
            });
        }
        Ok(table)
    }

    pub fn op(&self, op_index: u32) -> Option<&ProtocolOp> {
        self.ops.iter().find(|o| o.op_index == op_index)
    }

    /// The operation registered under `key`, if any.
    pub fn find(&self, key: &HandlerKey) -> Option<&ProtocolOp> {
        self.ops.iter().find(|o| {
            o.effect_id == key.effect_id && o.op_id == key.op_id && o.signature_hash == key.signature_hash
        })
    }

    pub fn export(&self, name: &str) -> Option<&ProtocolExport> {
        self.exports.iter().find(|e| e.name == name)
    }
}

impl Default for ProtocolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The stable external key of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey {
    pub effect_id: EffectId,
    pub op_id: OpId,
    pub signature_hash: SignatureHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerKeyError {
    #[error("handler key `{0}` must have the form `<effectId>:<opId>:<signatureHash>`")]
    Malformed(String),
    #[error("handler key `{0}` has an invalid operation id")]
    BadOpId(String),
    #[error("handler key `{0}` has an invalid signature hash")]
    BadHash(String),
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.effect_id, self.op_id, self.signature_hash)
    }
}

impl FromStr for HandlerKey {
    type Err = HandlerKeyError;

    /// Splits from the right: effect ids may themselves contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let (Some(hash), Some(op), Some(effect)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(HandlerKeyError::Malformed(s.to_string()));
        };
        if effect.is_empty() {
            return Err(HandlerKeyError::Malformed(s.to_string()));
        }
        let op_id = op.parse::<u32>().map_err(|_| HandlerKeyError::BadOpId(s.to_string()))?;
        if hash.len() != 16 {
            return Err(HandlerKeyError::BadHash(s.to_string()));
        }
        let signature_hash = hash
            .parse::<SignatureHash>()
            .map_err(|_| HandlerKeyError::BadHash(s.to_string()))?;
        Ok(HandlerKey {
            effect_id: EffectId::new(effect),
            op_id: OpId(op_id),
            signature_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_op() -> ProtocolOp {
        ProtocolOp {
            op_index: 0,
            effect_id: EffectId::new("com.example:async"),
            op_id: OpId(1),
            op_name: "await".into(),
            resume_kind: ResumeKind::Resume,
            signature_hash: SignatureHash(0x1234),
            label: Some("Async.await".into()),
            params: vec![PayloadKind::I32],
            result: PayloadKind::I32,
        }
    }

    #[test]
    fn test_json_uses_camel_case() {
        let mut table = ProtocolTable::new();
        table.ops.push(sample_op());
        let json = String::from_utf8(table.to_json().unwrap()).unwrap();
        assert!(json.contains("\"opIndex\":0"));
        assert!(json.contains("\"effectId\":\"com.example:async\""));
        assert!(json.contains("\"resumeKind\":\"resume\""));
        assert!(json.contains("\"signatureHash\":\"0000000000001234\""));
        assert_eq!(ProtocolTable::from_json(json.as_bytes()).unwrap(), table);
    }

    #[test]
    fn test_minimal_table_parses() {
        let json = br#"{"version":1,"ops":[{"opIndex":3,"effectId":"e","opId":0,"opName":"x","resumeKind":"tail","signatureHash":"00000000000000ff"}]}"#;
        let table = ProtocolTable::from_json(json).unwrap();
        let op = table.op(3).unwrap();
        assert_eq!(op.resume_kind, ResumeKind::Tail);
        assert_eq!(op.result, PayloadKind::Opaque);
        assert_eq!(op.display_label(), "e.x");
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let json = br#"{"version":7,"ops":[]}"#;
        assert!(matches!(
            ProtocolTable::from_json(json),
            Err(ProtocolError::UnsupportedVersion { found: 7, .. })
        ));
    }

    #[test]
    fn test_key_splits_from_the_right() {
        let key: HandlerKey = "com.example:async:1:0000000000001234".parse().unwrap();
        assert_eq!(key.effect_id.as_str(), "com.example:async");
        assert_eq!(key.op_id, OpId(1));
        let mut table = ProtocolTable::new();
        table.ops.push(sample_op());
        assert_eq!(table.find(&key).map(|o| o.op_index), Some(0));
    }

    #[test]
    fn test_malformed_keys() {
        assert!(matches!("a:b".parse::<HandlerKey>(), Err(HandlerKeyError::Malformed(_))));
        assert!(matches!("e:x:0000000000000000".parse::<HandlerKey>(), Err(HandlerKeyError::BadOpId(_))));
        assert!(matches!("e:0:zz".parse::<HandlerKey>(), Err(HandlerKeyError::BadHash(_))));
    }

    proptest! {
        #[test]
        fn prop_handler_key_round_trips(effect in "[a-z:.#]{0,12}[a-z]", op in any::<u32>(), hash in any::<u64>()) {
            let key = HandlerKey {
                effect_id: EffectId::new(effect),
                op_id: OpId(op),
                signature_hash: SignatureHash(hash),
            };
            let parsed: HandlerKey = key.to_string().parse().unwrap();
            prop_assert_eq!(parsed, key);
        }
    }
}
