//! Actions, operations and their signatures.
//!
//! An [`Action`] is what a client submits. The reactor turns it into one or
//! more [`Operation`]s, each with an assigned `index` inside its
//! (document, scope, branch) log and a content `hash`.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Branch used when a caller does not name one.
pub const DEFAULT_BRANCH: &str = "main";

/// Milliseconds since the Unix epoch.
pub fn now_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fixed-width signature tuple attached to signed actions.
///
/// Fields, in order: signing timestamp (seconds), signer identity, action
/// hash, previous state hash, signature bytes as hex. Serialized as a
/// five-element array.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature(pub String, pub String, pub String, pub String, pub String);

impl Signature {
    /// Build a signature tuple from its parts.
    pub fn new(
        timestamp: impl Into<String>,
        signer: impl Into<String>,
        action_hash: impl Into<String>,
        prev_state_hash: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self(
            timestamp.into(),
            signer.into(),
            action_hash.into(),
            prev_state_hash.into(),
            signature.into(),
        )
    }

    /// The signature produced when no signer is configured.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when this is the pass-through signature.
    pub fn is_empty(&self) -> bool {
        self.4.is_empty()
    }

    /// Signing timestamp in seconds.
    pub fn timestamp(&self) -> &str {
        &self.0
    }

    /// Identity of the signer.
    pub fn signer(&self) -> &str {
        &self.1
    }

    /// Hash of the signed action.
    pub fn action_hash(&self) -> &str {
        &self.2
    }

    /// Hash of the document state the action was applied to.
    pub fn prev_state_hash(&self) -> &str {
        &self.3
    }

    /// Hex-encoded signature bytes.
    pub fn signature_hex(&self) -> &str {
        &self.4
    }
}

/// A client intent, not yet ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Unique action identifier
    pub id: uuid::Uuid,
    /// Action type, interpreted by the document model
    #[serde(rename = "type")]
    pub action_type: String,
    /// Scope the action targets (`global`, `local`, ...)
    pub scope: String,
    /// Action payload
    pub input: Value,
    /// Client timestamp
    pub timestamp_utc_ms: u64,
    /// Signature, filled in before the action is persisted
    #[serde(default)]
    pub signature: Option<Signature>,
}

impl Action {
    /// Create an unsigned action stamped with the current time.
    pub fn new(action_type: impl Into<String>, scope: impl Into<String>, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            action_type: action_type.into(),
            scope: scope.into(),
            input,
            timestamp_utc_ms: now_utc_ms(),
            signature: None,
        }
    }

    /// Attach a signature.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// An ordered, hashed entry in a (document, scope, branch) log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the log, starting at 0, gapless
    pub index: u64,
    /// Scope of the log this operation belongs to
    pub scope: String,
    /// Branch of the log this operation belongs to
    pub branch: String,
    /// Action type
    #[serde(rename = "type")]
    pub action_type: String,
    /// Action payload
    pub input: Value,
    /// Content digest, see [`Operation::compute_hash`]
    pub hash: String,
    /// Timestamp of the originating action
    pub timestamp_utc_ms: u64,
    /// Identifier of the originating action
    pub action_id: uuid::Uuid,
    /// Signature of the originating action
    #[serde(default)]
    pub signature: Option<Signature>,
    /// Scope state after applying this operation, when known
    #[serde(default)]
    pub resulting_state: Option<Value>,
    /// Name of the remote this operation was synced from
    #[serde(default)]
    pub source_remote: Option<String>,
}

impl Operation {
    /// Build an operation for `action` at the given position.
    pub fn from_action(action: &Action, index: u64, branch: &str) -> Self {
        let mut op = Self {
            index,
            scope: action.scope.clone(),
            branch: branch.to_string(),
            action_type: action.action_type.clone(),
            input: action.input.clone(),
            hash: String::new(),
            timestamp_utc_ms: action.timestamp_utc_ms,
            action_id: action.id,
            signature: action.signature.clone(),
            resulting_state: None,
            source_remote: None,
        };
        op.hash = op.compute_hash();
        op
    }

    /// Reconstruct the action this operation was derived from.
    pub fn to_action(&self) -> Action {
        Action {
            id: self.action_id,
            action_type: self.action_type.clone(),
            scope: self.scope.clone(),
            input: self.input.clone(),
            timestamp_utc_ms: self.timestamp_utc_ms,
            signature: self.signature.clone(),
        }
    }

    /// Content digest of this operation.
    ///
    /// Covers scope, branch, type, input, timestamp and action id, but not
    /// `index`: an operation moved to a later position keeps its hash.
    pub fn compute_hash(&self) -> String {
        let content = serde_json::json!([
            self.scope,
            self.branch,
            self.action_type,
            self.input,
            self.timestamp_utc_ms,
            self.action_id,
        ]);
        let mut hasher = Sha256::new();
        hasher.update(content.to_string().as_bytes());
        STANDARD.encode(hasher.finalize())
    }

    /// True when the stored hash matches the content.
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Move this operation to a new position in its log.
    pub fn reindexed(mut self, index: u64) -> Self {
        self.index = index;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_hash_ignores_index() {
        let action = Action::new("SET_NAME", "global", json!({"name": "a"}));
        let op = Operation::from_action(&action, 0, DEFAULT_BRANCH);
        let moved = op.clone().reindexed(7);

        assert!(op.verify_hash());
        assert_eq!(op.hash, moved.hash);
        assert!(moved.verify_hash());
    }

    #[test]
    fn operation_hash_covers_input() {
        let a = Action::new("SET_NAME", "global", json!({"name": "a"}));
        let mut b = a.clone();
        b.input = json!({"name": "b"});

        let op_a = Operation::from_action(&a, 0, DEFAULT_BRANCH);
        let op_b = Operation::from_action(&b, 0, DEFAULT_BRANCH);
        assert_ne!(op_a.hash, op_b.hash);
    }

    #[test]
    fn tampered_operation_fails_hash_check() {
        let action = Action::new("SET_NAME", "global", json!({"name": "a"}));
        let mut op = Operation::from_action(&action, 0, DEFAULT_BRANCH);
        op.input = json!({"name": "evil"});
        assert!(!op.verify_hash());
    }

    #[test]
    fn operation_action_roundtrip() {
        let action = Action::new("ADD", "local", json!({"n": 1}))
            .with_signature(Signature::new("1", "me", "h", "p", "ab"));
        let op = Operation::from_action(&action, 3, "feature");

        assert_eq!(op.to_action(), action);
        assert_eq!(op.branch, "feature");
    }

    #[test]
    fn signature_serializes_as_five_tuple() {
        let sig = Signature::new("1700000000", "ed25519:ab", "hash", "", "beef");
        let json = serde_json::to_value(&sig).unwrap();
        assert_eq!(json, json!(["1700000000", "ed25519:ab", "hash", "", "beef"]));
        assert!(!sig.is_empty());
        assert!(Signature::empty().is_empty());
    }

    #[test]
    fn operation_json_uses_type_key() {
        let action = Action::new("SET_NAME", "global", json!(null));
        let op = Operation::from_action(&action, 0, DEFAULT_BRANCH);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "SET_NAME");
        assert_eq!(json["index"], 0);
    }
}
