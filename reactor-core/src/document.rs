//! Documents and the reducer contract.

use base64::{engine::general_purpose::STANDARD, Engine};
use reactor_types::{Action, DocumentId, DriveId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// A document header plus its materialized per-scope state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id
    pub id: DocumentId,
    /// Drive owning the document
    pub drive_id: DriveId,
    /// Document model type
    pub document_type: String,
    /// Version of the document model the state conforms to
    pub version: u32,
    /// Materialized state, keyed by scope
    pub state: BTreeMap<String, Value>,
}

impl Document {
    /// Create an empty document.
    pub fn new(
        id: DocumentId,
        drive_id: DriveId,
        document_type: impl Into<String>,
        version: u32,
    ) -> Self {
        Self {
            id,
            drive_id,
            document_type: document_type.into(),
            version,
            state: BTreeMap::new(),
        }
    }

    /// State of one scope, `null` when the scope has no state yet.
    pub fn scope_state(&self, scope: &str) -> &Value {
        self.state.get(scope).unwrap_or(&Value::Null)
    }

    /// Digest of one scope's state, used as the previous-state hash when signing.
    pub fn state_hash(&self, scope: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.scope_state(scope).to_string().as_bytes());
        STANDARD.encode(hasher.finalize())
    }
}

/// Errors raised by document model code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReducerError {
    /// Input failed schema validation
    #[error("invalid input for {action_type}: {reason}")]
    InvalidInput {
        /// Action type being validated
        action_type: String,
        /// What was wrong
        reason: String,
    },

    /// The model does not know this action type
    #[error("unknown action type: {0}")]
    UnknownAction(String),

    /// The reducer or upgrade transform failed
    #[error("reducer failed: {0}")]
    Failed(String),
}

/// An operation produced by a reducer, before it is ordered and hashed.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    /// Scope the operation belongs to
    pub scope: String,
    /// Operation type
    pub action_type: String,
    /// Operation payload
    pub input: Value,
}

impl OperationDraft {
    /// Draft that records `action` as-is.
    pub fn from_action(action: &Action) -> Self {
        Self {
            scope: action.scope.clone(),
            action_type: action.action_type.clone(),
            input: action.input.clone(),
        }
    }
}

/// Reducer output: the new per-scope state plus operations to record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reduction {
    /// Complete new state; scopes not present are left unchanged
    pub state: BTreeMap<String, Value>,
    /// Operations to append, in order
    pub operations: Vec<OperationDraft>,
}

impl Reduction {
    /// The common case: record the action in its own scope with new scope state.
    pub fn record(action: &Action, scope_state: Value) -> Self {
        let mut state = BTreeMap::new();
        state.insert(action.scope.clone(), scope_state);
        Self {
            state,
            operations: vec![OperationDraft::from_action(action)],
        }
    }
}

/// Applies an action to a document. Must be pure: no I/O, no clocks.
pub trait Reducer: Send + Sync {
    /// Compute the reduction of `action` against `document`.
    fn reduce(&self, document: &Document, action: &Action) -> Result<Reduction, ReducerError>;
}

impl<F> Reducer for F
where
    F: Fn(&Document, &Action) -> Result<Reduction, ReducerError> + Send + Sync,
{
    fn reduce(&self, document: &Document, action: &Action) -> Result<Reduction, ReducerError> {
        self(document, action)
    }
}

/// Validates action input against the model's schema.
pub trait ActionValidator: Send + Sync {
    /// Return an error when `action` is not acceptable.
    fn validate(&self, action: &Action) -> Result<(), ReducerError>;
}

impl<F> ActionValidator for F
where
    F: Fn(&Action) -> Result<(), ReducerError> + Send + Sync,
{
    fn validate(&self, action: &Action) -> Result<(), ReducerError> {
        self(action)
    }
}

/// One step of a document upgrade, from version `n - 1` to `n`.
pub trait UpgradeTransform: Send + Sync {
    /// Produce the upgraded document. The version field is set by the caller.
    fn upgrade(&self, document: Document, action: &Action) -> Result<Document, ReducerError>;
}

impl<F> UpgradeTransform for F
where
    F: Fn(Document, &Action) -> Result<Document, ReducerError> + Send + Sync,
{
    fn upgrade(&self, document: Document, action: &Action) -> Result<Document, ReducerError> {
        self(document, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_scope_is_null() {
        let doc = Document::new(DocumentId::from("d"), DriveId::from("r"), "t", 1);
        assert_eq!(doc.scope_state("global"), &Value::Null);
    }

    #[test]
    fn state_hash_tracks_state() {
        let mut doc = Document::new(DocumentId::from("d"), DriveId::from("r"), "t", 1);
        let empty = doc.state_hash("global");
        doc.state.insert("global".into(), json!({"count": 1}));
        assert_ne!(empty, doc.state_hash("global"));
        assert_eq!(doc.state_hash("local"), empty);
    }

    #[test]
    fn closures_are_reducers() {
        let reducer = |_: &Document, action: &Action| {
            Ok::<_, ReducerError>(Reduction::record(action, json!(1)))
        };
        let doc = Document::new(DocumentId::from("d"), DriveId::from("r"), "t", 1);
        let action = Action::new("SET", "global", json!({}));

        let reduction = reducer.reduce(&doc, &action).unwrap();
        assert_eq!(reduction.state["global"], json!(1));
        assert_eq!(reduction.operations, vec![OperationDraft::from_action(&action)]);
    }
}
