//! Sync protocol messages.
//!
//! Exchanged as request/response pairs between a sync channel and a
//! remote reactor's sync service.

use serde::{Deserialize, Serialize};

use crate::{Cursor, DocumentId, DriveId, ListenerFilter, ListenerId, Strand, WireError};

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Ask the remote to create a pull-responder listener
    RegisterListener(RegisterListener),
    /// Response to RegisterListener
    ListenerRegistered(ListenerRegistered),
    /// Request strands after a cursor
    PullStrands(PullStrands),
    /// Response to PullStrands
    PullResponse(PullResponse),
    /// Deliver locally produced strands
    PushStrands(PushStrands),
    /// Per-strand outcome of a push
    PushAck(PushAck),
    /// Confirm strands up to a cursor were applied
    Acknowledge(Acknowledge),
    /// Response to Acknowledge
    Acknowledged(Acknowledged),
    /// Request could not be served
    Error(ErrorResponse),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }

    /// Short name of the message variant, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RegisterListener(_) => "RegisterListener",
            Message::ListenerRegistered(_) => "ListenerRegistered",
            Message::PullStrands(_) => "PullStrands",
            Message::PullResponse(_) => "PullResponse",
            Message::PushStrands(_) => "PushStrands",
            Message::PushAck(_) => "PushAck",
            Message::Acknowledge(_) => "Acknowledge",
            Message::Acknowledged(_) => "Acknowledged",
            Message::Error(_) => "Error",
        }
    }
}

/// Create a pull-responder listener on the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterListener {
    /// Drive to listen to
    pub drive_id: DriveId,
    /// Additional restrictions
    pub filter: ListenerFilter,
    /// Whether existing history should be queued for the first pull
    pub backfill: bool,
}

/// The listener created by RegisterListener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRegistered {
    /// Id to use in PullStrands and Acknowledge
    pub listener_id: ListenerId,
}

/// Request strands queued for a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullStrands {
    /// Pull-responder listener on the remote
    pub listener_id: ListenerId,
    /// Return batches with cursor > this value
    pub since: Cursor,
    /// Maximum number of batches to return (0 = server default)
    pub limit: u32,
}

/// Strands queued after the requested cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Strands in commit order
    pub strands: Vec<Strand>,
    /// Cursor to acknowledge once these strands are applied
    pub next_cursor: Cursor,
    /// Whether more batches are waiting
    pub has_more: bool,
}

/// Push strands to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushStrands {
    /// Name the pushing reactor is known by on the remote
    pub origin: String,
    /// Strands in commit order
    pub strands: Vec<Strand>,
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// One result per pushed strand, in order
    pub results: Vec<StrandResult>,
}

impl PushAck {
    /// True when every strand was applied.
    pub fn all_applied(&self) -> bool {
        self.results
            .iter()
            .all(|r| matches!(r.status, StrandStatus::Applied { .. }))
    }
}

/// Result for one pushed strand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandResult {
    /// Document of the strand
    pub document_id: DocumentId,
    /// Scope of the strand
    pub scope: String,
    /// Branch of the strand
    pub branch: String,
    /// What happened to it
    pub status: StrandStatus,
}

/// What happened to a pushed strand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrandStatus {
    /// Applied; the remote log now ends at `revision`
    Applied {
        /// Last index in the remote log
        revision: Option<u64>,
    },
    /// Rejected by the remote; retrying will not help
    Rejected {
        /// Why
        reason: String,
    },
}

/// Confirm strands up to `cursor` were applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    /// Pull-responder listener on the remote
    pub listener_id: ListenerId,
    /// Highest cursor applied
    pub cursor: Cursor,
}

/// Response to Acknowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledged {
    /// Cursor the remote trimmed up to
    pub cursor: Cursor,
}

/// Why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The listener id is not registered
    UnknownListener,
    /// The request was malformed or unexpected
    BadRequest,
    /// The remote failed internally; retrying may help
    Internal,
}

/// Error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Action, Operation, DEFAULT_BRANCH};
    use serde_json::json;

    fn strand() -> Strand {
        let action = Action::new("SET", "global", json!({"k": [1, 2, {"x": null}]}));
        Strand {
            drive_id: DriveId::from("drive"),
            document_id: DocumentId::from("doc"),
            document_type: "test/kv".into(),
            scope: "global".into(),
            branch: DEFAULT_BRANCH.into(),
            operations: vec![Operation::from_action(&action, 0, DEFAULT_BRANCH)],
        }
    }

    #[test]
    fn pull_response_roundtrip() {
        let msg = Message::PullResponse(PullResponse {
            strands: vec![strand()],
            next_cursor: Cursor::new(7),
            has_more: false,
        });

        let bytes = msg.to_bytes().unwrap();
        let restored = Message::from_bytes(&bytes).unwrap();
        assert_eq!(msg, restored);
    }

    #[test]
    fn register_listener_roundtrip() {
        let msg = Message::RegisterListener(RegisterListener {
            drive_id: DriveId::from("drive"),
            filter: ListenerFilter::default().with_scopes(["global"]),
            backfill: true,
        });

        let restored = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(msg, restored);
        assert_eq!(restored.kind(), "RegisterListener");
    }

    #[test]
    fn push_ack_reports_rejections() {
        let ack = PushAck {
            results: vec![
                StrandResult {
                    document_id: DocumentId::from("a"),
                    scope: "global".into(),
                    branch: DEFAULT_BRANCH.into(),
                    status: StrandStatus::Applied { revision: Some(3) },
                },
                StrandResult {
                    document_id: DocumentId::from("b"),
                    scope: "global".into(),
                    branch: DEFAULT_BRANCH.into(),
                    status: StrandStatus::Rejected {
                        reason: "signature invalid".into(),
                    },
                },
            ],
        };
        assert!(!ack.all_applied());

        let restored = Message::from_bytes(&Message::PushAck(ack.clone()).to_bytes().unwrap()).unwrap();
        assert_eq!(restored, Message::PushAck(ack));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            Message::from_bytes(&[0xc1, 0x00]),
            Err(WireError::Deserialization(_))
        ));
    }
}
