//! # reactor-types
//!
//! Wire format and data types for the drive reactor.
//!
//! This crate provides the foundational types shared by every reactor crate:
//! - [`DriveId`], [`DocumentId`], [`ListenerId`], [`JobId`], [`Cursor`] - Identity and ordering types
//! - [`Action`], [`Operation`], [`Signature`] - The event-sourcing vocabulary
//! - [`Strand`], [`SyncUnit`] - The unit exchanged between reactors
//! - [`Message`] - Sync protocol messages (pull, push, acknowledge)
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod filter;
mod ids;
mod messages;
mod operation;
mod strand;

pub use error::WireError;
pub use filter::ListenerFilter;
pub use ids::{Cursor, DocumentId, DriveId, JobId, ListenerId};
pub use messages::{
    Acknowledge, Acknowledged, ErrorCode, ErrorResponse, ListenerRegistered, Message, PullResponse,
    PullStrands, PushAck, PushStrands, RegisterListener, StrandResult, StrandStatus,
};
pub use operation::{now_utc_ms, Action, Operation, Signature, DEFAULT_BRANCH};
pub use strand::{Strand, SyncUnit};
