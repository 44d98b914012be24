//! # reactor-server
//!
//! The drive reactor process.
//!
//! This crate:
//! - Persists operation logs and checkpoints (SQLite or PostgreSQL)
//! - Runs jobs through a keyed queue, one job per document at a time
//! - Republishes committed strands to listeners after a debounce window
//! - Serves pulls and pushes from remote reactors
//!
//! ## Architecture
//!
//! ```text
//!  Job ──► JobProcessor ──► OperationStore
//!               │
//!               ▼
//!         EventEmitter ──► push listeners
//!               │
//!               └──► pull responders ◄── SyncService ◄── POST /sync
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod processor;
pub mod reactor;
pub mod service;
pub mod storage;

pub use config::Config;
pub use error::{ReactorError, Result, StorageError};
pub use reactor::{Reactor, ReactorBuilder, ReactorMetrics};
pub use service::SyncService;
