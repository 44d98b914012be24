//! # reactor-core
//!
//! Pure logic for the drive reactor (no I/O, instant tests).
//!
//! This crate implements the queue, the per-document state machine, the
//! document model registry and the signing rules without any network or
//! disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (storage, timers, network) is performed by `reactor-server`
//! and `reactor-sync`, which interpret the directives produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod batch;
pub mod document;
pub mod jobs;
pub mod queue;
pub mod registry;
pub mod revisions;
pub mod signer;
pub mod state;

pub use backoff::Backoff;
pub use batch::StrandBatcher;
pub use document::{
    ActionValidator, Document, OperationDraft, Reducer, ReducerError, Reduction, UpgradeTransform,
};
pub use jobs::{Job, JobError, JobKey, JobKind, JobSource};
pub use queue::{KeyedQueue, QueueError};
pub use registry::{
    DocumentModelModule, DocumentModelRegistry, DocumentModelResolver, NullResolver, RegistryError,
    UpgradeManifest,
};
pub use revisions::{reconcile, ReconcileError, Reconciliation, RevisionMap};
pub use signer::{
    Ed25519Signer, Ed25519Verifier, PassthroughSigner, Signer, SignerError, Verdict, Verifier,
};
pub use state::{Directive, Event, FailReason, KeyState, RetryPolicy};
