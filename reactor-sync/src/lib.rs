//! # reactor-sync
//!
//! Sync channels between drive reactors.
//!
//! ## Features
//!
//! - **RPC channel**: one protocol message per exchange, over HTTP or in-process
//! - **Polling channel**: remote pulled on a timer, pushes sent as they come
//! - **Fallback**: push over RPC, buffer for the poller while the remote is down
//! - **Coordinator**: cursors, echo suppression and an error log per remote
//!
//! ## Example
//!
//! ```ignore
//! use reactor_sync::{ChannelFactory, ChannelKind, RemoteConfig, SyncCoordinator};
//!
//! let coordinator = SyncCoordinator::new(reactor.clone(), ChannelFactory::new("edge-1"));
//! coordinator
//!     .add_remote(RemoteConfig::new("hub", drive_id, "http://hub:8080", ChannelKind::Polling))
//!     .await?;
//!
//! // Pull now instead of waiting for the next tick
//! coordinator.sync_remote("hub").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod coordinator;
pub mod error;
pub mod factory;
pub mod poll;
pub mod polling;
pub mod rpc;
pub mod transport;

pub use channel::{Channel, PullBatch};
pub use coordinator::{SyncCoordinator, SyncErrorEntry};
pub use error::{ChannelCause, ChannelError, ErrorSource, SyncError, TransportError};
pub use factory::{ChannelFactory, ChannelKind, FallbackChannel, RemoteChannels, RemoteConfig, TransportFactory};
pub use poll::{ErrorSink, IntervalPollTimer, PollDelegate, PollTimer, PollTimerConfig};
pub use polling::{pull_into, InboxSink, PollingChannel};
pub use rpc::RpcChannel;
pub use transport::{HttpTransport, LoopbackTransport, MockTransport, Transport};
