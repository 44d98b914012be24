//! Transport abstraction for sync channels.
//!
//! A transport carries one encoded [`Message`](reactor_types::Message)
//! to a remote reactor and returns the encoded answer:
//! - [`HttpTransport`] POSTs to the remote's `/sync` endpoint
//! - [`LoopbackTransport`] calls a [`SyncService`](reactor_server::SyncService) in-process
//! - [`MockTransport`] replays queued answers for tests

mod http;
mod loopback;
mod mock;

pub use http::HttpTransport;
pub use loopback::LoopbackTransport;
pub use mock::MockTransport;

use crate::error::TransportError;
use async_trait::async_trait;

/// Request/response byte exchange with one remote.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one encoded request and wait for the encoded response.
    async fn request(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    /// Where requests go, for logs.
    fn endpoint(&self) -> &str;
}
