//! The channel contract shared by every sync channel.

use crate::error::ChannelError;
use async_trait::async_trait;
use reactor_types::{Cursor, PushAck, Strand};

/// Strands pulled from a remote.
#[derive(Debug, Clone, PartialEq)]
pub struct PullBatch {
    /// Strands in the remote's commit order
    pub strands: Vec<Strand>,
    /// Cursor to acknowledge once the strands are applied
    pub next_cursor: Cursor,
    /// Whether the remote has more after this batch
    pub has_more: bool,
}

/// Moves strands between the local reactor and one remote.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Name of the remote.
    fn remote(&self) -> &str;

    /// Send local strands to the remote.
    async fn push(&self, strands: Vec<Strand>) -> Result<PushAck, ChannelError>;

    /// Fetch remote strands after `cursor`.
    async fn pull(&self, cursor: Cursor) -> Result<PullBatch, ChannelError>;

    /// Tell the remote everything up to `cursor` was applied.
    async fn acknowledge(&self, cursor: Cursor) -> Result<(), ChannelError>;

    /// Stop background work. An in-flight exchange may finish.
    async fn shutdown(&self) {}
}
