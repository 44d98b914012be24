//! Polling channel: pulls on a timer.

use crate::channel::{Channel, PullBatch};
use crate::error::{ChannelError, ErrorSource};
use crate::poll::{PollDelegate, PollTimer};
use async_trait::async_trait;
use reactor_types::{Cursor, PushAck, Strand, StrandResult};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

/// Receives what a channel pulls.
#[async_trait]
pub trait InboxSink: Send + Sync {
    /// Apply pulled strands. An error leaves them unacknowledged, so they
    /// are pulled again.
    async fn receive(&self, strands: Vec<Strand>) -> Result<(), ChannelError>;

    /// The remote confirmed everything up to `cursor`.
    async fn cursor_advanced(&self, _cursor: Cursor) -> Result<(), ChannelError> {
        Ok(())
    }

    /// The remote refused a pushed strand.
    fn push_rejected(&self, _result: &StrandResult) {}
}

/// Pull everything after the shared cursor into `inbox`, acknowledging
/// and advancing after each batch. Returns the number of strands received.
///
/// Holding the cursor lock keeps a timer tick and an explicit sync from
/// pulling the same batch twice.
pub async fn pull_into(
    channel: &dyn Channel,
    cursor: &Mutex<Cursor>,
    inbox: &dyn InboxSink,
) -> Result<usize, ChannelError> {
    let mut cursor = cursor.lock().await;
    let mut received = 0;

    loop {
        let batch = channel.pull(*cursor).await?;
        let has_more = batch.has_more;
        let moved = batch.next_cursor != *cursor;

        if !batch.strands.is_empty() {
            received += batch.strands.len();
            inbox.receive(batch.strands).await?;
        }
        if moved {
            channel.acknowledge(batch.next_cursor).await?;
            *cursor = batch.next_cursor;
            inbox.cursor_advanced(batch.next_cursor).await?;
        }
        if !has_more || !moved {
            break;
        }
    }

    if received > 0 {
        tracing::debug!(remote = channel.remote(), received, cursor = cursor.value(), "pulled strands");
    }
    Ok(received)
}

/// Wraps a channel so that pulls come in on the poll timer's ticks.
///
/// Pushes go straight through. A failed push is returned, never kept, so
/// the caller holds the strands until the remote has them. Errors are
/// re-tagged [`ErrorSource::Polling`].
pub struct PollingChannel {
    inner: Arc<dyn Channel>,
    inbox: Arc<dyn InboxSink>,
    timer: Arc<dyn PollTimer>,
    cursor: Arc<Mutex<Cursor>>,
    this: Weak<PollingChannel>,
}

impl fmt::Debug for PollingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingChannel")
            .field("remote", &self.inner.remote())
            .field("running", &self.timer.is_running())
            .finish_non_exhaustive()
    }
}

impl PollingChannel {
    /// Create a stopped polling channel over `inner`, sharing `cursor` with
    /// whoever else pulls from the same remote.
    pub fn new(
        inner: Arc<dyn Channel>,
        inbox: Arc<dyn InboxSink>,
        timer: Arc<dyn PollTimer>,
        cursor: Arc<Mutex<Cursor>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner,
            inbox,
            timer,
            cursor,
            this: this.clone(),
        })
    }

    /// Start polling.
    pub fn start(&self) {
        if let Some(this) = self.this.upgrade() {
            self.timer.start(this);
        }
    }

    /// Stop polling; a tick in progress finishes.
    pub fn stop(&self) {
        self.timer.stop();
    }

    /// One tick: pull everything new.
    pub async fn tick(&self) -> Result<usize, ChannelError> {
        pull_into(self.inner.as_ref(), &self.cursor, self.inbox.as_ref())
            .await
            .map_err(|e| e.retag(ErrorSource::Polling))
    }
}

#[async_trait]
impl PollDelegate for PollingChannel {
    async fn poll(&self) -> Result<(), ChannelError> {
        self.tick().await.map(|_| ())
    }
}

#[async_trait]
impl Channel for PollingChannel {
    fn remote(&self) -> &str {
        self.inner.remote()
    }

    async fn push(&self, strands: Vec<Strand>) -> Result<PushAck, ChannelError> {
        self.inner
            .push(strands)
            .await
            .map_err(|e| e.retag(ErrorSource::Polling))
    }

    async fn pull(&self, cursor: Cursor) -> Result<PullBatch, ChannelError> {
        self.inner
            .pull(cursor)
            .await
            .map_err(|e| e.retag(ErrorSource::Polling))
    }

    async fn acknowledge(&self, cursor: Cursor) -> Result<(), ChannelError> {
        self.inner
            .acknowledge(cursor)
            .await
            .map_err(|e| e.retag(ErrorSource::Polling))
    }

    async fn shutdown(&self) {
        self.timer.stop();
        self.timer.join().await;
        tracing::debug!(remote = self.inner.remote(), "polling channel stopped");
    }
}
