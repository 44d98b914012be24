//! Remote configuration and the channel factory.

use crate::channel::{Channel, PullBatch};
use crate::error::{ChannelError, TransportError};
use crate::poll::{ErrorSink, IntervalPollTimer, PollTimerConfig};
use crate::polling::{InboxSink, PollingChannel};
use crate::rpc::RpcChannel;
use crate::transport::{HttpTransport, Transport};
use async_trait::async_trait;
use reactor_core::Backoff;
use reactor_types::{Cursor, DriveId, ListenerId, PushAck, Strand};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How a remote is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// Push immediately; pull on request
    #[default]
    Rpc,
    /// Push immediately; pull on the poll timer
    Polling,
    /// Push over RPC, retrying a transport failure once through the
    /// poller; pull on the poll timer
    RpcWithPollingFallback,
}

impl ChannelKind {
    /// Whether a poll timer runs for this kind.
    pub fn polls(&self) -> bool {
        !matches!(self, ChannelKind::Rpc)
    }
}

/// One `[[remotes]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Name of the remote, unique per reactor. Tags strands received from it.
    pub name: String,
    /// Drive synced with this remote.
    pub drive_id: DriveId,
    /// Base URL of the remote reactor.
    pub url: String,
    /// Channel kind (default: rpc).
    #[serde(default)]
    pub channel: ChannelKind,
    /// Pause between polls (default: 2000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Listener on the remote registered by an earlier run.
    #[serde(default)]
    pub listener_id: Option<ListenerId>,
    /// First retry delay after a failed poll (default: 1000).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Retry delay cap (default: 300000).
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Consecutive poll failures before the error log hears of it (default: 5).
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    300_000
}

fn default_max_failures() -> u32 {
    5
}

impl RemoteConfig {
    /// A remote with default timings.
    pub fn new(name: impl Into<String>, drive_id: DriveId, url: impl Into<String>, channel: ChannelKind) -> Self {
        Self {
            name: name.into(),
            drive_id,
            url: url.into(),
            channel,
            poll_interval_ms: default_poll_interval_ms(),
            listener_id: None,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_failures: default_max_failures(),
        }
    }

    /// Poll timer settings.
    pub fn poll_timer(&self) -> PollTimerConfig {
        PollTimerConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            backoff: Backoff::new(
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
            max_consecutive_failures: self.max_failures,
        }
    }
}

/// Builds the transport for a remote.
pub type TransportFactory =
    Arc<dyn Fn(&RemoteConfig) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

/// The channels built for one remote.
pub struct RemoteChannels {
    /// Where local strands are pushed
    pub channel: Arc<dyn Channel>,
    /// Request/response channel, used for listener registration and
    /// explicit pulls
    pub rpc: Arc<RpcChannel>,
    /// Poller, for kinds that poll
    pub poller: Option<Arc<PollingChannel>>,
}

impl fmt::Debug for RemoteChannels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannels")
            .field("rpc", &self.rpc)
            .field("poller", &self.poller)
            .finish_non_exhaustive()
    }
}

/// Builds channels from [`RemoteConfig`]s.
pub struct ChannelFactory {
    origin: String,
    request_timeout: Duration,
    pull_limit: u32,
    transports: Option<TransportFactory>,
}

impl fmt::Debug for ChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFactory")
            .field("origin", &self.origin)
            .field("request_timeout", &self.request_timeout)
            .field("pull_limit", &self.pull_limit)
            .finish_non_exhaustive()
    }
}

impl ChannelFactory {
    /// Factory for a reactor known to remotes as `origin`. Remotes are
    /// reached over HTTP.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            request_timeout: Duration::from_secs(30),
            pull_limit: 0,
            transports: None,
        }
    }

    /// Build transports with `factory` instead of HTTP.
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transports = Some(factory);
        self
    }

    /// HTTP request timeout (default: 30s).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Strands per pull; 0 lets the remote decide.
    pub fn with_pull_limit(mut self, limit: u32) -> Self {
        self.pull_limit = limit;
        self
    }

    /// Name this reactor pushes under.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Build the channels for `remote`.
    ///
    /// Pulled strands go to `inbox`; `cursor` is shared between the poller
    /// and explicit pulls. Poll failures past the configured threshold go
    /// to `error_sink`. Pollers are returned stopped.
    pub fn create(
        &self,
        remote: &RemoteConfig,
        inbox: Arc<dyn InboxSink>,
        cursor: Arc<Mutex<Cursor>>,
        error_sink: ErrorSink,
    ) -> Result<RemoteChannels, TransportError> {
        let transport = match &self.transports {
            Some(factory) => factory(remote)?,
            None => Arc::new(HttpTransport::new(&remote.url, self.request_timeout)?),
        };
        let rpc = Arc::new(
            RpcChannel::new(&remote.name, &self.origin, transport).with_pull_limit(self.pull_limit),
        );

        let poller = remote.channel.polls().then(|| {
            let timer = IntervalPollTimer::new(remote.poll_timer()).with_error_sink(error_sink);
            PollingChannel::new(rpc.clone(), inbox, Arc::new(timer), cursor)
        });

        let channel: Arc<dyn Channel> = match (remote.channel, &poller) {
            (ChannelKind::Polling, Some(poller)) => poller.clone(),
            (ChannelKind::RpcWithPollingFallback, Some(poller)) => {
                Arc::new(FallbackChannel::new(rpc.clone(), poller.clone()))
            }
            _ => rpc.clone(),
        };

        tracing::debug!(remote = %remote.name, kind = ?remote.channel, "created channel");
        Ok(RemoteChannels { channel, rpc, poller })
    }
}

/// Uses `primary`, switching to `fallback` for a call whose primary
/// attempt failed in transport. Rejections are returned as they are.
pub struct FallbackChannel {
    primary: Arc<dyn Channel>,
    fallback: Arc<dyn Channel>,
}

impl fmt::Debug for FallbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChannel")
            .field("remote", &self.primary.remote())
            .finish_non_exhaustive()
    }
}

impl FallbackChannel {
    /// Pair two channels to the same remote.
    pub fn new(primary: Arc<dyn Channel>, fallback: Arc<dyn Channel>) -> Self {
        Self { primary, fallback }
    }

    fn falling_back(&self, call: &str, error: &ChannelError) {
        tracing::warn!(remote = self.primary.remote(), call, error = %error, "primary channel unreachable, using fallback");
    }
}

#[async_trait]
impl Channel for FallbackChannel {
    fn remote(&self) -> &str {
        self.primary.remote()
    }

    async fn push(&self, strands: Vec<Strand>) -> Result<PushAck, ChannelError> {
        match self.primary.push(strands.clone()).await {
            Err(e) if e.is_transport() => {
                self.falling_back("push", &e);
                self.fallback.push(strands).await
            }
            result => result,
        }
    }

    async fn pull(&self, cursor: Cursor) -> Result<PullBatch, ChannelError> {
        match self.primary.pull(cursor).await {
            Err(e) if e.is_transport() => {
                self.falling_back("pull", &e);
                self.fallback.pull(cursor).await
            }
            result => result,
        }
    }

    async fn acknowledge(&self, cursor: Cursor) -> Result<(), ChannelError> {
        match self.primary.acknowledge(cursor).await {
            Err(e) if e.is_transport() => {
                self.falling_back("acknowledge", &e);
                self.fallback.acknowledge(cursor).await
            }
            result => result,
        }
    }

    async fn shutdown(&self) {
        self.primary.shutdown().await;
        self.fallback.shutdown().await;
    }
}
