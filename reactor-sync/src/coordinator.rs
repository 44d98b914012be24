//! Sync coordinator: keeps a reactor in step with its remotes.
//!
//! Per remote the coordinator owns:
//! - the channels built by the [`ChannelFactory`]
//! - a push listener on the local emitter forwarding local strands
//! - the pull cursor, persisted in the local store after each batch
//!
//! Strands pulled from a remote are applied as jobs tagged with the
//! remote's name, so the push listener for that remote never echoes them
//! back.

use crate::channel::Channel;
use crate::error::{ChannelCause, ChannelError, ErrorSource, SyncError};
use crate::factory::{ChannelFactory, RemoteChannels, RemoteConfig};
use crate::poll::ErrorSink;
use crate::polling::{pull_into, InboxSink};
use async_trait::async_trait;
use reactor_server::events::{EmitterError, StrandHandler, SubscriptionToken, Transmitter};
use reactor_server::Reactor;
use reactor_types::{
    now_utc_ms, Cursor, DocumentId, ListenerFilter, Strand, StrandResult, StrandStatus,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;

/// Error log entries kept; older ones are dropped.
const ERROR_LOG_CAPACITY: usize = 1000;

/// A sync failure that will not be retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncErrorEntry {
    /// Remote involved
    pub remote: String,
    /// Document involved, when there is one
    pub document_id: Option<DocumentId>,
    /// What went wrong
    pub error: String,
    /// When, in ms since the Unix epoch
    pub at_utc_ms: u64,
}

#[derive(Debug, Default)]
struct ErrorLog {
    entries: StdMutex<VecDeque<SyncErrorEntry>>,
}

impl ErrorLog {
    fn record(&self, remote: &str, document_id: Option<DocumentId>, error: impl fmt::Display) {
        let error = error.to_string();
        tracing::error!(remote, document = ?document_id, error = %error, "sync failure");
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == ERROR_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(SyncErrorEntry {
            remote: remote.to_string(),
            document_id,
            error,
            at_utc_ms: now_utc_ms(),
        });
    }

    fn snapshot(&self) -> Vec<SyncErrorEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Applies strands pulled from one remote to the local reactor.
struct RemoteInbox {
    remote: String,
    reactor: Arc<Reactor>,
    errors: Arc<ErrorLog>,
}

#[async_trait]
impl InboxSink for RemoteInbox {
    async fn receive(&self, strands: Vec<Strand>) -> Result<(), ChannelError> {
        for strand in strands {
            let document_id = strand.document_id.clone();
            match self.reactor.apply_strand(strand, &self.remote).await {
                Ok(outcome) => {
                    tracing::debug!(
                        remote = %self.remote,
                        document = %document_id,
                        applied = outcome.strands.len(),
                        skipped = outcome.skipped,
                        rebased = outcome.rebased,
                        "applied remote strand"
                    );
                }
                Err(e) if e.is_transient() || e.is_aborted() => {
                    return Err(ChannelError::new(ErrorSource::Rpc, ChannelCause::Local(e.to_string())));
                }
                Err(e) => self.errors.record(&self.remote, Some(document_id), e),
            }
        }
        Ok(())
    }

    async fn cursor_advanced(&self, cursor: Cursor) -> Result<(), ChannelError> {
        self.reactor
            .storage()
            .write_sync_cursor(&self.remote, cursor)
            .await
            .map_err(|e| ChannelError::new(ErrorSource::Rpc, ChannelCause::Local(e.to_string())))
    }

    fn push_rejected(&self, result: &StrandResult) {
        if let StrandStatus::Rejected { reason } = &result.status {
            self.errors.record(&self.remote, Some(result.document_id.clone()), reason);
        }
    }
}

/// Push listener forwarding local strands to one remote.
struct PushForwarder {
    channel: Arc<dyn Channel>,
    inbox: Arc<RemoteInbox>,
}

#[async_trait]
impl StrandHandler for PushForwarder {
    async fn on_strands(&self, strands: Vec<Strand>) -> Result<(), EmitterError> {
        match self.channel.push(strands).await {
            Ok(ack) => {
                for result in &ack.results {
                    self.inbox.push_rejected(result);
                }
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(remote = self.channel.remote(), error = %e, "push failed, will retry");
                Err(EmitterError::Delivery(e.to_string()))
            }
            Err(e) => {
                self.inbox.errors.record(self.channel.remote(), None, &e);
                Ok(())
            }
        }
    }
}

struct RemoteHandle {
    config: RemoteConfig,
    channels: RemoteChannels,
    cursor: Arc<Mutex<Cursor>>,
    inbox: Arc<RemoteInbox>,
    push_listener: SubscriptionToken,
}

/// Connects a reactor to its remotes.
pub struct SyncCoordinator {
    reactor: Arc<Reactor>,
    factory: ChannelFactory,
    remotes: Mutex<HashMap<String, RemoteHandle>>,
    errors: Arc<ErrorLog>,
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("factory", &self.factory)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Coordinator for `reactor`, building channels with `factory`.
    pub fn new(reactor: Arc<Reactor>, factory: ChannelFactory) -> Self {
        Self {
            reactor,
            factory,
            remotes: Mutex::new(HashMap::new()),
            errors: Arc::new(ErrorLog::default()),
        }
    }

    /// The local reactor.
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Start syncing with `config`.
    ///
    /// Resumes from the configured remote listener and the persisted cursor
    /// when both exist; otherwise registers a new remote listener, which
    /// replays the remote's history from the start.
    pub async fn add_remote(&self, config: RemoteConfig) -> Result<(), SyncError> {
        if self.remotes.lock().await.contains_key(&config.name) {
            return Err(SyncError::DuplicateRemote(config.name));
        }

        let stored = self.reactor.storage().read_sync_cursor(&config.name).await?;
        let cursor = Arc::new(Mutex::new(stored.unwrap_or_default()));
        let inbox = Arc::new(RemoteInbox {
            remote: config.name.clone(),
            reactor: self.reactor.clone(),
            errors: self.errors.clone(),
        });
        let error_sink: ErrorSink = {
            let errors = self.errors.clone();
            let remote = config.name.clone();
            Arc::new(move |e: ChannelError| errors.record(&remote, None, e))
        };
        let channels = self
            .factory
            .create(&config, inbox.clone(), cursor.clone(), error_sink)
            .map_err(|e| ChannelError::new(ErrorSource::Rpc, e))?;

        // What the remote sends us: the drive, minus what we pushed.
        let remote_filter =
            ListenerFilter::for_drive(config.drive_id.clone()).excluding_remote(self.factory.origin());
        match (config.listener_id, stored) {
            (Some(listener_id), Some(_)) => {
                channels
                    .rpc
                    .use_listener(listener_id, config.drive_id.clone(), remote_filter)
                    .await;
            }
            _ => {
                channels
                    .rpc
                    .register_listener(config.drive_id.clone(), remote_filter)
                    .await?;
                *cursor.lock().await = Cursor::zero();
            }
        }

        let subscription = self.reactor.emitter().register(
            ListenerFilter::for_drive(config.drive_id.clone()).excluding_remote(config.name.clone()),
            Transmitter::Push(Arc::new(PushForwarder {
                channel: channels.channel.clone(),
                inbox: inbox.clone(),
            })),
        );

        if let Some(poller) = &channels.poller {
            poller.start();
        }

        tracing::info!(
            remote = %config.name,
            drive = %config.drive_id,
            url = %config.url,
            kind = ?config.channel,
            push_listener = %subscription.listener_id,
            "remote added"
        );

        let name = config.name.clone();
        let handle = RemoteHandle {
            config,
            channels,
            cursor,
            inbox,
            push_listener: subscription.token,
        };
        let mut remotes = self.remotes.lock().await;
        if remotes.contains_key(&name) {
            drop(remotes);
            Self::stop(&self.reactor, handle).await;
            return Err(SyncError::DuplicateRemote(name));
        }
        remotes.insert(name, handle);
        Ok(())
    }

    /// Stop syncing with `name`.
    pub async fn remove_remote(&self, name: &str) -> Result<(), SyncError> {
        let handle = self
            .remotes
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| SyncError::UnknownRemote(name.to_string()))?;
        Self::stop(&self.reactor, handle).await;
        tracing::info!(remote = name, "remote removed");
        Ok(())
    }

    /// Pull everything `name` has for us, apply it and acknowledge it.
    /// Returns the number of strands received.
    ///
    /// Transport failures are returned for the caller to retry. Strands
    /// the reactor refuses are recorded in [`errors`](Self::errors) and
    /// acknowledged.
    pub async fn sync_remote(&self, name: &str) -> Result<usize, SyncError> {
        let (rpc, cursor, inbox) = {
            let remotes = self.remotes.lock().await;
            let handle = remotes
                .get(name)
                .ok_or_else(|| SyncError::UnknownRemote(name.to_string()))?;
            (handle.channels.rpc.clone(), handle.cursor.clone(), handle.inbox.clone())
        };
        Ok(pull_into(rpc.as_ref(), &cursor, inbox.as_ref()).await?)
    }

    /// Names of the remotes being synced.
    pub async fn remotes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.remotes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Configuration of `name`.
    pub async fn remote_config(&self, name: &str) -> Option<RemoteConfig> {
        self.remotes.lock().await.get(name).map(|h| h.config.clone())
    }

    /// Failures that will not be retried, oldest first.
    pub fn errors(&self) -> Vec<SyncErrorEntry> {
        self.errors.snapshot()
    }

    /// Stop every remote.
    pub async fn shutdown(&self) {
        let handles: Vec<RemoteHandle> = self.remotes.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            Self::stop(&self.reactor, handle).await;
        }
        tracing::info!("sync coordinator stopped");
    }

    async fn stop(reactor: &Reactor, handle: RemoteHandle) {
        reactor.emitter().unregister(handle.push_listener);
        handle.channels.channel.shutdown().await;
    }
}
