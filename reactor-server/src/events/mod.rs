//! Event emitter: republishes committed strands to listeners.
//!
//! The processor calls [`EventEmitter::notify`] after every commit. Strands
//! are queued per matching listener and coalesced per log; a scheduler task
//! owned by the emitter delivers each listener's batch once the debounce
//! window has elapsed. [`EventEmitter::flush`] delivers immediately.
//!
//! Registering returns a [`Subscription`] whose [`SubscriptionToken`] is the
//! only way to unregister.

mod transmitter;

pub use transmitter::{PullPage, StrandHandler, Transmitter, TransmitterKind};

use crate::config::EventsConfig;
use crate::error::StorageError;
use crate::reactor::ReactorMetrics;
use crate::storage::{Checkpoint, OperationStore};
use dashmap::DashMap;
use reactor_core::{Backoff, JobSource, StrandBatcher};
use reactor_types::{Cursor, ListenerFilter, ListenerId, Strand};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use transmitter::PullOutbox;

/// Operations read per storage query while backfilling.
const BACKFILL_PAGE: u32 = 500;

/// Errors from the emitter and its handlers.
#[derive(Debug, thiserror::Error)]
pub enum EmitterError {
    /// No listener with this id
    #[error("unknown listener: {0}")]
    UnknownListener(ListenerId),

    /// The listener pushes; it cannot be pulled from
    #[error("listener {0} is not a pull responder")]
    NotPullResponder(ListenerId),

    /// A push handler failed
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Reading history failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Capability required to unregister a listener.
///
/// Not `Clone`: whoever holds it owns the registration.
pub struct SubscriptionToken {
    listener_id: ListenerId,
    secret: uuid::Uuid,
}

impl SubscriptionToken {
    /// The listener this token controls.
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }
}

impl fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionToken")
            .field("listener_id", &self.listener_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A registered listener.
#[derive(Debug)]
pub struct Subscription {
    /// Id used to pull and acknowledge
    pub listener_id: ListenerId,
    /// Capability to unregister
    pub token: SubscriptionToken,
}

/// Snapshot of a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerInfo {
    /// The listener
    pub listener_id: ListenerId,
    /// What it receives
    pub filter: ListenerFilter,
    /// How it receives it
    pub kind: TransmitterKind,
    /// Strands waiting for the next delivery
    pub pending: usize,
    /// Strands delivered but not yet acknowledged (pull responders)
    pub unacknowledged: usize,
}

struct Listener {
    id: ListenerId,
    secret: uuid::Uuid,
    filter: ListenerFilter,
    transmitter: Transmitter,
    pending: Mutex<StrandBatcher>,
    outbox: Mutex<PullOutbox>,
    /// While set, deliveries leave `pending` alone so history can be
    /// installed in front of it.
    backfilling: AtomicBool,
    /// Set when `pending` outgrew its cap and was dropped. The view
    /// checkpoint is held until the log is replayed to this listener.
    overflowed: AtomicBool,
    retry: Mutex<PushRetry>,
}

/// Failed pushes in a row and when the next attempt is due.
#[derive(Debug, Default)]
struct PushRetry {
    failures: u32,
    not_before: Option<Instant>,
}

impl Listener {
    fn info(&self) -> ListenerInfo {
        ListenerInfo {
            listener_id: self.id,
            filter: self.filter.clone(),
            kind: self.transmitter.kind(),
            pending: lock(&self.pending).len(),
            unacknowledged: lock(&self.outbox).len(),
        }
    }

    fn take_pending(&self) -> Vec<Strand> {
        if self.backfilling.load(Ordering::Acquire) {
            return Vec::new();
        }
        lock(&self.pending).drain()
    }

    /// Put a failed batch back in front of anything queued since.
    fn requeue(&self, batch: Vec<Strand>) {
        let mut pending = lock(&self.pending);
        let mut restored = StrandBatcher::new();
        restored.extend(batch);
        restored.extend(pending.drain());
        *pending = restored;
    }

    /// Queue strands, dropping the queue once it holds more than `cap`.
    fn enqueue(&self, strands: impl IntoIterator<Item = Strand>, cap: usize) {
        if self.overflowed.load(Ordering::Acquire) {
            return;
        }
        let mut pending = lock(&self.pending);
        pending.extend(strands);
        if matches!(self.transmitter, Transmitter::Push(_)) && pending.len() > cap {
            let dropped = pending.drain().len();
            self.overflowed.store(true, Ordering::Release);
            tracing::warn!(listener = %self.id, dropped, "push listener fell behind, will replay from the log");
        }
    }

    /// Time left before the next push may be attempted.
    fn backing_off(&self, now: Instant) -> Option<Duration> {
        lock(&self.retry)
            .not_before
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    /// Record a failed push and return the delay before the next one.
    fn push_failed(&self, backoff: &Backoff) -> Duration {
        let mut retry = lock(&self.retry);
        retry.failures = retry.failures.saturating_add(1);
        let delay = backoff.delay(retry.failures);
        retry.not_before = Some(Instant::now() + delay);
        delay
    }

    fn push_succeeded(&self) {
        let mut retry = lock(&self.retry);
        if retry.failures > 0 {
            tracing::info!(listener = %self.id, failures = retry.failures, "push listener recovered");
        }
        *retry = PushRetry::default();
    }

    fn has_work(&self) -> bool {
        self.overflowed.load(Ordering::Acquire) || !lock(&self.pending).is_empty()
    }
}

struct Inner {
    listeners: DashMap<ListenerId, Arc<Listener>>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    /// Serializes deliveries so batches reach each listener in commit order.
    delivery: tokio::sync::Mutex<()>,
    storage: Option<Arc<dyn OperationStore>>,
    /// Highest checkpoint notified but not yet delivered to every push listener.
    checkpoint: Mutex<Option<Checkpoint>>,
    /// Set when a push listener was removed before receiving everything.
    /// The view checkpoint stays put until history is re-notified.
    view_held: AtomicBool,
    max_pull_batch: usize,
    max_pending: usize,
    push_backoff: Backoff,
    metrics: Arc<ReactorMetrics>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl Inner {
    fn listener(&self, listener_id: &ListenerId) -> Result<Arc<Listener>, EmitterError> {
        self.listeners
            .get(listener_id)
            .map(|l| Arc::clone(l.value()))
            .ok_or(EmitterError::UnknownListener(*listener_id))
    }

    fn stash_checkpoint(&self, checkpoint: Checkpoint) {
        let mut slot = lock(&self.checkpoint);
        match slot.as_ref() {
            Some(current) if current.last_ordinal >= checkpoint.last_ordinal => {}
            _ => *slot = Some(checkpoint),
        }
    }

    /// Deliver pending strands. Push listeners still backing off from a
    /// failure are skipped unless `force` is set.
    ///
    /// Returns how long until the earliest skipped or failed listener may
    /// be retried.
    async fn deliver(&self, force: bool) -> Option<Duration> {
        let _delivery = self.delivery.lock().await;
        let checkpoint = lock(&self.checkpoint).take();

        let listeners: Vec<Arc<Listener>> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut pushed_all = true;
        let mut retry_in: Option<Duration> = None;
        let mut retry_after = |delay: Duration| {
            retry_in = Some(retry_in.map_or(delay, |current| current.min(delay)));
        };

        for listener in listeners {
            let Transmitter::Push(handler) = &listener.transmitter else {
                let batch = listener.take_pending();
                if !batch.is_empty() {
                    let count = batch.len() as u64;
                    lock(&listener.outbox).push(batch);
                    self.metrics.strands_delivered.fetch_add(count, Ordering::Relaxed);
                }
                continue;
            };

            if !force {
                if let Some(wait) = listener.backing_off(Instant::now()) {
                    if listener.has_work() {
                        pushed_all = false;
                        retry_after(wait);
                    }
                    continue;
                }
            }
            if listener.overflowed.load(Ordering::Acquire) {
                if let Err(e) = self.replay(&listener).await {
                    tracing::warn!(listener = %listener.id, error = %e, "failed to replay the log");
                    pushed_all = false;
                    retry_after(listener.push_failed(&self.push_backoff));
                    continue;
                }
            }

            let batch = listener.take_pending();
            if batch.is_empty() {
                continue;
            }
            let count = batch.len() as u64;
            match handler.on_strands(batch.clone()).await {
                Ok(()) => {
                    tracing::debug!(listener = %listener.id, strands = count, "delivered strands");
                    self.metrics.strands_delivered.fetch_add(count, Ordering::Relaxed);
                    listener.push_succeeded();
                }
                Err(e) => {
                    let delay = listener.push_failed(&self.push_backoff);
                    tracing::warn!(listener = %listener.id, error = %e, retry_in = ?delay, "push delivery failed");
                    listener.requeue(batch);
                    pushed_all = false;
                    retry_after(delay);
                }
            }
        }

        if let Some(checkpoint) = checkpoint {
            if pushed_all && !self.view_held.load(Ordering::Acquire) {
                if let Some(storage) = &self.storage {
                    if let Err(e) = storage.write_view_state(checkpoint).await {
                        tracing::error!(error = %e, "failed to advance view checkpoint");
                        self.stash_checkpoint(checkpoint);
                    }
                }
            } else {
                self.stash_checkpoint(checkpoint);
            }
        }
        retry_in
    }

    /// Refill an overflowed listener with everything after the view
    /// checkpoint, ahead of strands queued since.
    async fn replay(&self, listener: &Listener) -> Result<(), EmitterError> {
        let Some(storage) = &self.storage else {
            listener.overflowed.store(false, Ordering::Release);
            return Ok(());
        };
        let after = storage.read_view_state().await?.last_ordinal;
        // Commits notified from here on queue up behind the replay.
        listener.overflowed.store(false, Ordering::Release);
        let history = match read_history(storage.as_ref(), &listener.filter, after).await {
            Ok(history) => history,
            Err(e) => {
                listener.overflowed.store(true, Ordering::Release);
                lock(&listener.pending).drain();
                return Err(e);
            }
        };

        let mut pending = lock(&listener.pending);
        let mut merged = history;
        merged.extend(pending.drain());
        tracing::info!(listener = %listener.id, after, strands = merged.len(), "replaying log to push listener");
        *pending = merged;
        Ok(())
    }
}

/// Republishes committed strands to registered listeners.
///
/// Cheap to clone; clones share listeners and the scheduler.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<Inner>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    /// Create an emitter and start its scheduler. Must be called inside a
    /// tokio runtime.
    ///
    /// With `storage`, the view checkpoint advances after deliveries and
    /// pull responders can backfill history.
    pub fn new(
        config: &EventsConfig,
        storage: Option<Arc<dyn OperationStore>>,
        metrics: Arc<ReactorMetrics>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            listeners: DashMap::new(),
            wake: Arc::clone(&wake),
            shutdown,
            scheduler: Mutex::new(None),
            delivery: tokio::sync::Mutex::new(()),
            storage,
            checkpoint: Mutex::new(None),
            view_held: AtomicBool::new(false),
            max_pull_batch: config.max_pull_batch.max(1),
            max_pending: config.max_pending.max(1),
            push_backoff: config.push_backoff(),
            metrics,
        });

        let handle = tokio::spawn(run_scheduler(
            Arc::downgrade(&inner),
            wake,
            shutdown_rx,
            config.debounce(),
        ));
        *lock(&inner.scheduler) = Some(handle);

        Self { inner }
    }

    /// Register a listener.
    pub fn register(&self, filter: ListenerFilter, transmitter: Transmitter) -> Subscription {
        let listener = self.insert(filter, transmitter, false);
        tracing::debug!(listener = %listener.listener_id, "registered listener");
        listener
    }

    /// Register a pull responder, optionally queueing existing history
    /// that matches `filter` for its first pull.
    pub async fn register_pull_responder(
        &self,
        filter: ListenerFilter,
        backfill: bool,
    ) -> Result<Subscription, EmitterError> {
        let storage = match (&self.inner.storage, backfill) {
            (Some(storage), true) => Arc::clone(storage),
            _ => return Ok(self.register(filter, Transmitter::PullResponder)),
        };

        // Live strands committed from here on queue up behind the history.
        let subscription = self.insert(filter, Transmitter::PullResponder, true);
        let listener = self.inner.listener(&subscription.listener_id)?;

        let history = match read_history(storage.as_ref(), &listener.filter, 0).await {
            Ok(history) => history,
            Err(e) => {
                self.inner.listeners.remove(&subscription.listener_id);
                return Err(e);
            }
        };

        {
            let mut pending = lock(&listener.pending);
            let mut merged = history;
            merged.extend(pending.drain());
            tracing::debug!(
                listener = %listener.id,
                strands = merged.len(),
                "backfilled pull responder"
            );
            *pending = merged;
        }
        listener.backfilling.store(false, Ordering::Release);
        self.inner.wake.notify_one();

        Ok(subscription)
    }

    fn insert(&self, filter: ListenerFilter, transmitter: Transmitter, backfilling: bool) -> Subscription {
        let id = ListenerId::new();
        let secret = uuid::Uuid::new_v4();
        self.inner.listeners.insert(
            id,
            Arc::new(Listener {
                id,
                secret,
                filter,
                transmitter,
                pending: Mutex::new(StrandBatcher::new()),
                outbox: Mutex::new(PullOutbox::default()),
                backfilling: AtomicBool::new(backfilling),
                overflowed: AtomicBool::new(false),
                retry: Mutex::new(PushRetry::default()),
            }),
        );
        Subscription {
            listener_id: id,
            token: SubscriptionToken {
                listener_id: id,
                secret,
            },
        }
    }

    /// Remove the listener `token` controls. Undelivered strands are dropped.
    ///
    /// Dropping strands a push listener never received holds the view
    /// checkpoint until [`release_view_hold`](Self::release_view_hold).
    ///
    /// Returns false if it was already gone.
    pub fn unregister(&self, token: SubscriptionToken) -> bool {
        let Some((_, listener)) = self
            .inner
            .listeners
            .remove_if(&token.listener_id, |_, listener| listener.secret == token.secret)
        else {
            return false;
        };
        if matches!(listener.transmitter, Transmitter::Push(_)) && listener.has_work() {
            self.inner.view_held.store(true, Ordering::Release);
            tracing::warn!(listener = %listener.id, "push listener removed with undelivered strands, holding view checkpoint");
        }
        tracing::debug!(listener = %token.listener_id, "unregistered listener");
        true
    }

    /// Let the view checkpoint advance again. Call once everything after it
    /// has been re-notified.
    pub fn release_view_hold(&self) {
        if self.inner.view_held.swap(false, Ordering::AcqRel) {
            tracing::debug!("view checkpoint hold released");
        }
    }

    /// Snapshot of every registration.
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.inner
            .listeners
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Snapshot of the pull responders.
    pub fn list(&self) -> Vec<ListenerInfo> {
        self.listeners()
            .into_iter()
            .filter(|info| info.kind == TransmitterKind::PullResponder)
            .collect()
    }

    /// Queue committed strands for every listener whose filter matches.
    ///
    /// `checkpoint` is the position of the last committed operation; the
    /// view checkpoint moves there once push listeners have the strands.
    pub fn notify(&self, strands: &[Strand], source: &JobSource, checkpoint: Option<Checkpoint>) {
        if *self.inner.shutdown.borrow() {
            tracing::debug!("emitter shut down, ignoring notification");
            return;
        }
        for entry in self.inner.listeners.iter() {
            let listener = entry.value();
            let matching = strands
                .iter()
                .filter(|strand| listener.filter.matches(strand, source.remote()))
                .cloned();
            listener.enqueue(matching, self.inner.max_pending);
        }
        if let Some(checkpoint) = checkpoint {
            self.inner.stash_checkpoint(checkpoint);
        }
        self.inner.wake.notify_one();
    }

    /// Deliver everything pending now, without waiting for the debounce
    /// window or a failing listener's backoff.
    pub async fn flush(&self) {
        if self.inner.deliver(true).await.is_some() {
            // The scheduler owns retries.
            self.inner.wake.notify_one();
        }
    }

    /// Strands delivered to a pull responder after `since`.
    ///
    /// `limit` is capped at the configured maximum; 0 means the maximum.
    pub fn pull(&self, listener_id: &ListenerId, since: Cursor, limit: u32) -> Result<PullPage, EmitterError> {
        let listener = self.inner.listener(listener_id)?;
        if !matches!(listener.transmitter, Transmitter::PullResponder) {
            return Err(EmitterError::NotPullResponder(*listener_id));
        }
        let limit = match limit as usize {
            0 => self.inner.max_pull_batch,
            n => n.min(self.inner.max_pull_batch),
        };
        let page = lock(&listener.outbox).page(since, limit);
        Ok(page)
    }

    /// Drop strands a remote confirmed up to `cursor`.
    pub fn acknowledge(&self, listener_id: &ListenerId, cursor: Cursor) -> Result<Cursor, EmitterError> {
        let listener = self.inner.listener(listener_id)?;
        if !matches!(listener.transmitter, Transmitter::PullResponder) {
            return Err(EmitterError::NotPullResponder(*listener_id));
        }
        let trimmed = lock(&listener.outbox).acknowledge(cursor);
        Ok(trimmed)
    }

    /// Flush, then stop the scheduler and wait for it to exit.
    ///
    /// Later notifications are ignored.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let handle = lock(&self.inner.scheduler).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "event scheduler panicked");
            }
        }
        self.inner.deliver(true).await;
        tracing::info!("event emitter stopped");
    }
}

async fn run_scheduler(
    inner: Weak<Inner>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    debounce: Duration,
) {
    let mut retry_in: Option<Duration> = None;
    loop {
        match retry_in {
            Some(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wake.notified() => {}
                _ = shutdown.changed() => break,
            },
            None => tokio::select! {
                _ = wake.notified() => {}
                _ = shutdown.changed() => break,
            },
        }
        tokio::select! {
            _ = tokio::time::sleep(debounce) => {}
            _ = shutdown.changed() => break,
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        retry_in = inner.deliver(false).await;
    }
}

/// Committed strands after ordinal `after` that match `filter`.
async fn read_history(
    storage: &dyn OperationStore,
    filter: &ListenerFilter,
    mut after: u64,
) -> Result<StrandBatcher, EmitterError> {
    let mut history = StrandBatcher::new();
    loop {
        let page = storage.operations_since(after, BACKFILL_PAGE).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = last.ordinal;
        for committed in &page {
            let strand = committed.to_strand();
            if filter.matches(&strand, committed.operation.source_remote.as_deref()) {
                history.push(strand);
            }
        }
    }
    Ok(history)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use reactor_core::Document;
    use reactor_types::{Action, DocumentId, DriveId, Operation, DEFAULT_BRANCH};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<Strand>>>,
        fail: AtomicBool,
        attempts: std::sync::atomic::AtomicUsize,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Vec<Strand>> {
            lock(&self.calls).clone()
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StrandHandler for Recorder {
        async fn on_strands(&self, strands: Vec<Strand>) -> Result<(), EmitterError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmitterError::Delivery("handler down".into()));
            }
            lock(&self.calls).push(strands);
            Ok(())
        }
    }

    fn op(index: u64) -> Operation {
        let action = Action::new("INC", "global", json!({ "by": 1 }));
        Operation::from_action(&action, index, DEFAULT_BRANCH)
    }

    fn strand(doc: &str, indices: &[u64]) -> Strand {
        Strand {
            drive_id: DriveId::from("drive"),
            document_id: DocumentId::from(doc),
            document_type: "test/counter".into(),
            scope: "global".into(),
            branch: DEFAULT_BRANCH.into(),
            operations: indices.iter().map(|i| op(*i)).collect(),
        }
    }

    fn emitter(storage: Option<Arc<dyn OperationStore>>) -> EventEmitter {
        EventEmitter::new(&EventsConfig::default(), storage, Arc::default())
    }

    fn push_listener(emitter: &EventEmitter, filter: ListenerFilter) -> (Arc<Recorder>, Subscription) {
        let recorder = Arc::new(Recorder::default());
        let subscription = emitter.register(filter, Transmitter::Push(recorder.clone()));
        (recorder, subscription)
    }

    // ===== Debounce =====

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_into_one_delivery() {
        let emitter = emitter(None);
        let (recorder, _sub) = push_listener(&emitter, ListenerFilter::default());

        for i in 0..3 {
            emitter.notify(&[strand("doc", &[i])], &JobSource::Local, None);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recorder.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        let indices: Vec<u64> = calls[0][0].operations.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_delivers_immediately() {
        let emitter = emitter(None);
        let (recorder, _sub) = push_listener(&emitter, ListenerFilter::default());

        emitter.notify(&[strand("a", &[0]), strand("b", &[0])], &JobSource::Local, None);
        emitter.flush().await;

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        let docs: Vec<&str> = calls[0].iter().map(|s| s.document_id.as_str()).collect();
        assert_eq!(docs, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_push_is_retried_in_order() {
        let emitter = emitter(None);
        let (recorder, _sub) = push_listener(&emitter, ListenerFilter::default());
        recorder.fail.store(true, Ordering::SeqCst);

        emitter.notify(&[strand("doc", &[0])], &JobSource::Local, None);
        emitter.flush().await;
        emitter.notify(&[strand("doc", &[1])], &JobSource::Local, None);

        recorder.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].operations.len(), 2);
        assert_eq!(calls[0][0].first_index(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_push_listener_backs_off() {
        let emitter = emitter(None);
        let (recorder, _sub) = push_listener(&emitter, ListenerFilter::default());
        recorder.fail.store(true, Ordering::SeqCst);

        emitter.notify(&[strand("doc", &[0])], &JobSource::Local, None);
        tokio::time::sleep(Duration::from_secs(10)).await;

        // One attempt per debounce window would be 40.
        let attempts = recorder.attempts();
        assert!((2..=6).contains(&attempts), "{attempts} attempts");
        assert_eq!(emitter.listeners()[0].pending, 1);

        recorder.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(recorder.calls().len(), 1);
    }

    #[tokio::test]
    async fn overflowed_listener_is_replayed_from_the_log() {
        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let doc = storage
            .create_document(&Document::new(
                DocumentId::from("doc"),
                DriveId::from("drive"),
                "test/counter",
                1,
            ))
            .await
            .unwrap();
        let committed = storage.append_batch(&doc, &[op(0), op(1)]).await.unwrap();
        let checkpoint = Checkpoint::at(committed.last().unwrap());

        let config = EventsConfig {
            max_pending: 1,
            ..EventsConfig::default()
        };
        let emitter = EventEmitter::new(&config, Some(storage.clone()), Arc::default());
        let (recorder, _sub) = push_listener(&emitter, ListenerFilter::default());
        recorder.fail.store(true, Ordering::SeqCst);

        emitter.notify(&[strand("doc", &[0])], &JobSource::Local, None);
        emitter.notify(&[strand("other", &[0])], &JobSource::Local, Some(checkpoint));
        assert_eq!(emitter.listeners()[0].pending, 0);

        emitter.flush().await;
        assert_eq!(storage.read_view_state().await.unwrap(), Checkpoint::default());

        recorder.fail.store(false, Ordering::SeqCst);
        emitter.flush().await;
        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        let indices: Vec<u64> = calls[0][0].operations.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(storage.read_view_state().await.unwrap(), checkpoint);
    }

    // ===== Filters and registry =====

    #[tokio::test]
    async fn filters_select_strands() {
        let emitter = emitter(None);
        let (only_a, _a) = push_listener(
            &emitter,
            ListenerFilter {
                document_ids: vec![DocumentId::from("a")],
                ..ListenerFilter::default()
            },
        );
        let (no_echo, _b) = push_listener(&emitter, ListenerFilter::default().excluding_remote("peer"));

        emitter.notify(&[strand("a", &[0]), strand("b", &[0])], &JobSource::Local, None);
        emitter.notify(&[strand("b", &[1])], &JobSource::Remote("peer".into()), None);
        emitter.flush().await;

        assert_eq!(only_a.calls()[0].len(), 1);
        let echo_free = &no_echo.calls()[0];
        assert_eq!(echo_free.len(), 2);
        assert_eq!(echo_free[1].operations.len(), 1);
    }

    #[tokio::test]
    async fn unregister_requires_token() {
        let emitter = emitter(None);
        let (_recorder, subscription) = push_listener(&emitter, ListenerFilter::default());
        assert_eq!(emitter.listeners().len(), 1);

        let forged = SubscriptionToken {
            listener_id: subscription.listener_id,
            secret: uuid::Uuid::new_v4(),
        };
        assert!(!emitter.unregister(forged));
        assert!(emitter.unregister(subscription.token));
        assert!(emitter.listeners().is_empty());
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = SubscriptionToken {
            listener_id: ListenerId::new(),
            secret: uuid::Uuid::new_v4(),
        };
        let debug = format!("{:?}", token);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&token.secret.to_string()));
    }

    // ===== Pull responders =====

    #[tokio::test]
    async fn pull_and_acknowledge() {
        let emitter = emitter(None);
        let sub = emitter
            .register_pull_responder(ListenerFilter::default(), false)
            .await
            .unwrap();
        assert_eq!(emitter.list().len(), 1);

        emitter.notify(&[strand("a", &[0]), strand("b", &[0])], &JobSource::Local, None);
        emitter.flush().await;

        let page = emitter.pull(&sub.listener_id, Cursor::zero(), 1).unwrap();
        assert_eq!(page.strands.len(), 1);
        assert!(page.has_more);

        emitter.acknowledge(&sub.listener_id, page.next_cursor).unwrap();
        let rest = emitter.pull(&sub.listener_id, Cursor::zero(), 0).unwrap();
        assert_eq!(rest.strands.len(), 1);
        assert_eq!(rest.strands[0].document_id, DocumentId::from("b"));
    }

    #[tokio::test]
    async fn pull_rejects_push_listeners_and_unknown_ids() {
        let emitter = emitter(None);
        let (_recorder, sub) = push_listener(&emitter, ListenerFilter::default());

        assert!(matches!(
            emitter.pull(&sub.listener_id, Cursor::zero(), 10),
            Err(EmitterError::NotPullResponder(_))
        ));
        assert!(matches!(
            emitter.pull(&ListenerId::new(), Cursor::zero(), 10),
            Err(EmitterError::UnknownListener(_))
        ));
    }

    #[tokio::test]
    async fn backfill_installs_history_before_live_strands() {
        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let doc = storage
            .create_document(&Document::new(
                DocumentId::from("doc"),
                DriveId::from("drive"),
                "test/counter",
                1,
            ))
            .await
            .unwrap();
        storage.append_batch(&doc, &[op(0), op(1)]).await.unwrap();

        let emitter = emitter(Some(storage));
        let sub = emitter
            .register_pull_responder(ListenerFilter::for_drive(DriveId::from("drive")), true)
            .await
            .unwrap();

        // Overlaps the history at index 1.
        emitter.notify(&[strand("doc", &[1, 2])], &JobSource::Local, None);
        emitter.flush().await;

        let page = emitter.pull(&sub.listener_id, Cursor::zero(), 10).unwrap();
        assert_eq!(page.strands.len(), 1);
        let indices: Vec<u64> = page.strands[0].operations.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    // ===== Checkpoints and shutdown =====

    #[tokio::test]
    async fn view_checkpoint_waits_for_push_delivery() {
        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let emitter = emitter(Some(storage.clone()));
        let (recorder, _sub) = push_listener(&emitter, ListenerFilter::default());
        let checkpoint = Checkpoint {
            last_ordinal: 7,
            last_timestamp_utc_ms: 70,
        };

        recorder.fail.store(true, Ordering::SeqCst);
        emitter.notify(&[strand("doc", &[0])], &JobSource::Local, Some(checkpoint));
        emitter.flush().await;
        assert_eq!(storage.read_view_state().await.unwrap(), Checkpoint::default());

        recorder.fail.store(false, Ordering::SeqCst);
        emitter.flush().await;
        assert_eq!(storage.read_view_state().await.unwrap(), checkpoint);
    }

    #[tokio::test]
    async fn removing_a_behind_listener_holds_the_view_checkpoint() {
        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let emitter = emitter(Some(storage.clone()));
        let (recorder, sub) = push_listener(&emitter, ListenerFilter::default());
        let checkpoint = Checkpoint {
            last_ordinal: 3,
            last_timestamp_utc_ms: 30,
        };

        recorder.fail.store(true, Ordering::SeqCst);
        emitter.notify(&[strand("doc", &[0])], &JobSource::Local, Some(checkpoint));
        emitter.flush().await;
        assert!(emitter.unregister(sub.token));

        // Nobody left to deliver to, but the strand was never pushed.
        emitter.flush().await;
        assert_eq!(storage.read_view_state().await.unwrap(), Checkpoint::default());

        emitter.release_view_hold();
        emitter.flush().await;
        assert_eq!(storage.read_view_state().await.unwrap(), checkpoint);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_ignores_later_notifications() {
        let emitter = emitter(None);
        let (recorder, _sub) = push_listener(&emitter, ListenerFilter::default());

        emitter.notify(&[strand("doc", &[0])], &JobSource::Local, None);
        emitter.shutdown().await;
        assert_eq!(recorder.calls().len(), 1);

        emitter.notify(&[strand("doc", &[1])], &JobSource::Local, None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        emitter.flush().await;
        assert_eq!(recorder.calls().len(), 1);
    }
}
