//! Job processor: the only writer of the operation log.
//!
//! Jobs are queued per `(drive, document)` key. A dispatcher task hands
//! ready jobs to workers, bounded by a semaphore; a key is never handed out
//! again while a job for it is running. Each worker drives the pure
//! [`KeyState`] machine from `reactor-core` and performs the I/O its
//! directives ask for.

use crate::config::ProcessorConfig;
use crate::error::{ReactorError, Result};
use crate::events::EventEmitter;
use crate::reactor::ReactorMetrics;
use crate::storage::{Checkpoint, CommittedOperation, OperationStore};
use reactor_core::{
    reconcile, Directive, Document, DocumentModelModule, DocumentModelResolver, Event, FailReason,
    Job, JobKey, JobKind, KeyState, KeyedQueue, ReconcileError, RegistryError,
    RetryPolicy, RevisionMap, Signer, StrandBatcher, Verdict, Verifier,
};
use reactor_types::{Action, DocumentId, JobId, Operation, Strand, SyncUnit};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tokio::task::JoinHandle;

/// Everything a job needs, passed in at construction.
#[derive(Clone)]
pub struct ProcessorContext {
    /// Operation log
    pub storage: Arc<dyn OperationStore>,
    /// Document models
    pub resolver: Arc<dyn DocumentModelResolver>,
    /// Signs local actions
    pub signer: Arc<dyn Signer>,
    /// Verifies remote operations; `None` accepts them unchecked
    pub verifier: Option<Arc<dyn Verifier>>,
    /// Told about every commit
    pub emitter: EventEmitter,
    /// Counters
    pub metrics: Arc<ReactorMetrics>,
}

impl fmt::Debug for ProcessorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("verifier", &self.verifier.is_some())
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}

/// What a committed job did.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    /// The job
    pub job_id: JobId,
    /// Document after the job
    pub document: Document,
    /// Appended operations, one strand per log
    pub strands: Vec<Strand>,
    /// Incoming operations already present
    pub skipped: usize,
    /// Incoming operations moved to the head of their log
    pub rebased: usize,
    /// Ordinal of the last appended operation
    pub last_ordinal: Option<u64>,
}

impl JobOutcome {
    /// Number of appended operations.
    pub fn appended(&self) -> usize {
        self.strands.iter().map(|s| s.operations.len()).sum()
    }
}

/// Completion of a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    rx: oneshot::Receiver<Result<JobOutcome>>,
}

impl JobHandle {
    /// The submitted job.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the job to commit or fail.
    pub async fn wait(self) -> Result<JobOutcome> {
        self.rx.await.unwrap_or(Err(ReactorError::Aborted))
    }
}

struct Pending {
    job: Job,
    reply: oneshot::Sender<Result<JobOutcome>>,
}

struct Inner {
    ctx: ProcessorContext,
    policy: RetryPolicy,
    workers: usize,
    queue: Mutex<KeyedQueue<JobKey, Pending>>,
    ready: Notify,
    shutdown: watch::Sender<bool>,
    permits: Arc<Semaphore>,
}

/// Worker pool executing jobs.
pub struct JobProcessor {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProcessor")
            .field("workers", &self.inner.workers)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl JobProcessor {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn new(config: &ProcessorConfig, ctx: ProcessorContext) -> Self {
        let workers = config.workers.max(1);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            ctx,
            policy: config.retry_policy(),
            workers,
            queue: Mutex::new(KeyedQueue::new(config.queue_capacity)),
            ready: Notify::new(),
            shutdown,
            permits: Arc::new(Semaphore::new(workers)),
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&inner)));
        tracing::info!(workers, "job processor started");

        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Queue a job behind earlier jobs for the same document.
    ///
    /// # Errors
    ///
    /// [`ReactorError::Queue`] when the queue is full, [`ReactorError::Aborted`]
    /// after shutdown.
    pub fn submit(&self, job: Job) -> Result<JobHandle> {
        let (reply, rx) = oneshot::channel();
        let job_id = job.id();
        {
            let mut queue = lock(&self.inner.queue);
            if *self.inner.shutdown.borrow() {
                return Err(ReactorError::Aborted);
            }
            tracing::debug!(job = %job_id, key = %job.key(), kind = job.kind().name(), "job submitted");
            queue.enqueue(job.key().clone(), Pending { job, reply })?;
        }
        self.inner.ready.notify_one();
        Ok(JobHandle { job_id, rx })
    }

    /// Jobs waiting to run.
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Fail every queued job with [`ReactorError::Aborted`] and wait for
    /// running jobs to finish. Jobs waiting to retry are aborted.
    pub async fn shutdown(&self) {
        let aborted = {
            let mut queue = lock(&self.inner.queue);
            if self.inner.shutdown.send_replace(true) {
                return;
            }
            queue.drain()
        };
        let count = aborted.len();
        for pending in aborted {
            let _ = pending.reply.send(Err(ReactorError::Aborted));
        }

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::error!(error = %e, "job dispatcher panicked");
            }
        }
        // Every permit back means no worker is running.
        match self.inner.permits.acquire_many(self.inner.workers as u32).await {
            Ok(permits) => drop(permits),
            Err(e) => tracing::error!(error = %e, "worker semaphore closed"),
        }
        tracing::info!(aborted = count, "job processor stopped");
    }
}

impl Drop for JobProcessor {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

async fn dispatch(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = stopped(&mut shutdown) => break,
        };

        let next = loop {
            if *shutdown.borrow() {
                break None;
            }
            let ready = lock(&inner.queue).next_ready();
            if ready.is_some() {
                break ready;
            }
            tokio::select! {
                _ = inner.ready.notified() => {}
                _ = stopped(&mut shutdown) => {}
            }
        };
        let Some((key, Pending { job, reply })) = next else {
            break;
        };

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            let _permit = permit;
            let result = worker.run(&job).await;
            match &result {
                Ok(outcome) => {
                    worker.ctx.metrics.jobs_committed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(job = %job.id(), key = %key, appended = outcome.appended(), "job committed");
                }
                Err(ReactorError::Aborted) => {
                    tracing::debug!(job = %job.id(), key = %key, "job aborted");
                }
                Err(e) => {
                    worker.ctx.metrics.jobs_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(job = %job.id(), key = %key, error = %e, "job failed");
                }
            }
            let _ = reply.send(result);
            lock(&worker.queue).complete(&key);
            worker.ready.notify_one();
        });
    }
}

/// Resolves once shutdown has been signalled.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl Inner {
    async fn run(&self, job: &Job) -> Result<JobOutcome> {
        let mut shutdown = self.shutdown.subscribe();
        let mut state = KeyState::Idle;
        let mut event = Event::Dequeued;
        let mut outcome = None;
        let mut last_error = None;

        loop {
            let (next, directives) = state.on_event(event, &self.policy);
            state = next;
            let Some(directive) = directives.into_iter().next() else {
                return Err(last_error.unwrap_or_else(|| {
                    ReactorError::Internal(format!("job {} stalled in {:?}", job.id(), state))
                }));
            };

            event = match directive {
                Directive::Execute => match self.execute(job).await {
                    Ok(done) => {
                        outcome = Some(done);
                        Event::Committed
                    }
                    Err(e) if e.is_conflict() => {
                        tracing::debug!(job = %job.id(), error = %e, "log moved under job, re-executing");
                        last_error = Some(e);
                        Event::Conflict
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!(job = %job.id(), error = %e, "transient failure");
                        last_error = Some(e);
                        Event::TransientFailure
                    }
                    Err(e) => {
                        last_error = Some(e);
                        Event::FatalFailure
                    }
                },
                Directive::ScheduleRetry { delay } => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Event::RetryTimer,
                        _ = stopped(&mut shutdown) => Event::Aborted,
                    }
                }
                Directive::Complete => {
                    return outcome.ok_or_else(|| {
                        ReactorError::Internal(format!("job {} completed without outcome", job.id()))
                    });
                }
                Directive::Fail(FailReason::Aborted) => return Err(ReactorError::Aborted),
                Directive::Fail(reason) => {
                    tracing::debug!(job = %job.id(), ?reason, "job gave up");
                    return Err(last_error.unwrap_or_else(|| {
                        ReactorError::Internal(format!("job {} failed: {:?}", job.id(), reason))
                    }));
                }
            };
        }
    }

    /// One attempt: read fresh state, compute, append.
    async fn execute(&self, job: &Job) -> Result<JobOutcome> {
        match job.kind() {
            JobKind::Action { branch, actions } => self.execute_actions(job, branch, actions).await,
            JobKind::Operation {
                scope,
                branch,
                operations,
            } => self.execute_operations(job, scope, branch, operations).await,
            JobKind::Document {
                document_type,
                initial_state,
                operations,
            } => {
                self.execute_document(job, document_type, initial_state, operations)
                    .await
            }
        }
    }

    async fn execute_actions(&self, job: &Job, branch: &str, actions: &[Action]) -> Result<JobOutcome> {
        let ctx = &self.ctx;
        let mut document = self.load_document(job).await?;
        let module = self.module(&document.document_type)?;

        let mut revisions = RevisionMap::new();
        let mut loaded = HashSet::new();
        let mut operations = Vec::new();

        for action in actions {
            module.validate(action)?;
            if document.version < module.version() {
                document = ctx.resolver.upgrade_document(&document, action)?;
            }

            let mut action = action.clone();
            if action.signature.is_none() {
                let signature = ctx.signer.sign(&action, &document.state_hash(&action.scope))?;
                if !signature.is_empty() {
                    action.signature = Some(signature);
                }
            }

            let reduction = module.reduce(&document, &action)?;
            document.state.extend(reduction.state);

            for (n, draft) in reduction.operations.into_iter().enumerate() {
                let unit = SyncUnit::new(document.id.clone(), draft.scope.clone(), branch);
                if loaded.insert(unit.clone()) {
                    let head = ctx
                        .storage
                        .current_revision(&document.id, &draft.scope, branch)
                        .await?;
                    revisions.load(unit.clone(), head);
                }
                let index = revisions.assign(&unit);

                // Further operations of the same action need their own id.
                let recorded = Action {
                    id: if n == 0 { action.id } else { uuid::Uuid::new_v4() },
                    action_type: draft.action_type,
                    scope: draft.scope,
                    input: draft.input,
                    timestamp_utc_ms: action.timestamp_utc_ms,
                    signature: action.signature.clone(),
                };
                let mut operation = Operation::from_action(&recorded, index, branch);
                operation.resulting_state = Some(document.scope_state(&operation.scope).clone());
                operations.push(operation);
            }
        }

        self.commit(job, document, &operations, 0, 0).await
    }

    async fn execute_operations(
        &self,
        job: &Job,
        scope: &str,
        branch: &str,
        incoming: &[Operation],
    ) -> Result<JobOutcome> {
        let mut document = self.load_document(job).await?;
        let module = self.ctx.resolver.lookup(&document.document_type);

        let placed = self
            .place(job, &mut document, module.as_deref(), scope, branch, incoming)
            .await?;
        self.commit(job, document, &placed.append, placed.skipped, placed.rebased)
            .await
    }

    async fn execute_document(
        &self,
        job: &Job,
        document_type: &str,
        initial_state: &BTreeMap<String, Value>,
        incoming: &[Operation],
    ) -> Result<JobOutcome> {
        let ctx = &self.ctx;
        let module = ctx.resolver.lookup(document_type);

        let mut requested = Document::new(
            job.document_id().clone(),
            job.drive_id().clone(),
            document_type,
            module.as_ref().map_or(0, |m| m.version()),
        );
        requested.state = if initial_state.is_empty() {
            module
                .as_ref()
                .map(|m| m.initial_state().clone())
                .unwrap_or_default()
        } else {
            initial_state.clone()
        };

        // The header is only written once every operation has been placed.
        let stored = ctx.storage.get_document(job.document_id()).await?;
        let fresh = stored.is_none();
        let mut document = match stored {
            Some(stored) if stored.document_type != document_type => {
                return Err(ReactorError::DocumentTypeMismatch {
                    document_id: stored.id,
                    expected: document_type.to_string(),
                    actual: stored.document_type,
                });
            }
            Some(stored) => stored,
            None => requested.clone(),
        };

        // Logs in the order they first appear.
        let mut logs: Vec<(String, String)> = Vec::new();
        for op in incoming {
            let log = (op.scope.clone(), op.branch.clone());
            if !logs.contains(&log) {
                logs.push(log);
            }
        }

        let mut append = Vec::new();
        let (mut skipped, mut rebased) = (0, 0);
        for (scope, branch) in logs {
            let ops: Vec<Operation> = incoming
                .iter()
                .filter(|op| op.scope == scope && op.branch == branch)
                .cloned()
                .collect();
            let placed = self
                .place(job, &mut document, module.as_deref(), &scope, &branch, &ops)
                .await?;
            append.extend(placed.append);
            skipped += placed.skipped;
            rebased += placed.rebased;
        }

        if !fresh {
            return self.commit(job, document, &append, skipped, rebased).await;
        }
        ctx.storage.create_document(&requested).await?;
        match self.commit(job, document, &append, skipped, rebased).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.discard(&requested.id).await;
                Err(e)
            }
        }
    }

    /// Remove a header this job created but could not fill.
    async fn discard(&self, document_id: &DocumentId) {
        if let Err(e) = self.ctx.storage.delete_document(document_id).await {
            tracing::warn!(document = %document_id, error = %e, "failed to remove unfinished document");
        }
    }

    /// Verify and reconcile incoming operations of one log, and apply the
    /// state of those that will be appended to `document`.
    async fn place(
        &self,
        job: &Job,
        document: &mut Document,
        module: Option<&DocumentModelModule>,
        scope: &str,
        branch: &str,
        incoming: &[Operation],
    ) -> Result<reactor_core::Reconciliation> {
        let ctx = &self.ctx;
        let source = job.source();

        if let (Some(remote), Some(verifier)) = (source.remote(), &ctx.verifier) {
            for op in incoming {
                let signature = op.signature.clone().unwrap_or_default();
                if let Verdict::Invalid(reason) = verifier.verify(op, &signature) {
                    tracing::warn!(remote, document = %document.id, index = op.index, %reason, "rejecting operation");
                    return Err(ReactorError::SignatureInvalid {
                        document_id: document.id.clone(),
                        index: op.index,
                        reason,
                    });
                }
            }
        }

        let from = incoming.first().map_or(0, |op| op.index);
        let existing = ctx
            .storage
            .read_operations(&document.id, scope, branch, from)
            .await?;
        let head = ctx.storage.current_revision(&document.id, scope, branch).await?;

        let mut placed = reconcile(head, &existing, incoming).map_err(|e| match e {
            ReconcileError::MissingOperations { expected, found } => ReactorError::MissingOperations {
                document_id: document.id.clone(),
                scope: scope.to_string(),
                branch: branch.to_string(),
                expected,
                found,
            },
        })?;

        for op in &mut placed.append {
            match &op.resulting_state {
                Some(state) => {
                    document.state.insert(op.scope.clone(), state.clone());
                }
                None => {
                    let module = module.ok_or_else(|| RegistryError::ModuleNotFound {
                        document_type: document.document_type.clone(),
                        version: None,
                    })?;
                    let reduction = module.reduce(document, &op.to_action())?;
                    document.state.extend(reduction.state);
                    op.resulting_state = Some(document.scope_state(&op.scope).clone());
                }
            }
            if let Some(remote) = source.remote() {
                op.source_remote = Some(remote.to_string());
            }
        }

        if placed.rebased > 0 {
            tracing::debug!(document = %document.id, scope, branch, rebased = placed.rebased, "rebased operations to head");
        }
        Ok(placed)
    }

    async fn commit(
        &self,
        job: &Job,
        document: Document,
        operations: &[Operation],
        skipped: usize,
        rebased: usize,
    ) -> Result<JobOutcome> {
        let ctx = &self.ctx;
        let committed = if operations.is_empty() {
            Vec::new()
        } else {
            ctx.storage.append_batch(&document, operations).await?
        };

        let mut batcher = StrandBatcher::new();
        batcher.extend(committed.iter().map(CommittedOperation::to_strand));
        let strands = batcher.drain();
        let last = committed.last().map(Checkpoint::at);

        if !committed.is_empty() {
            ctx.metrics
                .operations_appended
                .fetch_add(committed.len() as u64, Ordering::Relaxed);
            ctx.emitter.notify(&strands, job.source(), last);
        }

        Ok(JobOutcome {
            job_id: job.id(),
            document,
            strands,
            skipped,
            rebased,
            last_ordinal: last.map(|c| c.last_ordinal),
        })
    }

    async fn load_document(&self, job: &Job) -> Result<Document> {
        self.ctx
            .storage
            .get_document(job.document_id())
            .await?
            .ok_or_else(|| ReactorError::DocumentNotFound(job.document_id().clone()))
    }

    fn module(&self, document_type: &str) -> Result<Arc<DocumentModelModule>> {
        self.ctx.resolver.lookup(document_type).ok_or_else(|| {
            ReactorError::Registry(RegistryError::ModuleNotFound {
                document_type: document_type.to_string(),
                version: None,
            })
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
