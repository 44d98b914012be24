//! The reactor: storage, processor and emitter wired together.
//!
//! Every collaborator is handed in through [`ReactorBuilder`]; nothing is
//! looked up from globals.

use crate::config::{Config, SigningConfig};
use crate::error::Result;
use crate::events::EventEmitter;
use crate::processor::{JobHandle, JobOutcome, JobProcessor, ProcessorContext};
use crate::storage::{self, Checkpoint, CommittedOperation, OperationStore};
use reactor_core::{
    DocumentModelResolver, Ed25519Signer, Ed25519Verifier, Job, JobSource, NullResolver,
    PassthroughSigner, Signer, StrandBatcher, Verifier,
};
use reactor_types::Strand;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Page size when reading the log back at startup.
const RECOVERY_PAGE: u32 = 500;

/// Operational metrics for monitoring reactor activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ReactorMetrics {
    /// Jobs that committed.
    pub jobs_committed: AtomicU64,
    /// Jobs that failed, not counting aborts.
    pub jobs_failed: AtomicU64,
    /// Operations appended to the log.
    pub operations_appended: AtomicU64,
    /// Strands handed to listeners.
    pub strands_delivered: AtomicU64,
    /// Sync requests served.
    pub sync_requests: AtomicU64,
}

/// Builds a [`Reactor`].
///
/// Anything not supplied is derived from the [`Config`].
pub struct ReactorBuilder {
    config: Config,
    storage: Option<Arc<dyn OperationStore>>,
    resolver: Option<Arc<dyn DocumentModelResolver>>,
    signer: Option<Arc<dyn Signer>>,
    verifier: Option<Option<Arc<dyn Verifier>>>,
}

impl fmt::Debug for ReactorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorBuilder")
            .field("config", &self.config)
            .field("storage", &self.storage.is_some())
            .field("resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

impl ReactorBuilder {
    /// Start from a configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            storage: None,
            resolver: None,
            signer: None,
            verifier: None,
        }
    }

    /// Use this store instead of opening `[storage]`.
    pub fn storage(mut self, storage: Arc<dyn OperationStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Document models. Defaults to [`NullResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn DocumentModelResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Signer for local actions, instead of `[signing].key_path`.
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Verifier for remote operations; `None` disables verification.
    pub fn verifier(mut self, verifier: Option<Arc<dyn Verifier>>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Open storage, catch the revision index up with the log and start
    /// the processor and emitter. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Storage, migration and signing key errors.
    pub async fn build(self) -> Result<Reactor> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => storage::open(&self.config.storage).await?,
        };
        let signer = match self.signer {
            Some(signer) => signer,
            None => signer_from_config(&self.config.signing)?,
        };
        let verifier = match self.verifier {
            Some(verifier) => verifier,
            None => verifier_from_config(&self.config.signing),
        };
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(NullResolver));

        let indexer = storage.read_indexer_state().await?;
        let reindexed = storage.reindex_since(indexer.last_ordinal).await?;
        if reindexed > 0 {
            tracing::info!(reindexed, after = indexer.last_ordinal, "revision index caught up");
        }

        let metrics = Arc::new(ReactorMetrics::default());
        let emitter = EventEmitter::new(&self.config.events, Some(Arc::clone(&storage)), Arc::clone(&metrics));
        let processor = JobProcessor::new(
            &self.config.processor,
            ProcessorContext {
                storage: Arc::clone(&storage),
                resolver: Arc::clone(&resolver),
                signer,
                verifier,
                emitter: emitter.clone(),
                metrics: Arc::clone(&metrics),
            },
        );

        tracing::info!(backend = ?self.config.storage.backend, "reactor started");
        Ok(Reactor {
            config: self.config,
            storage,
            resolver,
            emitter,
            processor,
            metrics,
        })
    }
}

fn signer_from_config(config: &SigningConfig) -> Result<Arc<dyn Signer>> {
    let Some(path) = &config.key_path else {
        return Ok(Arc::new(PassthroughSigner));
    };
    let secret = std::fs::read_to_string(path)?;
    let signer = Ed25519Signer::from_secret_hex(secret.trim())?;
    tracing::info!(signer = signer.identity(), "signing local actions");
    Ok(Arc::new(signer))
}

fn verifier_from_config(config: &SigningConfig) -> Option<Arc<dyn Verifier>> {
    if !config.verify_remote {
        return None;
    }
    let verifier = Ed25519Verifier::new()
        .with_trusted(config.trusted_keys.iter().cloned())
        .allow_unsigned(config.allow_unsigned);
    Some(Arc::new(verifier))
}

/// A running reactor.
pub struct Reactor {
    config: Config,
    storage: Arc<dyn OperationStore>,
    resolver: Arc<dyn DocumentModelResolver>,
    emitter: EventEmitter,
    processor: JobProcessor,
    metrics: Arc<ReactorMetrics>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("config", &self.config)
            .field("emitter", &self.emitter)
            .field("processor", &self.processor)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Builder from a configuration.
    pub fn builder(config: Config) -> ReactorBuilder {
        ReactorBuilder::new(config)
    }

    /// Get the reactor configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &Arc<dyn OperationStore> {
        &self.storage
    }

    /// Document models in use.
    pub fn resolver(&self) -> &Arc<dyn DocumentModelResolver> {
        &self.resolver
    }

    /// Listener registry.
    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ReactorMetrics {
        &self.metrics
    }

    /// Jobs waiting to run.
    pub fn queued_jobs(&self) -> usize {
        self.processor.queued()
    }

    /// Queue a job.
    ///
    /// # Errors
    ///
    /// Queue full, or the reactor is shutting down.
    pub fn submit(&self, job: Job) -> Result<JobHandle> {
        self.processor.submit(job)
    }

    /// Queue a job and wait for its outcome.
    pub async fn execute(&self, job: Job) -> Result<JobOutcome> {
        self.submit(job)?.wait().await
    }

    /// Apply a strand received from `origin`.
    ///
    /// Creates the document first when it is unknown locally.
    pub async fn apply_strand(&self, strand: Strand, origin: &str) -> Result<JobOutcome> {
        let source = JobSource::Remote(origin.to_string());
        let exists = self.storage.get_document(&strand.document_id).await?.is_some();
        let job = if exists {
            Job::operations(
                strand.drive_id,
                strand.document_id,
                strand.scope,
                strand.branch,
                strand.operations,
                source,
            )?
        } else {
            Job::document(
                strand.drive_id,
                strand.document_id,
                strand.document_type,
                BTreeMap::new(),
                strand.operations,
                source,
            )?
        };
        self.execute(job).await
    }

    /// Re-notify listeners of operations committed after the view
    /// checkpoint, which a previous run may not have delivered.
    ///
    /// Call after listeners are registered. Returns the operations re-sent.
    pub async fn resume_delivery(&self) -> Result<u64> {
        let view = self.storage.read_view_state().await?;
        let mut after = view.last_ordinal;
        let mut resent = 0u64;

        loop {
            let page = self.storage.operations_since(after, RECOVERY_PAGE).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.ordinal;
            resent += page.len() as u64;

            // Keep each operation's origin so echo filters still apply.
            for run in page.chunk_by(|a, b| a.operation.source_remote == b.operation.source_remote) {
                let source = match &run[0].operation.source_remote {
                    Some(remote) => JobSource::Remote(remote.clone()),
                    None => JobSource::Local,
                };
                let mut batcher = StrandBatcher::new();
                batcher.extend(run.iter().map(CommittedOperation::to_strand));
                let checkpoint = run.last().map(Checkpoint::at);
                self.emitter.notify(&batcher.drain(), &source, checkpoint);
            }
        }

        self.emitter.release_view_hold();
        if resent > 0 {
            tracing::info!(resent, after = view.last_ordinal, "re-notified undelivered operations");
        }
        Ok(resent)
    }

    /// Stop accepting jobs, abort queued ones, wait for running ones and
    /// deliver what they committed.
    pub async fn shutdown(&self) {
        self.processor.shutdown().await;
        self.emitter.shutdown().await;
        tracing::info!("reactor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReactorError;
    use crate::events::{EmitterError, StrandHandler, Transmitter};
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use reactor_core::{DocumentModelModule, DocumentModelRegistry, ReducerError, Reduction};
    use reactor_types::{Action, DocumentId, DriveId, ListenerFilter, Operation, DEFAULT_BRANCH};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn registry() -> Arc<DocumentModelRegistry> {
        let registry = DocumentModelRegistry::new();
        registry
            .register(
                DocumentModelModule::new("test/counter", 1)
                    .with_reducer(|doc: &reactor_core::Document, action: &Action| {
                        let by = action.input["by"].as_i64().unwrap_or(0);
                        let count = doc.scope_state(&action.scope)["count"].as_i64().unwrap_or(0);
                        Ok::<_, ReducerError>(Reduction::record(action, json!({ "count": count + by })))
                    })
                    .with_validator(|_: &Action| Ok::<_, ReducerError>(()))
                    .with_initial_state("global", json!({ "count": 0 })),
            )
            .unwrap();
        Arc::new(registry)
    }

    async fn reactor_on(storage: Arc<dyn OperationStore>) -> Reactor {
        reactor_with(storage, Config::default()).await
    }

    async fn reactor_with(storage: Arc<dyn OperationStore>, config: Config) -> Reactor {
        Reactor::builder(config)
            .storage(storage)
            .resolver(registry())
            .build()
            .await
            .unwrap()
    }

    fn create(doc: &str) -> Job {
        Job::document(
            DriveId::from("drive"),
            DocumentId::from(doc),
            "test/counter",
            BTreeMap::new(),
            vec![],
            JobSource::Local,
        )
        .unwrap()
    }

    fn inc(doc: &str) -> Job {
        Job::actions(
            DriveId::from("drive"),
            DocumentId::from(doc),
            DEFAULT_BRANCH,
            vec![Action::new("INC", "global", json!({ "by": 1 }))],
        )
        .unwrap()
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Strand>>);

    #[async_trait]
    impl StrandHandler for Recorder {
        async fn on_strands(&self, strands: Vec<Strand>) -> std::result::Result<(), EmitterError> {
            self.0.lock().unwrap().extend(strands);
            Ok(())
        }
    }

    #[tokio::test]
    async fn builder_defaults_from_config() {
        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let reactor = reactor_on(storage).await;

        reactor.execute(create("doc")).await.unwrap();
        reactor.execute(inc("doc")).await.unwrap();

        assert_eq!(reactor.metrics().jobs_committed.load(Ordering::Relaxed), 2);
        assert_eq!(reactor.metrics().operations_appended.load(Ordering::Relaxed), 1);
        reactor.shutdown().await;
    }

    #[tokio::test]
    async fn missing_key_file_fails_build() {
        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let mut config = Config::default();
        config.signing.key_path = Some("/nonexistent/reactor.key".into());

        let err = Reactor::builder(config).storage(storage).build().await.unwrap_err();
        assert!(matches!(err, ReactorError::Io(_)));
    }

    #[tokio::test]
    async fn key_file_enables_signing() {
        let signer = Ed25519Signer::generate().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, signer.secret_hex().as_bytes()).unwrap();

        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let mut config = Config::default();
        config.signing.key_path = Some(file.path().to_path_buf());
        let reactor = Reactor::builder(config)
            .storage(Arc::clone(&storage))
            .resolver(registry())
            .build()
            .await
            .unwrap();

        reactor.execute(create("doc")).await.unwrap();
        let outcome = reactor.execute(inc("doc")).await.unwrap();
        let op = &outcome.strands[0].operations[0];
        assert_eq!(op.signature.as_ref().unwrap().signer(), signer.identity());
    }

    #[tokio::test]
    async fn apply_strand_creates_unknown_documents() {
        let storage: Arc<dyn OperationStore> = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let reactor = Reactor::builder(Config::default())
            .storage(storage)
            .resolver(registry())
            .verifier(None)
            .build()
            .await
            .unwrap();

        let mut op = Operation::from_action(&Action::new("INC", "global", json!({ "by": 2 })), 0, DEFAULT_BRANCH);
        op.resulting_state = Some(json!({ "count": 2 }));
        let strand = Strand {
            drive_id: DriveId::from("drive"),
            document_id: DocumentId::from("doc"),
            document_type: "test/counter".into(),
            scope: "global".into(),
            branch: DEFAULT_BRANCH.into(),
            operations: vec![op.clone()],
        };

        let first = reactor.apply_strand(strand.clone(), "peer").await.unwrap();
        assert_eq!(first.appended(), 1);
        assert_eq!(first.document.document_type, "test/counter");

        let again = reactor.apply_strand(strand, "peer").await.unwrap();
        assert_eq!(again.appended(), 0);
        assert_eq!(again.skipped, 1);
    }

    #[tokio::test]
    async fn restart_redelivers_past_view_checkpoint() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let storage: Arc<dyn OperationStore> =
            Arc::new(SqliteStorage::new(file.path(), 1).await.unwrap());
        storage
            .migrate(crate::storage::MigrationStrategy::Auto, crate::storage::MigrationMode::Operator)
            .await
            .unwrap();

        // First run stops before the debounce window ends, so the view
        // checkpoint is never written.
        {
            let mut config = Config::default();
            config.events.debounce_ms = 60_000;
            let reactor = reactor_with(Arc::clone(&storage), config).await;
            reactor.execute(create("doc")).await.unwrap();
            reactor.execute(inc("doc")).await.unwrap();
            reactor.execute(inc("doc")).await.unwrap();
            reactor.processor.shutdown().await;
        }
        assert_eq!(storage.read_view_state().await.unwrap().last_ordinal, 0);

        let reactor = reactor_on(Arc::clone(&storage)).await;
        let recorder = Arc::new(Recorder::default());
        let _sub = reactor.emitter().register(
            ListenerFilter::for_drive(DriveId::from("drive")),
            Transmitter::Push(recorder.clone()),
        );

        assert_eq!(reactor.resume_delivery().await.unwrap(), 2);
        reactor.emitter().flush().await;

        let delivered = recorder.0.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].first_index(), Some(0));
        assert_eq!(delivered[0].last_index(), Some(1));
        assert_eq!(storage.read_view_state().await.unwrap().last_ordinal, 2);

        // Nothing left after the checkpoint moved.
        assert_eq!(reactor.resume_delivery().await.unwrap(), 0);
    }
}
