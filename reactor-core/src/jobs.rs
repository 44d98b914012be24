//! Jobs submitted to the processor.
//!
//! A [`Job`] is only constructed through [`Job::actions`], [`Job::operations`]
//! or [`Job::document`], which enforce the invariants of each kind. Fields
//! are private so a job cannot be mutated into an invalid shape afterwards.

use reactor_types::{Action, DocumentId, DriveId, JobId, Operation};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

/// Errors rejecting a job at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// An action job needs at least one action
    #[error("action job has no actions")]
    EmptyActions,

    /// An operation job needs at least one operation
    #[error("operation job has no operations")]
    EmptyOperations,

    /// A document job needs a document type
    #[error("document job has an empty document type")]
    EmptyDocumentType,

    /// Operations must increase by exactly one
    #[error("operations not contiguous: expected index {expected}, found {found}")]
    NonContiguous {
        /// Index that should have come next
        expected: u64,
        /// Index that did
        found: u64,
    },

    /// An operation does not belong to the job's scope and branch
    #[error("operation for {scope}/{branch} in job for {expected_scope}/{expected_branch}")]
    ScopeMismatch {
        /// Scope of the job
        expected_scope: String,
        /// Branch of the job
        expected_branch: String,
        /// Scope of the operation
        scope: String,
        /// Branch of the operation
        branch: String,
    },
}

/// Where a job came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobSource {
    /// Submitted by a local client
    Local,
    /// Pulled from or pushed by the named remote
    Remote(String),
}

impl JobSource {
    /// Name of the remote, if any.
    pub fn remote(&self) -> Option<&str> {
        match self {
            JobSource::Local => None,
            JobSource::Remote(name) => Some(name),
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobSource::Local => f.write_str("local"),
            JobSource::Remote(name) => write!(f, "remote:{}", name),
        }
    }
}

/// What a job asks the processor to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Run actions through the document's reducer
    Action {
        /// Branch the actions apply to
        branch: String,
        /// Actions in submission order
        actions: Vec<Action>,
    },
    /// Append fully formed operations for one scope and branch
    Operation {
        /// Scope of every operation
        scope: String,
        /// Branch of every operation
        branch: String,
        /// Operations in index order
        operations: Vec<Operation>,
    },
    /// Create a document, then append any operations it carries
    Document {
        /// Document model type
        document_type: String,
        /// Per-scope state the document starts with
        initial_state: BTreeMap<String, Value>,
        /// Existing history, contiguous per scope and branch
        operations: Vec<Operation>,
    },
}

impl JobKind {
    /// The discriminant as a static string.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Action { .. } => "action",
            JobKind::Operation { .. } => "operation",
            JobKind::Document { .. } => "document",
        }
    }
}

/// Serialization key: jobs with the same key never run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    /// Drive of the document
    pub drive_id: DriveId,
    /// The document
    pub document_id: DocumentId,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.drive_id, self.document_id)
    }
}

/// A unit of work for the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    id: JobId,
    key: JobKey,
    source: JobSource,
    kind: JobKind,
}

impl Job {
    /// Job running `actions` through the reducer.
    pub fn actions(
        drive_id: DriveId,
        document_id: DocumentId,
        branch: impl Into<String>,
        actions: Vec<Action>,
    ) -> Result<Self, JobError> {
        if actions.is_empty() {
            return Err(JobError::EmptyActions);
        }
        Ok(Self::build(
            drive_id,
            document_id,
            JobSource::Local,
            JobKind::Action {
                branch: branch.into(),
                actions,
            },
        ))
    }

    /// Job appending externally produced operations.
    ///
    /// The operations must be non-empty, all in `scope`/`branch`, and
    /// contiguous. They need not start at any particular index.
    pub fn operations(
        drive_id: DriveId,
        document_id: DocumentId,
        scope: impl Into<String>,
        branch: impl Into<String>,
        operations: Vec<Operation>,
        source: JobSource,
    ) -> Result<Self, JobError> {
        let scope = scope.into();
        let branch = branch.into();
        if operations.is_empty() {
            return Err(JobError::EmptyOperations);
        }
        if let Some(op) = operations
            .iter()
            .find(|op| op.scope != scope || op.branch != branch)
        {
            return Err(JobError::ScopeMismatch {
                expected_scope: scope,
                expected_branch: branch,
                scope: op.scope.clone(),
                branch: op.branch.clone(),
            });
        }
        check_contiguous(&operations)?;
        Ok(Self::build(
            drive_id,
            document_id,
            source,
            JobKind::Operation {
                scope,
                branch,
                operations,
            },
        ))
    }

    /// Job creating a document of `document_type`.
    ///
    /// `operations` may span several scopes and branches; each log must be
    /// contiguous on its own.
    pub fn document(
        drive_id: DriveId,
        document_id: DocumentId,
        document_type: impl Into<String>,
        initial_state: BTreeMap<String, Value>,
        operations: Vec<Operation>,
        source: JobSource,
    ) -> Result<Self, JobError> {
        let document_type = document_type.into();
        if document_type.trim().is_empty() {
            return Err(JobError::EmptyDocumentType);
        }
        let mut per_log: HashMap<(&str, &str), Vec<&Operation>> = HashMap::new();
        for op in &operations {
            per_log
                .entry((op.scope.as_str(), op.branch.as_str()))
                .or_default()
                .push(op);
        }
        for ops in per_log.values() {
            check_contiguous(ops.iter().copied())?;
        }
        Ok(Self::build(
            drive_id,
            document_id,
            source,
            JobKind::Document {
                document_type,
                initial_state,
                operations,
            },
        ))
    }

    fn build(drive_id: DriveId, document_id: DocumentId, source: JobSource, kind: JobKind) -> Self {
        Self {
            id: JobId::new(),
            key: JobKey {
                drive_id,
                document_id,
            },
            source,
            kind,
        }
    }

    /// Unique id of this job.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Serialization key.
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Drive of the target document.
    pub fn drive_id(&self) -> &DriveId {
        &self.key.drive_id
    }

    /// Target document.
    pub fn document_id(&self) -> &DocumentId {
        &self.key.document_id
    }

    /// Where the job came from.
    pub fn source(&self) -> &JobSource {
        &self.source
    }

    /// What the job does.
    pub fn kind(&self) -> &JobKind {
        &self.kind
    }
}

fn check_contiguous<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Result<(), JobError> {
    let mut previous: Option<u64> = None;
    for op in operations {
        if let Some(prev) = previous {
            if op.index != prev + 1 {
                return Err(JobError::NonContiguous {
                    expected: prev + 1,
                    found: op.index,
                });
            }
        }
        previous = Some(op.index);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_types::DEFAULT_BRANCH;
    use serde_json::json;

    fn ops(scope: &str, indices: &[u64]) -> Vec<Operation> {
        indices
            .iter()
            .map(|i| {
                let action = Action::new("INC", scope, json!({}));
                Operation::from_action(&action, *i, DEFAULT_BRANCH)
            })
            .collect()
    }

    fn ids() -> (DriveId, DocumentId) {
        (DriveId::from("drive"), DocumentId::from("doc"))
    }

    #[test]
    fn action_job_requires_actions() {
        let (drive, doc) = ids();
        assert_eq!(
            Job::actions(drive, doc, DEFAULT_BRANCH, vec![]),
            Err(JobError::EmptyActions)
        );
    }

    #[test]
    fn operation_job_requires_operations() {
        let (drive, doc) = ids();
        let result = Job::operations(drive, doc, "global", DEFAULT_BRANCH, vec![], JobSource::Local);
        assert_eq!(result, Err(JobError::EmptyOperations));
    }

    #[test]
    fn operation_job_rejects_gaps() {
        let (drive, doc) = ids();
        let result = Job::operations(
            drive,
            doc,
            "global",
            DEFAULT_BRANCH,
            ops("global", &[0, 2]),
            JobSource::Local,
        );
        assert_eq!(
            result,
            Err(JobError::NonContiguous {
                expected: 1,
                found: 2
            })
        );
    }

    #[test]
    fn operation_job_rejects_foreign_scope() {
        let (drive, doc) = ids();
        let result = Job::operations(
            drive,
            doc,
            "global",
            DEFAULT_BRANCH,
            ops("local", &[0]),
            JobSource::Local,
        );
        assert!(matches!(result, Err(JobError::ScopeMismatch { .. })));
    }

    #[test]
    fn document_job_checks_each_log() {
        let (drive, doc) = ids();
        let mut history = ops("global", &[0, 1]);
        history.extend(ops("local", &[0]));
        let job = Job::document(
            drive.clone(),
            doc.clone(),
            "test/counter",
            BTreeMap::new(),
            history,
            JobSource::Local,
        )
        .unwrap();
        assert_eq!(job.kind().name(), "document");

        let mut broken = ops("global", &[0]);
        broken.extend(ops("global", &[5]));
        let result = Job::document(drive, doc, "test/counter", BTreeMap::new(), broken, JobSource::Local);
        assert!(matches!(result, Err(JobError::NonContiguous { .. })));
    }

    #[test]
    fn document_job_requires_type() {
        let (drive, doc) = ids();
        let result = Job::document(drive, doc, " ", BTreeMap::new(), vec![], JobSource::Local);
        assert_eq!(result, Err(JobError::EmptyDocumentType));
    }

    #[test]
    fn kind_serializes_with_discriminant() {
        let (drive, doc) = ids();
        let job = Job::actions(
            drive,
            doc,
            DEFAULT_BRANCH,
            vec![Action::new("INC", "global", json!({}))],
        )
        .unwrap();
        let json = serde_json::to_value(job.kind()).unwrap();
        assert_eq!(json["kind"], "action");
        assert_eq!(job.key().to_string(), "drive/doc");
    }

    #[test]
    fn source_display() {
        assert_eq!(JobSource::Local.to_string(), "local");
        assert_eq!(JobSource::Remote("peer".into()).to_string(), "remote:peer");
        assert_eq!(JobSource::Remote("peer".into()).remote(), Some("peer"));
    }
}
