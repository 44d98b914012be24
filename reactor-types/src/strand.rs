//! Strands: contiguous runs of operations for one (document, scope, branch).

use serde::{Deserialize, Serialize};

use crate::{DocumentId, DriveId, Operation};

/// The (document, scope, branch) triple that owns an operation log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncUnit {
    /// Document the log belongs to
    pub document_id: DocumentId,
    /// Scope of the log
    pub scope: String,
    /// Branch of the log
    pub branch: String,
}

impl SyncUnit {
    /// Create a sync unit.
    pub fn new(document_id: DocumentId, scope: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            document_id,
            scope: scope.into(),
            branch: branch.into(),
        }
    }
}

/// The unit exchanged between reactors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strand {
    /// Drive owning the document
    pub drive_id: DriveId,
    /// Document the operations belong to
    pub document_id: DocumentId,
    /// Document model type
    pub document_type: String,
    /// Scope of the operations
    pub scope: String,
    /// Branch of the operations
    pub branch: String,
    /// Operations in index order
    pub operations: Vec<Operation>,
}

impl Strand {
    /// The log this strand belongs to.
    pub fn unit(&self) -> SyncUnit {
        SyncUnit::new(self.document_id.clone(), self.scope.clone(), self.branch.clone())
    }

    /// Index of the first operation.
    pub fn first_index(&self) -> Option<u64> {
        self.operations.first().map(|op| op.index)
    }

    /// Index of the last operation.
    pub fn last_index(&self) -> Option<u64> {
        self.operations.last().map(|op| op.index)
    }

    /// True when every operation belongs to this strand's scope and branch
    /// and indices increase by exactly one.
    pub fn is_contiguous(&self) -> bool {
        let in_unit = self
            .operations
            .iter()
            .all(|op| op.scope == self.scope && op.branch == self.branch);
        in_unit
            && self
                .operations
                .windows(2)
                .all(|pair| pair[1].index == pair[0].index + 1)
    }

    /// Append another strand for the same unit.
    ///
    /// Operations at or below this strand's last index are dropped so the
    /// result stays contiguous. Returns false, leaving `self` untouched,
    /// when `other` belongs to a different unit or would leave a gap.
    pub fn merge(&mut self, other: Strand) -> bool {
        if other.unit() != self.unit() {
            return false;
        }
        let next = match self.last_index() {
            Some(last) => last + 1,
            None => {
                self.operations = other.operations;
                return true;
            }
        };
        let fresh: Vec<Operation> = other
            .operations
            .into_iter()
            .filter(|op| op.index >= next)
            .collect();
        if fresh.first().is_some_and(|op| op.index != next) {
            return false;
        }
        self.operations.extend(fresh);
        true
    }
}
