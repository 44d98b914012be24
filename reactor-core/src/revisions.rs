//! Revision tracking and reconciliation of incoming operations.
//!
//! [`RevisionMap`] tracks the head index of each (document, scope, branch)
//! log touched by a job, so indices for new operations can be assigned
//! without gaps.
//!
//! [`reconcile`] decides what to do with operations received from elsewhere:
//! skip what is already present, move operations whose index has been taken
//! by a different operation to the head, and reject gaps.

use reactor_types::{Operation, SyncUnit};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Head index per log.
///
/// A unit that was never seen has no head; its first operation gets index 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionMap {
    heads: HashMap<SyncUnit, u64>,
}

impl RevisionMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the head of `unit`, as read from storage.
    pub fn load(&mut self, unit: SyncUnit, head: Option<u64>) {
        match head {
            Some(index) => {
                self.heads.insert(unit, index);
            }
            None => {
                self.heads.remove(&unit);
            }
        }
    }

    /// Head index of `unit`.
    pub fn head(&self, unit: &SyncUnit) -> Option<u64> {
        self.heads.get(unit).copied()
    }

    /// Index the next operation of `unit` must take.
    pub fn next_index(&self, unit: &SyncUnit) -> u64 {
        self.head(unit).map_or(0, |head| head + 1)
    }

    /// Claim the next index of `unit` and advance the head past it.
    pub fn assign(&mut self, unit: &SyncUnit) -> u64 {
        let index = self.next_index(unit);
        self.heads.insert(unit.clone(), index);
        index
    }

    /// Record an operation committed at `index`. The head never moves back.
    pub fn observe(&mut self, unit: SyncUnit, index: u64) {
        let head = self.heads.entry(unit).or_insert(index);
        if index > *head {
            *head = index;
        }
    }

    /// Number of tracked logs.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Check if no log is tracked.
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}

/// An incoming operation that cannot be placed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// The operation would leave a hole in the log
    #[error("missing operations: expected index {expected}, found {found}")]
    MissingOperations {
        /// Next free index
        expected: u64,
        /// Index of the incoming operation
        found: u64,
    },
}

/// What to append after reconciling incoming operations with the log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Operations to append, contiguous from the current head
    pub append: Vec<Operation>,
    /// Operations already present in the log
    pub skipped: usize,
    /// Operations moved past a different operation holding their index
    pub rebased: usize,
}

impl Reconciliation {
    /// True when nothing needs to be appended.
    pub fn is_noop(&self) -> bool {
        self.append.is_empty()
    }
}

/// Reconcile contiguous `incoming` operations with a log.
///
/// `existing` must hold every stored operation of the log from the first
/// incoming index onward, and `head` the log's current head. The rules, in
/// order:
///
/// 1. same index and same hash: already present, skipped;
/// 2. hash or action id already in `existing`: already present elsewhere, skipped;
/// 3. index already taken by a different operation: the stored operation
///    wins, the incoming one is moved to the head and its resulting state is
///    dropped so it gets re-derived;
/// 4. index past the head plus one: [`ReconcileError::MissingOperations`].
pub fn reconcile(
    head: Option<u64>,
    existing: &[Operation],
    incoming: &[Operation],
) -> Result<Reconciliation, ReconcileError> {
    let by_index: HashMap<u64, &str> = existing
        .iter()
        .map(|op| (op.index, op.hash.as_str()))
        .collect();
    let hashes: HashSet<&str> = existing.iter().map(|op| op.hash.as_str()).collect();
    let action_ids: HashSet<_> = existing.iter().map(|op| op.action_id).collect();

    let mut next = head.map_or(0, |h| h + 1);
    let mut result = Reconciliation::default();

    for op in incoming {
        if by_index.get(&op.index) == Some(&op.hash.as_str()) {
            result.skipped += 1;
            continue;
        }
        if hashes.contains(op.hash.as_str()) || action_ids.contains(&op.action_id) {
            result.skipped += 1;
            continue;
        }

        if op.index > next {
            return Err(ReconcileError::MissingOperations {
                expected: next,
                found: op.index,
            });
        }

        let mut placed = op.clone();
        if op.index < next {
            placed.index = next;
            placed.resulting_state = None;
            result.rebased += 1;
        }
        result.append.push(placed);
        next += 1;
    }

    Ok(result)
}
