//! Strand coalescing.
//!
//! Strands committed in quick succession are gathered by a
//! [`StrandBatcher`] until they are drained for delivery. Strands for the
//! same (document, scope, branch) are merged into one contiguous strand, so
//! a listener sees one strand per log per delivery.

use reactor_types::{Strand, SyncUnit};
use std::collections::HashMap;

/// Accumulates strands between deliveries.
///
/// Strands come out of [`drain`](Self::drain) in the order their log was
/// first seen. Operations within a log keep commit order.
#[derive(Debug, Default)]
pub struct StrandBatcher {
    strands: Vec<Strand>,
    /// Position in `strands` of the newest strand per unit.
    latest: HashMap<SyncUnit, usize>,
}

impl StrandBatcher {
    /// Create an empty batcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a committed strand.
    ///
    /// It is merged into the pending strand for its unit when it continues
    /// it. A strand that would leave a gap starts a new entry instead, so no
    /// operation is dropped.
    pub fn push(&mut self, strand: Strand) {
        if strand.operations.is_empty() {
            return;
        }
        let unit = strand.unit();
        if let Some(&position) = self.latest.get(&unit) {
            if let Some(pending) = self.strands.get_mut(position) {
                if pending.merge(strand.clone()) {
                    return;
                }
            }
        }
        self.latest.insert(unit, self.strands.len());
        self.strands.push(strand);
    }

    /// Add several strands in commit order.
    pub fn extend(&mut self, strands: impl IntoIterator<Item = Strand>) {
        for strand in strands {
            self.push(strand);
        }
    }

    /// Take every pending strand.
    pub fn drain(&mut self) -> Vec<Strand> {
        self.latest.clear();
        std::mem::take(&mut self.strands)
    }

    /// Number of pending strands.
    pub fn len(&self) -> usize {
        self.strands.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.strands.is_empty()
    }

    /// Number of pending operations across all strands.
    pub fn operation_count(&self) -> usize {
        self.strands.iter().map(|s| s.operations.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_types::{Action, DocumentId, DriveId, Operation, DEFAULT_BRANCH};
    use serde_json::json;

    fn strand(doc: &str, scope: &str, indices: &[u64]) -> Strand {
        Strand {
            drive_id: DriveId::from("drive"),
            document_id: DocumentId::from(doc),
            document_type: "test/counter".into(),
            scope: scope.into(),
            branch: DEFAULT_BRANCH.into(),
            operations: indices
                .iter()
                .map(|i| {
                    let action = Action::new("INC", scope, json!({}));
                    Operation::from_action(&action, *i, DEFAULT_BRANCH)
                })
                .collect(),
        }
    }

    fn indices(strand: &Strand) -> Vec<u64> {
        strand.operations.iter().map(|op| op.index).collect()
    }

    #[test]
    fn consecutive_strands_coalesce() {
        let mut batcher = StrandBatcher::new();
        batcher.push(strand("a", "global", &[0]));
        batcher.push(strand("a", "global", &[1]));
        batcher.push(strand("a", "global", &[2, 3]));

        assert_eq!(batcher.len(), 1);
        assert_eq!(batcher.operation_count(), 4);
        let drained = batcher.drain();
        assert_eq!(indices(&drained[0]), vec![0, 1, 2, 3]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn units_are_kept_apart_in_first_seen_order() {
        let mut batcher = StrandBatcher::new();
        batcher.extend([
            strand("a", "global", &[0]),
            strand("b", "global", &[0]),
            strand("a", "local", &[0]),
            strand("a", "global", &[1]),
        ]);

        let drained = batcher.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].document_id, DocumentId::from("a"));
        assert_eq!(indices(&drained[0]), vec![0, 1]);
        assert_eq!(drained[1].document_id, DocumentId::from("b"));
        assert_eq!(drained[2].scope, "local");
    }

    #[test]
    fn gap_starts_new_entry() {
        let mut batcher = StrandBatcher::new();
        batcher.push(strand("a", "global", &[0]));
        batcher.push(strand("a", "global", &[5]));
        batcher.push(strand("a", "global", &[6]));

        let drained = batcher.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(indices(&drained[1]), vec![5, 6]);
    }

    #[test]
    fn empty_strands_are_ignored() {
        let mut batcher = StrandBatcher::new();
        batcher.push(strand("a", "global", &[]));
        assert!(batcher.is_empty());
    }
}
