//! Listener filters.

use serde::{Deserialize, Serialize};

use crate::{DocumentId, DriveId, Strand};

/// Selects which strands a listener receives.
///
/// Every list that is empty matches everything, so the default filter
/// matches all strands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerFilter {
    /// Only strands of this drive
    #[serde(default)]
    pub drive_id: Option<DriveId>,
    /// Only these documents
    #[serde(default)]
    pub document_ids: Vec<DocumentId>,
    /// Only these document types
    #[serde(default)]
    pub document_types: Vec<String>,
    /// Only these scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Only this branch
    #[serde(default)]
    pub branch: Option<String>,
    /// Skip strands that were synced in from this remote
    #[serde(default)]
    pub exclude_remote: Option<String>,
}

impl ListenerFilter {
    /// Filter that matches every strand of one drive.
    pub fn for_drive(drive_id: DriveId) -> Self {
        Self {
            drive_id: Some(drive_id),
            ..Self::default()
        }
    }

    /// Restrict to the given scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to one branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Skip strands that came from `remote`.
    pub fn excluding_remote(mut self, remote: impl Into<String>) -> Self {
        self.exclude_remote = Some(remote.into());
        self
    }

    /// True when `strand`, synced in from `source_remote` if any, passes.
    pub fn matches(&self, strand: &Strand, source_remote: Option<&str>) -> bool {
        if let (Some(excluded), Some(source)) = (&self.exclude_remote, source_remote) {
            if excluded == source {
                return false;
            }
        }
        if self.drive_id.as_ref().is_some_and(|d| d != &strand.drive_id) {
            return false;
        }
        if self.branch.as_ref().is_some_and(|b| b != &strand.branch) {
            return false;
        }
        list_matches(&self.document_ids, &strand.document_id)
            && list_matches(&self.document_types, &strand.document_type)
            && list_matches(&self.scopes, &strand.scope)
    }
}

fn list_matches<T: PartialEq>(allowed: &[T], value: &T) -> bool {
    allowed.is_empty() || allowed.contains(value)
}
