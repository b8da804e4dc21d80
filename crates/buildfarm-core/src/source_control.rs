//! Source-control collaborator.
//!
//! The agent never talks to a concrete version-control system directly. Each
//! operation runs against a [`Workspace`] (a branch checked out under a client
//! spec) and reports failures as [`Error::SourceControl`](crate::Error).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::Result;

/// A client workspace for one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub branch: String,
    pub client_spec: String,
    pub root: PathBuf,
}

/// A revision to sync or tag at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    Head,
    ChangeList(i64),
    Label(String),
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Revision::Head => write!(f, "#head"),
            Revision::ChangeList(cl) => write!(f, "@{cl}"),
            Revision::Label(label) => write!(f, "@{label}"),
        }
    }
}

/// One submitted change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescription {
    pub changelist: i64,
    pub user: String,
    pub submitted_at: DateTime<Utc>,
    pub description: String,
    pub files: Vec<String>,
}

/// Result of submitting the default changelist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted { changelist: i64 },
    /// The submit was rejected until the listed files are resolved.
    NeedsResolve { files: Vec<String> },
}

/// A label as stored by source control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDetails {
    pub name: String,
    pub description: String,
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Sync `file_spec` to `revision`, returning the highest changelist synced.
    async fn sync(&self, ws: &Workspace, file_spec: &str, revision: &Revision) -> Result<i64>;

    /// Sync only the files of one submitted change.
    async fn sync_change(&self, ws: &Workspace, changelist: i64) -> Result<()>;

    /// Open files for edit, returning how many were opened.
    async fn checkout(&self, ws: &Workspace, file_spec: &str) -> Result<usize>;

    async fn open_for_delete(&self, ws: &Workspace, file_spec: &str) -> Result<usize>;

    async fn revert(&self, ws: &Workspace, file_spec: &str) -> Result<()>;

    async fn submit(&self, ws: &Workspace, description: &str) -> Result<SubmitOutcome>;

    /// Accept-yours resolve of everything opened in the workspace.
    async fn resolve(&self, ws: &Workspace) -> Result<()>;

    async fn create_label(&self, ws: &Workspace, label: &str, description: &str, revision: &Revision) -> Result<()>;

    async fn update_label_description(&self, ws: &Workspace, label: &str, description: &str) -> Result<()>;

    async fn delete_label(&self, ws: &Workspace, label: &str) -> Result<()>;

    async fn label(&self, ws: &Workspace, label: &str) -> Result<Option<LabelDetails>>;

    /// Tag `file_spec` at `revision` into `label`.
    async fn tag(&self, ws: &Workspace, file_spec: &str, label: &str, revision: &Revision) -> Result<()>;

    /// Changes submitted after `changelist`, oldest first.
    async fn changes_since(&self, ws: &Workspace, changelist: i64) -> Result<Vec<ChangeDescription>>;

    /// Files that differ from the depot; an empty list means consistent.
    async fn inconsistent_files(&self, ws: &Workspace, file_spec: &str) -> Result<Vec<String>>;

    async fn client_root(&self, ws: &Workspace) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_suffixes() {
        assert_eq!(Revision::Head.to_string(), "#head");
        assert_eq!(Revision::ChangeList(1234).to_string(), "@1234");
        assert_eq!(Revision::Label("Main_[2024-01-02_03.04]".into()).to_string(), "@Main_[2024-01-02_03.04]");
    }
}
