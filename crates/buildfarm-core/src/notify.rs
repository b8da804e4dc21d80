//! Notification collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;

/// Facts about a run that every notification draws on.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub description: String,
    pub machine: String,
    pub operator: String,
    pub killer: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub changelist: i64,
    pub label: String,
    pub folder: String,
    pub trigger_address: String,
    pub fail_address: String,
    pub success_address: String,
    /// Collated changes report, empty when no changes were gathered.
    pub changes: String,
    pub is_job: bool,
}

/// Events the build farm reports to people.
#[derive(Debug, Clone)]
pub enum Notification {
    Triggered(RunSummary),
    Killed(RunSummary),
    Failed {
        run: RunSummary,
        message: String,
        /// Publishing failures also go to IT.
        cc_it: bool,
    },
    Succeeded(RunSummary),
    Promoted(RunSummary),
    Published(RunSummary),
    InstallMade(RunSummary),
    UpToDate(RunSummary),
    /// Per-user changes report for QA builds.
    QaChanges {
        run: RunSummary,
        submitters: Vec<String>,
    },
    AlreadyInProgress {
        operator: String,
        description: String,
    },
    Status {
        run: RunSummary,
        report: String,
    },
    Glitch {
        machine: String,
        line: String,
    },
    RedFlash {
        run: RunSummary,
        sms: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}
