//! Records shared between agents through the work store.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{BatchId, ResourceId};

/// Operator recorded for builds started by the schedule.
pub const AUTO_TIMER: &str = "AutoTimer";

/// A claimable top-level build definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: ResourceId,
    pub description: String,
    /// Script file name, without extension.
    pub script: String,
    pub branch: String,
    /// Agent currently running this request, if any.
    pub machine: Option<String>,
    /// SQL `LIKE` pattern pinning this request to matching agents.
    pub machine_lock: Option<String>,
    pub pending: bool,
    pub killing: bool,
    pub killer: Option<String>,
    pub operator: Option<String>,
    pub last_good_changelist: i64,
    pub last_good_at: Option<DateTime<Utc>>,
    pub last_good_label: Option<String>,
    pub promotable: bool,
    pub looping: bool,
    pub conch_acquired_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_interval_minutes: Option<i32>,
    pub build_run_id: Option<ResourceId>,
    /// Values for `%DatabaseParameter%`, `%DatabaseConfig%` and `%Language%`.
    pub parameter: Option<String>,
    pub config: Option<String>,
    pub language: Option<String>,
}

impl BuildRequest {
    pub fn new(description: impl Into<String>, script: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            description: description.into(),
            script: script.into(),
            branch: branch.into(),
            machine: None,
            machine_lock: None,
            pending: false,
            killing: false,
            killer: None,
            operator: None,
            last_good_changelist: 0,
            last_good_at: None,
            last_good_label: None,
            promotable: false,
            looping: false,
            conch_acquired_at: None,
            next_run_at: None,
            run_interval_minutes: None,
            build_run_id: None,
            parameter: None,
            config: None,
            language: None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.machine.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// A unit of work spawned by a parent build and joined by batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubJob {
    pub id: ResourceId,
    pub name: String,
    /// Script the job runs.
    pub command: String,
    pub parameter: String,
    pub batch: BatchId,
    pub game: String,
    pub platform: String,
    pub branch: String,
    /// Label or changelist the job builds from.
    pub label: String,
    pub machine: Option<String>,
    pub active: bool,
    pub complete: bool,
    pub succeeded: bool,
    pub killing: bool,
    pub build_run_id: Option<ResourceId>,
}

/// Values needed to create a sub-job.
#[derive(Debug, Clone)]
pub struct NewSubJob {
    pub name: String,
    pub command: String,
    pub parameter: String,
    pub batch: BatchId,
    pub game: String,
    pub platform: String,
    pub branch: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AgentState {
    Connected,
    Building,
    Zombied,
    Dead,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Connected => "Connected",
            AgentState::Building => "Building",
            AgentState::Zombied => "Zombied",
            AgentState::Dead => "Dead",
        }
    }
}

impl std::str::FromStr for AgentState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "Connected" => Ok(AgentState::Connected),
            "Building" => Ok(AgentState::Building),
            "Zombied" => Ok(AgentState::Zombied),
            "Dead" => Ok(AgentState::Dead),
            other => Err(crate::Error::InvalidInput(format!("unknown agent state '{other}'"))),
        }
    }
}

/// One registration of an agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: ResourceId,
    pub machine: String,
    pub state: AgentState,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub restart: bool,
    pub sample: Option<ResourceSample>,
}

/// Periodic resource utilisation of an agent machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub load_average: f64,
    pub memory_used_percent: f64,
    pub disk_free_mb: i64,
}

/// Result of registering an agent, including cleanup of a previous crashed run.
#[derive(Debug, Clone)]
pub struct Registration {
    pub agent: AgentRecord,
    pub zombied: u64,
    pub released_requests: u64,
    pub orphaned_jobs: u64,
}

/// The record of one execution of a build request or sub-job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRun {
    pub id: ResourceId,
    pub request_id: Option<ResourceId>,
    pub job_id: Option<ResourceId>,
    pub machine: String,
    pub script: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub changelist: i64,
    pub label: Option<String>,
    pub promotable: bool,
}

/// Outcome of an atomic triggered-build claim.
#[derive(Debug, Clone)]
pub enum TriggerClaim {
    Claimed(BuildRequest),
    /// The pending flag was consumed but the request was already running.
    AlreadyBuilding(BuildRequest),
}

/// Outcome of an operator trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Triggered,
    AlreadyBuilding,
    NotFound,
}
