//! The shared work store.
//!
//! Agents never talk to each other. Everything they coordinate on (who owns
//! a request, which sub-jobs of a batch are done, who holds the conch) lives
//! behind [`WorkStore`]. Every `claim_*` operation finds one eligible row and
//! stamps it with the claiming machine in a single atomic step, so two agents
//! polling at the same moment can never receive the same row.

pub mod memory;
pub mod postgres;

pub use memory::MemoryWorkStore;
pub use postgres::PgWorkStore;

use async_trait::async_trait;
use buildfarm_core::{
    AgentRecord, AgentState, BatchId, BuildRequest, BuildRun, NewSubJob, Registration,
    ResourceId, ResourceSample, SubJob, TriggerClaim, TriggerOutcome,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::DbResult;

/// A conch holder older than this is cleared by whichever agent notices.
pub const CONCH_STALE_AFTER: Duration = Duration::minutes(60);

/// Build run status strings are capped at this many characters.
pub const MAX_STATUS_LEN: usize = 127;

/// Branch-independent variable that, when non-empty, takes the farm down.
pub const SYSTEM_DOWN_VARIABLE: &str = "StatusMessage";

/// Branch used for variables that apply to every branch.
pub const GLOBAL_BRANCH: &str = "";

/// Completion counts for one sub-job batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub complete: i64,
    pub succeeded: i64,
}

/// Why a kill was requested and by whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    pub id: ResourceId,
    pub killer: Option<String>,
}

#[async_trait]
pub trait WorkStore: Send + Sync {
    // Agents

    /// Zombie any live records for this machine, release its claims and
    /// insert a fresh Connected record.
    async fn register_agent(&self, machine: &str) -> DbResult<Registration>;
    async fn heartbeat(&self, agent: ResourceId, sample: Option<&ResourceSample>) -> DbResult<()>;
    async fn set_agent_state(&self, agent: ResourceId, state: AgentState) -> DbResult<()>;
    async fn request_restart(&self, machine: &str) -> DbResult<bool>;
    async fn restart_requested(&self, agent: ResourceId) -> DbResult<bool>;
    async fn list_agents(&self) -> DbResult<Vec<AgentRecord>>;
    /// The first request whose lock pattern matches this machine.
    async fn machine_lock(&self, machine: &str) -> DbResult<Option<ResourceId>>;

    // Claims

    /// Claim a request whose schedule is due. With `any_machine` only
    /// unlocked requests qualify, otherwise only requests locked to `machine`.
    async fn claim_timed_build(&self, machine: &str, any_machine: bool) -> DbResult<Option<BuildRequest>>;
    /// Consume one pending trigger, claiming the request if nobody runs it.
    async fn claim_triggered_build(&self, machine: &str, any_machine: bool) -> DbResult<Option<TriggerClaim>>;
    /// Claim the oldest open sub-job.
    async fn claim_job(&self, machine: &str) -> DbResult<Option<SubJob>>;

    // Requests

    async fn create_build_request(&self, request: &BuildRequest) -> DbResult<BuildRequest>;
    async fn get_build_request(&self, id: ResourceId) -> DbResult<BuildRequest>;
    async fn find_build_request(&self, description: &str) -> DbResult<Option<BuildRequest>>;
    /// Set the pending flag on an unclaimed request.
    async fn trigger_build(&self, description: &str, operator: &str) -> DbResult<TriggerOutcome>;
    /// Open a build run for a claimed request and clear any stale kill flag.
    async fn begin_build(&self, request: ResourceId, machine: &str, script: &str) -> DbResult<BuildRun>;
    /// Clear the claim. Returns the released request.
    async fn release_build(&self, request: ResourceId) -> DbResult<BuildRequest>;
    async fn set_last_good(
        &self,
        request: ResourceId,
        changelist: i64,
        at: DateTime<Utc>,
        label: Option<&str>,
    ) -> DbResult<()>;

    // Kills

    async fn request_kill(&self, description: &str, killer: &str) -> DbResult<bool>;
    async fn poll_kill_build(&self, machine: &str) -> DbResult<Option<KillRequest>>;
    async fn poll_kill_job(&self, machine: &str) -> DbResult<Option<KillRequest>>;
    /// Flag every incomplete sub-job of a batch for kill.
    async fn kill_batch(&self, batch: BatchId) -> DbResult<u64>;

    // Conch

    /// Take the conch for `request`. A stale holder is cleared but the caller
    /// still has to ask again on a later poll.
    async fn acquire_conch(&self, request: ResourceId) -> DbResult<bool>;
    async fn release_conch(&self, request: ResourceId) -> DbResult<()>;
    async fn conch_holder(&self) -> DbResult<Option<(ResourceId, DateTime<Utc>)>>;

    // Sub-jobs

    async fn add_job(&self, job: &NewSubJob) -> DbResult<SubJob>;
    async fn get_job(&self, id: ResourceId) -> DbResult<SubJob>;
    async fn begin_job(&self, job: ResourceId, machine: &str) -> DbResult<BuildRun>;
    async fn batch_counts(&self, batch: BatchId) -> DbResult<BatchCounts>;
    async fn mark_job_succeeded(&self, job: ResourceId) -> DbResult<()>;
    async fn complete_job(&self, job: ResourceId) -> DbResult<()>;

    // Runs

    async fn get_build_run(&self, id: ResourceId) -> DbResult<BuildRun>;
    async fn set_run_status(&self, run: ResourceId, status: &str) -> DbResult<()>;
    async fn set_run_changelist(&self, run: ResourceId, changelist: i64) -> DbResult<()>;
    async fn set_run_label(&self, run: ResourceId, label: &str) -> DbResult<()>;
    async fn finish_run(&self, run: ResourceId, status: &str) -> DbResult<()>;

    // Variables and performance data

    /// Variables for a branch, overlaid on the global ones.
    async fn variables(&self, branch: &str) -> DbResult<HashMap<String, String>>;
    async fn set_variable(&self, branch: &str, name: &str, value: &str) -> DbResult<()>;
    async fn system_down_message(&self) -> DbResult<Option<String>>;
    async fn record_perf(&self, machine: &str, key: &str, value: i64) -> DbResult<()>;
}

/// Cap a status string at [`MAX_STATUS_LEN`] characters.
pub fn truncate_status(status: &str) -> &str {
    match status.char_indices().nth(MAX_STATUS_LEN) {
        Some((idx, _)) => &status[..idx],
        None => status,
    }
}

/// Next scheduled start after a timed claim, if the request repeats.
pub(crate) fn next_run_after(due: DateTime<Utc>, interval_minutes: Option<i32>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let interval = Duration::minutes(i64::from(interval_minutes.filter(|m| *m > 0)?));
    let mut next = due + interval;
    while next <= now {
        next += interval;
    }
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_status() {
        let long = "x".repeat(200);
        assert_eq!(truncate_status(&long).len(), MAX_STATUS_LEN);
        assert_eq!(truncate_status("Building"), "Building");
        let wide = "é".repeat(130);
        assert_eq!(truncate_status(&wide).chars().count(), MAX_STATUS_LEN);
    }

    #[test]
    fn test_next_run_skips_missed_slots() {
        let due = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 5, 30, 0).unwrap();
        let next = next_run_after(due, Some(60), now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap());
        assert_eq!(next_run_after(due, None, now), None);
        assert_eq!(next_run_after(due, Some(0), now), None);
    }
}
