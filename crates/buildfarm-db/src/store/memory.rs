//! In-memory work store.
//!
//! A single mutex guards every table, so each operation behaves like one
//! serialisable transaction. Used by tests and by `buildfarm validate`.

use async_trait::async_trait;
use buildfarm_core::{
    AUTO_TIMER, AgentRecord, AgentState, BatchId, BuildRequest, BuildRun, NewSubJob,
    Registration, ResourceId, ResourceSample, SubJob, TriggerClaim, TriggerOutcome,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{
    BatchCounts, CONCH_STALE_AFTER, GLOBAL_BRANCH, KillRequest, SYSTEM_DOWN_VARIABLE, WorkStore,
    next_run_after, truncate_status,
};
use crate::{DbError, DbResult};

/// One recorded performance sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfSample {
    pub machine: String,
    pub key: String,
    pub value: i64,
}

#[derive(Default)]
struct Tables {
    requests: BTreeMap<ResourceId, BuildRequest>,
    jobs: BTreeMap<ResourceId, SubJob>,
    agents: BTreeMap<ResourceId, AgentRecord>,
    runs: BTreeMap<ResourceId, BuildRun>,
    variables: HashMap<(String, String), String>,
    perf: Vec<PerfSample>,
}

impl Tables {
    fn request_mut(&mut self, id: ResourceId) -> DbResult<&mut BuildRequest> {
        self.requests
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build request {}", id)))
    }

    fn job_mut(&mut self, id: ResourceId) -> DbResult<&mut SubJob> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("sub-job {}", id)))
    }

    fn run_mut(&mut self, id: ResourceId) -> DbResult<&mut BuildRun> {
        self.runs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build run {}", id)))
    }

    fn agent_mut(&mut self, id: ResourceId) -> DbResult<&mut AgentRecord> {
        self.agents
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("agent {}", id)))
    }
}

/// Work store held entirely in process memory.
#[derive(Default)]
pub struct MemoryWorkStore {
    tables: Mutex<Tables>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a request row as-is.
    pub fn insert_request(&self, request: BuildRequest) -> ResourceId {
        let id = request.id;
        self.tables.lock().requests.insert(id, request);
        id
    }

    /// Insert or replace a sub-job row as-is.
    pub fn insert_job(&self, job: SubJob) -> ResourceId {
        let id = job.id;
        self.tables.lock().jobs.insert(id, job);
        id
    }

    pub fn request(&self, id: ResourceId) -> Option<BuildRequest> {
        self.tables.lock().requests.get(&id).cloned()
    }

    pub fn job(&self, id: ResourceId) -> Option<SubJob> {
        self.tables.lock().jobs.get(&id).cloned()
    }

    pub fn jobs_in_batch(&self, batch: BatchId) -> Vec<SubJob> {
        self.tables
            .lock()
            .jobs
            .values()
            .filter(|j| j.batch == batch)
            .cloned()
            .collect()
    }

    pub fn runs(&self) -> Vec<BuildRun> {
        self.tables.lock().runs.values().cloned().collect()
    }

    pub fn perf(&self) -> Vec<PerfSample> {
        self.tables.lock().perf.clone()
    }

    /// Backdate the conch so staleness can be exercised without waiting.
    pub fn set_conch_acquired_at(&self, request: ResourceId, at: DateTime<Utc>) -> DbResult<()> {
        self.tables.lock().request_mut(request)?.conch_acquired_at = Some(at);
        Ok(())
    }
}

/// Case-insensitive SQL `LIKE` with `%` and `_` wildcards.
pub(crate) fn like(pattern: &str, text: &str) -> bool {
    fn matches(p: &[char], t: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some(('%', rest)) => (0..=t.len()).any(|skip| matches(rest, &t[skip..])),
            Some(('_', rest)) => !t.is_empty() && matches(rest, &t[1..]),
            Some((c, rest)) => t.first().is_some_and(|tc| tc == c) && matches(rest, &t[1..]),
        }
    }
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();
    matches(&p, &t)
}

fn lock_allows(request: &BuildRequest, machine: &str, any_machine: bool) -> bool {
    match request.machine_lock.as_deref().filter(|l| !l.is_empty()) {
        Some(pattern) => !any_machine && like(pattern, machine),
        None => any_machine,
    }
}

fn new_run(machine: &str, script: &str, promotable: bool) -> BuildRun {
    BuildRun {
        id: ResourceId::new(),
        request_id: None,
        job_id: None,
        machine: machine.to_string(),
        script: script.to_string(),
        status: "Spawning".to_string(),
        started_at: Utc::now(),
        ended_at: None,
        changelist: 0,
        label: None,
        promotable,
    }
}

#[async_trait]
impl WorkStore for MemoryWorkStore {
    async fn register_agent(&self, machine: &str) -> DbResult<Registration> {
        let mut tables = self.tables.lock();
        let now = Utc::now();

        let mut zombied = 0;
        for agent in tables.agents.values_mut().filter(|a| a.machine == machine) {
            if matches!(agent.state, AgentState::Connected | AgentState::Building) {
                agent.state = AgentState::Zombied;
                agent.ended_at = Some(now);
                zombied += 1;
            }
        }

        let mut released_requests = 0;
        for request in tables.requests.values_mut() {
            if request.machine.as_deref() == Some(machine) {
                request.machine = None;
                request.build_run_id = None;
                request.killing = false;
                request.conch_acquired_at = None;
                released_requests += 1;
            }
        }

        let mut orphaned_jobs = 0;
        for job in tables.jobs.values_mut() {
            if job.machine.as_deref() == Some(machine) && !job.complete {
                job.complete = true;
                job.active = false;
                orphaned_jobs += 1;
            }
        }

        let agent = AgentRecord {
            id: ResourceId::new(),
            machine: machine.to_string(),
            state: AgentState::Connected,
            started_at: now,
            heartbeat_at: now,
            ended_at: None,
            restart: false,
            sample: None,
        };
        tables.agents.insert(agent.id, agent.clone());

        Ok(Registration {
            agent,
            zombied,
            released_requests,
            orphaned_jobs,
        })
    }

    async fn heartbeat(&self, agent: ResourceId, sample: Option<&ResourceSample>) -> DbResult<()> {
        let mut tables = self.tables.lock();
        let record = tables.agent_mut(agent)?;
        record.heartbeat_at = Utc::now();
        if let Some(sample) = sample {
            record.sample = Some(sample.clone());
        }
        Ok(())
    }

    async fn set_agent_state(&self, agent: ResourceId, state: AgentState) -> DbResult<()> {
        let mut tables = self.tables.lock();
        let record = tables.agent_mut(agent)?;
        record.state = state;
        if state == AgentState::Dead {
            record.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn request_restart(&self, machine: &str) -> DbResult<bool> {
        let mut tables = self.tables.lock();
        let mut found = false;
        for agent in tables
            .agents
            .values_mut()
            .filter(|a| a.machine == machine && a.ended_at.is_none())
        {
            agent.restart = true;
            found = true;
        }
        Ok(found)
    }

    async fn restart_requested(&self, agent: ResourceId) -> DbResult<bool> {
        Ok(self.tables.lock().agent_mut(agent)?.restart)
    }

    async fn list_agents(&self) -> DbResult<Vec<AgentRecord>> {
        let mut agents: Vec<_> = self.tables.lock().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.machine.cmp(&b.machine).then(b.started_at.cmp(&a.started_at)));
        Ok(agents)
    }

    async fn machine_lock(&self, machine: &str) -> DbResult<Option<ResourceId>> {
        let tables = self.tables.lock();
        Ok(tables
            .requests
            .values()
            .find(|r| {
                r.machine_lock
                    .as_deref()
                    .is_some_and(|l| !l.is_empty() && like(l, machine))
            })
            .map(|r| r.id))
    }

    async fn claim_timed_build(&self, machine: &str, any_machine: bool) -> DbResult<Option<BuildRequest>> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let Some(request) = tables.requests.values_mut().find(|r| {
            !r.is_claimed()
                && r.next_run_at.is_some_and(|due| due <= now)
                && lock_allows(r, machine, any_machine)
        }) else {
            return Ok(None);
        };

        let due = request.next_run_at.unwrap_or(now);
        request.machine = Some(machine.to_string());
        request.operator = Some(AUTO_TIMER.to_string());
        request.pending = false;
        request.next_run_at = next_run_after(due, request.run_interval_minutes, now);
        Ok(Some(request.clone()))
    }

    async fn claim_triggered_build(&self, machine: &str, any_machine: bool) -> DbResult<Option<TriggerClaim>> {
        let mut tables = self.tables.lock();
        let Some(request) = tables
            .requests
            .values_mut()
            .find(|r| r.pending && lock_allows(r, machine, any_machine))
        else {
            return Ok(None);
        };

        request.pending = false;
        if request.is_claimed() {
            return Ok(Some(TriggerClaim::AlreadyBuilding(request.clone())));
        }
        request.machine = Some(machine.to_string());
        Ok(Some(TriggerClaim::Claimed(request.clone())))
    }

    async fn claim_job(&self, machine: &str) -> DbResult<Option<SubJob>> {
        let mut tables = self.tables.lock();
        let Some(job) = tables
            .jobs
            .values_mut()
            .filter(|j| {
                !j.complete && !j.active && j.machine.as_deref().is_none_or(|m| m.is_empty())
            })
            .min_by_key(|j| (j.batch, j.id))
        else {
            return Ok(None);
        };

        job.machine = Some(machine.to_string());
        job.active = true;
        Ok(Some(job.clone()))
    }

    async fn create_build_request(&self, request: &BuildRequest) -> DbResult<BuildRequest> {
        let mut tables = self.tables.lock();
        if tables
            .requests
            .values()
            .any(|r| r.description == request.description)
        {
            return Err(DbError::Duplicate(format!("build request '{}'", request.description)));
        }
        tables.requests.insert(request.id, request.clone());
        Ok(request.clone())
    }

    async fn get_build_request(&self, id: ResourceId) -> DbResult<BuildRequest> {
        Ok(self.tables.lock().request_mut(id)?.clone())
    }

    async fn find_build_request(&self, description: &str) -> DbResult<Option<BuildRequest>> {
        Ok(self
            .tables
            .lock()
            .requests
            .values()
            .find(|r| r.description.eq_ignore_ascii_case(description))
            .cloned())
    }

    async fn trigger_build(&self, description: &str, operator: &str) -> DbResult<TriggerOutcome> {
        let mut tables = self.tables.lock();
        let Some(request) = tables
            .requests
            .values_mut()
            .find(|r| r.description.eq_ignore_ascii_case(description))
        else {
            return Ok(TriggerOutcome::NotFound);
        };
        if request.is_claimed() {
            return Ok(TriggerOutcome::AlreadyBuilding);
        }
        request.pending = true;
        request.operator = Some(operator.to_string());
        Ok(TriggerOutcome::Triggered)
    }

    async fn begin_build(&self, request: ResourceId, machine: &str, script: &str) -> DbResult<BuildRun> {
        let mut tables = self.tables.lock();
        let row = tables.request_mut(request)?;
        let mut run = new_run(machine, script, row.promotable);
        run.request_id = Some(request);
        row.machine = Some(machine.to_string());
        row.killing = false;
        row.killer = None;
        row.build_run_id = Some(run.id);
        tables.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn release_build(&self, request: ResourceId) -> DbResult<BuildRequest> {
        let mut tables = self.tables.lock();
        let row = tables.request_mut(request)?;
        row.machine = None;
        row.killing = false;
        row.build_run_id = None;
        row.conch_acquired_at = None;
        Ok(row.clone())
    }

    async fn set_last_good(
        &self,
        request: ResourceId,
        changelist: i64,
        at: DateTime<Utc>,
        label: Option<&str>,
    ) -> DbResult<()> {
        let mut tables = self.tables.lock();
        let row = tables.request_mut(request)?;
        row.last_good_changelist = changelist;
        row.last_good_at = Some(at);
        if let Some(label) = label {
            row.last_good_label = Some(label.to_string());
        }
        Ok(())
    }

    async fn request_kill(&self, description: &str, killer: &str) -> DbResult<bool> {
        let mut tables = self.tables.lock();
        let Some(request) = tables
            .requests
            .values_mut()
            .find(|r| r.description.eq_ignore_ascii_case(description) && r.is_claimed())
        else {
            return Ok(false);
        };
        request.killing = true;
        request.killer = Some(killer.to_string());
        Ok(true)
    }

    async fn poll_kill_build(&self, machine: &str) -> DbResult<Option<KillRequest>> {
        let tables = self.tables.lock();
        Ok(tables
            .requests
            .values()
            .find(|r| r.killing && r.machine.as_deref() == Some(machine))
            .map(|r| KillRequest {
                id: r.id,
                killer: r.killer.clone(),
            }))
    }

    async fn poll_kill_job(&self, machine: &str) -> DbResult<Option<KillRequest>> {
        let tables = self.tables.lock();
        Ok(tables
            .jobs
            .values()
            .find(|j| j.killing && !j.complete && j.machine.as_deref() == Some(machine))
            .map(|j| KillRequest { id: j.id, killer: None }))
    }

    async fn kill_batch(&self, batch: BatchId) -> DbResult<u64> {
        let mut tables = self.tables.lock();
        let mut flagged = 0;
        for job in tables.jobs.values_mut().filter(|j| j.batch == batch && !j.complete) {
            job.killing = true;
            flagged += 1;
        }
        Ok(flagged)
    }

    async fn acquire_conch(&self, request: ResourceId) -> DbResult<bool> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let holder = tables
            .requests
            .values()
            .find_map(|r| r.conch_acquired_at.map(|at| (r.id, at)));

        match holder {
            Some((id, _)) if id == request => Ok(true),
            Some((id, at)) => {
                if now - at > CONCH_STALE_AFTER {
                    tables.request_mut(id)?.conch_acquired_at = None;
                }
                Ok(false)
            }
            None => {
                tables.request_mut(request)?.conch_acquired_at = Some(now);
                Ok(true)
            }
        }
    }

    async fn release_conch(&self, request: ResourceId) -> DbResult<()> {
        let mut tables = self.tables.lock();
        if let Some(row) = tables.requests.get_mut(&request) {
            row.conch_acquired_at = None;
        }
        Ok(())
    }

    async fn conch_holder(&self) -> DbResult<Option<(ResourceId, DateTime<Utc>)>> {
        let tables = self.tables.lock();
        Ok(tables
            .requests
            .values()
            .find_map(|r| r.conch_acquired_at.map(|at| (r.id, at))))
    }

    async fn add_job(&self, job: &NewSubJob) -> DbResult<SubJob> {
        let record = SubJob {
            id: ResourceId::new(),
            name: job.name.clone(),
            command: job.command.clone(),
            parameter: job.parameter.clone(),
            batch: job.batch,
            game: job.game.clone(),
            platform: job.platform.clone(),
            branch: job.branch.clone(),
            label: job.label.clone(),
            machine: None,
            active: false,
            complete: false,
            succeeded: false,
            killing: false,
            build_run_id: None,
        };
        self.tables.lock().jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<SubJob> {
        Ok(self.tables.lock().job_mut(id)?.clone())
    }

    async fn begin_job(&self, job: ResourceId, machine: &str) -> DbResult<BuildRun> {
        let mut tables = self.tables.lock();
        let row = tables.job_mut(job)?;
        let mut run = new_run(machine, &row.command, false);
        run.job_id = Some(job);
        row.build_run_id = Some(run.id);
        tables.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn batch_counts(&self, batch: BatchId) -> DbResult<BatchCounts> {
        let tables = self.tables.lock();
        let mut counts = BatchCounts::default();
        for job in tables.jobs.values().filter(|j| j.batch == batch && j.complete) {
            counts.complete += 1;
            if job.succeeded {
                counts.succeeded += 1;
            }
        }
        Ok(counts)
    }

    async fn mark_job_succeeded(&self, job: ResourceId) -> DbResult<()> {
        self.tables.lock().job_mut(job)?.succeeded = true;
        Ok(())
    }

    async fn complete_job(&self, job: ResourceId) -> DbResult<()> {
        let mut tables = self.tables.lock();
        let row = tables.job_mut(job)?;
        row.complete = true;
        row.active = false;
        Ok(())
    }

    async fn get_build_run(&self, id: ResourceId) -> DbResult<BuildRun> {
        Ok(self.tables.lock().run_mut(id)?.clone())
    }

    async fn set_run_status(&self, run: ResourceId, status: &str) -> DbResult<()> {
        self.tables.lock().run_mut(run)?.status = truncate_status(status).to_string();
        Ok(())
    }

    async fn set_run_changelist(&self, run: ResourceId, changelist: i64) -> DbResult<()> {
        self.tables.lock().run_mut(run)?.changelist = changelist;
        Ok(())
    }

    async fn set_run_label(&self, run: ResourceId, label: &str) -> DbResult<()> {
        self.tables.lock().run_mut(run)?.label = Some(label.to_string());
        Ok(())
    }

    async fn finish_run(&self, run: ResourceId, status: &str) -> DbResult<()> {
        let mut tables = self.tables.lock();
        let row = tables.run_mut(run)?;
        row.status = truncate_status(status).to_string();
        row.ended_at = Some(Utc::now());
        Ok(())
    }

    async fn variables(&self, branch: &str) -> DbResult<HashMap<String, String>> {
        let tables = self.tables.lock();
        let mut vars: HashMap<String, String> = HashMap::new();
        for scope in [GLOBAL_BRANCH, branch] {
            for ((b, name), value) in &tables.variables {
                if b == scope {
                    vars.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(vars)
    }

    async fn set_variable(&self, branch: &str, name: &str, value: &str) -> DbResult<()> {
        self.tables
            .lock()
            .variables
            .insert((branch.to_string(), name.to_string()), value.to_string());
        Ok(())
    }

    async fn system_down_message(&self) -> DbResult<Option<String>> {
        let tables = self.tables.lock();
        Ok(tables
            .variables
            .iter()
            .find(|((_, name), value)| name == SYSTEM_DOWN_VARIABLE && !value.trim().is_empty())
            .map(|(_, value)| value.clone()))
    }

    async fn record_perf(&self, machine: &str, key: &str, value: i64) -> DbResult<()> {
        self.tables.lock().perf.push(PerfSample {
            machine: machine.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn due_request(description: &str, lock: Option<&str>) -> BuildRequest {
        let mut request = BuildRequest::new(description, "ExamplePC", "main");
        request.machine_lock = lock.map(str::to_string);
        request.next_run_at = Some(Utc::now() - Duration::minutes(1));
        request
    }

    #[test]
    fn test_like_patterns() {
        assert!(like("build-%", "BUILD-07"));
        assert!(like("build-0_", "build-07"));
        assert!(!like("build-0_", "build-107"));
        assert!(like("%", ""));
        assert!(!like("ps3-%", "build-07"));
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryWorkStore::new());
        let mut request = BuildRequest::new("Example PC", "ExamplePC", "main");
        request.pending = true;
        let id = store.insert_request(request);

        let mut handles = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_triggered_build(&format!("agent-{n}"), true).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if let Some(TriggerClaim::Claimed(claimed)) = handle.await.unwrap() {
                assert_eq!(claimed.id, id);
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let row = store.request(id).unwrap();
        assert!(row.is_claimed());
        assert!(!row.pending);
    }

    #[tokio::test]
    async fn test_concurrent_job_claims_are_distinct() {
        let store = Arc::new(MemoryWorkStore::new());
        let batch = BatchId::now();
        for n in 0..4 {
            store
                .add_job(&NewSubJob {
                    name: format!("Job_{n}"),
                    command: "CookJob".into(),
                    parameter: String::new(),
                    batch,
                    game: "Example".into(),
                    platform: "PC".into(),
                    branch: "main".into(),
                    label: String::new(),
                })
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_job(&format!("agent-{n}")).await.unwrap() }));
        }
        let mut claimed: Vec<ResourceId> = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                claimed.push(job.id);
            }
        }
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 4);
    }

    #[tokio::test]
    async fn test_timed_claim_respects_machine_lock() {
        let store = MemoryWorkStore::new();
        let locked = store.insert_request(due_request("Locked", Some("ps3-%")));
        let open = store.insert_request(due_request("Open", None));

        assert!(store.claim_timed_build("build-07", false).await.unwrap().is_none());
        let claimed = store.claim_timed_build("ps3-02", false).await.unwrap().unwrap();
        assert_eq!(claimed.id, locked);
        assert_eq!(claimed.operator.as_deref(), Some(AUTO_TIMER));
        assert_eq!(claimed.next_run_at, None);

        let claimed = store.claim_timed_build("build-07", true).await.unwrap().unwrap();
        assert_eq!(claimed.id, open);
        assert!(store.claim_timed_build("build-08", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timed_claim_reschedules_repeating_request() {
        let store = MemoryWorkStore::new();
        let mut request = due_request("Nightly", None);
        request.run_interval_minutes = Some(24 * 60);
        let id = store.insert_request(request);

        store.claim_timed_build("build-07", true).await.unwrap().unwrap();
        let next = store.request(id).unwrap().next_run_at.unwrap();
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn test_trigger_of_running_build_is_consumed_as_already_building() {
        let store = MemoryWorkStore::new();
        let mut request = BuildRequest::new("Example PC", "ExamplePC", "main");
        request.machine = Some("build-01".into());
        request.pending = true;
        let id = store.insert_request(request);

        match store.claim_triggered_build("build-02", true).await.unwrap() {
            Some(TriggerClaim::AlreadyBuilding(row)) => assert_eq!(row.id, id),
            other => panic!("unexpected claim {other:?}"),
        }
        let row = store.request(id).unwrap();
        assert!(!row.pending);
        assert_eq!(row.machine.as_deref(), Some("build-01"));
        assert_eq!(
            store.trigger_build("example pc", "ana").await.unwrap(),
            TriggerOutcome::AlreadyBuilding
        );
        assert_eq!(
            store.trigger_build("Missing", "ana").await.unwrap(),
            TriggerOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_conch_single_holder_and_stale_reclaim() {
        let store = MemoryWorkStore::new();
        let first = store.insert_request(BuildRequest::new("Publish A", "PublishA", "main"));
        let second = store.insert_request(BuildRequest::new("Publish B", "PublishB", "main"));

        assert!(store.acquire_conch(first).await.unwrap());
        assert!(store.acquire_conch(first).await.unwrap());
        assert!(!store.acquire_conch(second).await.unwrap());

        store
            .set_conch_acquired_at(first, Utc::now() - Duration::minutes(61))
            .unwrap();
        // The stale holder is cleared on this poll, the token is taken on the next.
        assert!(!store.acquire_conch(second).await.unwrap());
        assert!(store.conch_holder().await.unwrap().is_none());
        assert!(store.acquire_conch(second).await.unwrap());
        assert_eq!(store.conch_holder().await.unwrap().unwrap().0, second);
    }

    #[tokio::test]
    async fn test_registration_cleans_up_previous_run() {
        let store = MemoryWorkStore::new();
        let first = store.register_agent("build-07").await.unwrap();

        let mut request = BuildRequest::new("Example PC", "ExamplePC", "main");
        request.machine = Some("build-07".into());
        let request_id = store.insert_request(request);
        let batch = BatchId::now();
        let job = store
            .add_job(&NewSubJob {
                name: "Job".into(),
                command: "CookJob".into(),
                parameter: String::new(),
                batch,
                game: String::new(),
                platform: String::new(),
                branch: "main".into(),
                label: String::new(),
            })
            .await
            .unwrap();
        store.claim_job("build-07").await.unwrap();

        let second = store.register_agent("build-07").await.unwrap();
        assert_eq!(second.zombied, 1);
        assert_eq!(second.released_requests, 1);
        assert_eq!(second.orphaned_jobs, 1);
        assert!(!store.request(request_id).unwrap().is_claimed());
        assert!(store.job(job.id).unwrap().complete);

        let agents = store.list_agents().await.unwrap();
        let old = agents.iter().find(|a| a.id == first.agent.id).unwrap();
        assert_eq!(old.state, AgentState::Zombied);
    }

    #[tokio::test]
    async fn test_batch_counts_and_kill() {
        let store = MemoryWorkStore::new();
        let batch = BatchId::now();
        let mut ids = Vec::new();
        for n in 0..3 {
            let job = store
                .add_job(&NewSubJob {
                    name: format!("Job_{n}"),
                    command: "CookJob".into(),
                    parameter: String::new(),
                    batch,
                    game: String::new(),
                    platform: String::new(),
                    branch: "main".into(),
                    label: String::new(),
                })
                .await
                .unwrap();
            ids.push(job.id);
        }

        store.mark_job_succeeded(ids[0]).await.unwrap();
        store.complete_job(ids[0]).await.unwrap();
        store.complete_job(ids[1]).await.unwrap();
        assert_eq!(
            store.batch_counts(batch).await.unwrap(),
            BatchCounts { complete: 2, succeeded: 1 }
        );

        assert_eq!(store.kill_batch(batch).await.unwrap(), 1);
        assert!(store.job(ids[2]).unwrap().killing);
    }

    #[tokio::test]
    async fn test_branch_variables_overlay_globals() {
        let store = MemoryWorkStore::new();
        store.set_variable(GLOBAL_BRANCH, "Root", "global").await.unwrap();
        store.set_variable(GLOBAL_BRANCH, "Shared", "global").await.unwrap();
        store.set_variable("main", "Shared", "main").await.unwrap();

        let vars = store.variables("main").await.unwrap();
        assert_eq!(vars["Root"], "global");
        assert_eq!(vars["Shared"], "main");
        assert!(store.system_down_message().await.unwrap().is_none());

        store.set_variable(GLOBAL_BRANCH, SYSTEM_DOWN_VARIABLE, "Maintenance").await.unwrap();
        assert_eq!(store.system_down_message().await.unwrap().as_deref(), Some("Maintenance"));
    }

    #[tokio::test]
    async fn test_run_status_is_truncated() {
        let store = MemoryWorkStore::new();
        let id = store.insert_request(BuildRequest::new("Example PC", "ExamplePC", "main"));
        let run = store.begin_build(id, "build-07", "ExamplePC").await.unwrap();
        store.set_run_status(run.id, &"y".repeat(300)).await.unwrap();
        assert_eq!(store.get_build_run(run.id).await.unwrap().status.len(), 127);
        assert_eq!(store.request(id).unwrap().build_run_id, Some(run.id));
    }
}
