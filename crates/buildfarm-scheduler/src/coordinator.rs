//! Agent coordinator.
//!
//! One coordinator runs per agent process. On a fixed tick it heartbeats the
//! agent record, advances the active run (polling for kill requests aimed at
//! it) or, when idle, claims the next piece of work:
//!
//! 1. a scheduled build locked to this machine
//! 2. a triggered build locked to this machine
//! 3. a scheduled unlocked build, unless some request is locked to this machine
//! 4. a triggered unlocked build
//! 5. a sub-job, unless some request is locked to this machine

use buildfarm_core::{AgentState, BuildRequest, Notification, ResourceId, Result, Revision, TriggerClaim, Workspace};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Collaborators;
use crate::machine::{BuildStateMachine, RunTarget};
use crate::stats;

/// Killer recorded when the agent itself stops a run.
pub const SHUTDOWN_KILLER: &str = "shutdown";

/// Why the coordinator loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    Restart,
    SystemDown,
}

/// Fires on its first check and then at most once per period.
#[derive(Debug, Clone)]
pub(crate) struct Every {
    period: Duration,
    next: Option<Instant>,
}

impl Every {
    pub(crate) fn new(period: Duration) -> Self {
        Self { period, next: None }
    }

    pub(crate) fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.next {
            Some(next) if now < next => false,
            _ => {
                self.next = Some(now + self.period);
                true
            }
        }
    }
}

pub struct AgentCoordinator {
    deps: Collaborators,
    shutdown: CancellationToken,
    agent: Option<ResourceId>,
    active: Option<BuildStateMachine>,
    heartbeat: Every,
    stats: Every,
    build_poll: Every,
    job_poll: Every,
    kill_poll: Every,
    restart_check: Every,
    system_check: Every,
}

impl AgentCoordinator {
    pub fn new(deps: Collaborators, shutdown: CancellationToken) -> Self {
        let intervals = deps.config.intervals.clone();
        Self {
            deps,
            shutdown,
            agent: None,
            active: None,
            heartbeat: Every::new(intervals.heartbeat),
            stats: Every::new(intervals.stats),
            build_poll: Every::new(intervals.build_poll),
            job_poll: Every::new(intervals.job_poll),
            kill_poll: Every::new(intervals.kill_poll),
            restart_check: Every::new(intervals.restart_check),
            system_check: Every::new(intervals.system_check),
        }
    }

    /// Register the agent and tick until shutdown, restart or system down.
    pub async fn run(&mut self) -> Result<ExitReason> {
        self.register().await?;

        let mut ticker = tokio::time::interval(self.deps.config.intervals.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break ExitReason::Shutdown,
                _ = ticker.tick() => {
                    if let Some(reason) = self.tick().await {
                        break reason;
                    }
                }
            }
        };

        if let Some(mut machine) = self.active.take() {
            info!(run_id = %machine.run_id(), "Killing active run for shutdown");
            machine.kill(SHUTDOWN_KILLER).await;
        }
        self.set_state(AgentState::Dead).await;
        info!(machine = %self.deps.config.machine, ?reason, "Agent stopped");
        Ok(reason)
    }

    /// Insert this agent's record, cleaning up after a previous crashed run.
    pub async fn register(&mut self) -> Result<ResourceId> {
        let machine = &self.deps.config.machine;
        let registration = self.deps.store.register_agent(machine).await?;
        if registration.zombied > 0 {
            warn!(
                machine = %machine,
                zombied = registration.zombied,
                released_requests = registration.released_requests,
                orphaned_jobs = registration.orphaned_jobs,
                "Cleaned up after previous agent run"
            );
        }
        info!(machine = %machine, agent_id = %registration.agent.id, "Agent registered");
        self.agent = Some(registration.agent.id);
        Ok(registration.agent.id)
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&BuildStateMachine> {
        self.active.as_ref()
    }

    /// One pass of the agent loop.
    pub async fn tick(&mut self) -> Option<ExitReason> {
        self.heartbeat().await;

        if let Some(machine) = self.active.as_mut() {
            machine.tick().await;
            if !machine.is_finished() && self.kill_poll.due() {
                self.poll_kill().await;
            }
            if self.active.as_ref().is_some_and(BuildStateMachine::is_finished) {
                self.active = None;
                self.set_state(AgentState::Connected).await;
            }
            return None;
        }

        if self.restart_check.due() && self.restart_requested().await {
            info!(machine = %self.deps.config.machine, "Restart requested");
            return Some(ExitReason::Restart);
        }
        if self.system_check.due() {
            if let Some(message) = self.system_down().await {
                warn!(message = %message, "Build farm is down");
                return Some(ExitReason::SystemDown);
            }
        }

        if let Some(target) = self.claim().await {
            self.spawn(target).await;
        }
        None
    }

    async fn heartbeat(&mut self) {
        let Some(agent) = self.agent else {
            return;
        };
        if !self.heartbeat.due() {
            return;
        }
        let sample = self.stats.due().then(|| stats::sample(&self.deps.config.root));
        if let Err(e) = self.deps.store.heartbeat(agent, sample.as_ref()).await {
            warn!(agent_id = %agent, error = %e, "Failed to heartbeat");
        }
    }

    async fn set_state(&self, state: AgentState) {
        let Some(agent) = self.agent else {
            return;
        };
        if let Err(e) = self.deps.store.set_agent_state(agent, state).await {
            warn!(agent_id = %agent, state = %state, error = %e, "Failed to set agent state");
        }
    }

    async fn restart_requested(&self) -> bool {
        let Some(agent) = self.agent else {
            return false;
        };
        match self.deps.store.restart_requested(agent).await {
            Ok(restart) => restart,
            Err(e) => {
                warn!(agent_id = %agent, error = %e, "Failed to check for restart");
                false
            }
        }
    }

    async fn system_down(&self) -> Option<String> {
        match self.deps.store.system_down_message().await {
            Ok(message) => message.filter(|m| !m.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to check system status");
                None
            }
        }
    }

    async fn poll_kill(&mut self) {
        let Some(machine) = self.active.as_mut() else {
            return;
        };
        let store = &self.deps.store;
        let name = &self.deps.config.machine;
        let polled = if machine.is_job() {
            store.poll_kill_job(name).await
        } else {
            store.poll_kill_build(name).await
        };

        match polled {
            Ok(Some(kill)) if kill.id == machine.target_id() => {
                let killer = kill.killer.unwrap_or_else(|| "unknown".to_string());
                info!(run_id = %machine.run_id(), killer = %killer, "Kill requested");
                machine.kill(&killer).await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to poll for kill requests"),
        }
    }

    async fn claim(&mut self) -> Option<RunTarget> {
        let machine = self.deps.config.machine.clone();
        if self.build_poll.due() {
            match self.claim_build(&machine).await {
                Ok(Some(request)) => return Some(RunTarget::Request(request)),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to claim build"),
            }
        }
        if self.job_poll.due() {
            match self.deps.store.machine_lock(&machine).await {
                Ok(None) => {}
                Ok(Some(locked)) => {
                    debug!(request_id = %locked, "Machine is locked to a build; not claiming jobs");
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read machine lock");
                    return None;
                }
            }
            match self.deps.store.claim_job(&machine).await {
                Ok(Some(job)) => {
                    info!(job_id = %job.id, name = %job.name, "Claimed job");
                    return Some(RunTarget::Job(job));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to claim job"),
            }
        }
        None
    }

    async fn claim_build(&self, machine: &str) -> Result<Option<BuildRequest>> {
        let store = &self.deps.store;

        if let Some(request) = store.claim_timed_build(machine, false).await? {
            info!(request_id = %request.id, build = %request.description, "Claimed scheduled build");
            return Ok(Some(request));
        }
        if let Some(request) = self.triggered(store.claim_triggered_build(machine, false).await?).await {
            return Ok(Some(request));
        }
        if store.machine_lock(machine).await?.is_none() {
            if let Some(request) = store.claim_timed_build(machine, true).await? {
                info!(request_id = %request.id, build = %request.description, "Claimed scheduled build");
                return Ok(Some(request));
            }
        }
        Ok(self.triggered(store.claim_triggered_build(machine, true).await?).await)
    }

    async fn triggered(&self, claim: Option<TriggerClaim>) -> Option<BuildRequest> {
        match claim? {
            TriggerClaim::Claimed(request) => {
                info!(request_id = %request.id, build = %request.description, "Claimed triggered build");
                Some(request)
            }
            TriggerClaim::AlreadyBuilding(request) => {
                info!(
                    request_id = %request.id,
                    build = %request.description,
                    machine = ?request.machine,
                    "Suppressing retrigger of running build"
                );
                let notification = Notification::AlreadyInProgress {
                    operator: request.operator.clone().unwrap_or_default(),
                    description: request.description.clone(),
                };
                if let Err(e) = self.deps.notifier.notify(notification).await {
                    warn!(error = %e, "Failed to send notification");
                }
                None
            }
        }
    }

    async fn spawn(&mut self, target: RunTarget) {
        self.refresh_scripts(target.branch()).await;

        match BuildStateMachine::start(self.deps.clone(), target.clone()).await {
            Ok(machine) => {
                self.active = Some(machine);
                self.set_state(AgentState::Building).await;
            }
            Err(e) => {
                error!(target = %target.description(), error = %e, "Failed to start run");
                let store = &self.deps.store;
                let released = match &target {
                    RunTarget::Request(request) => store.release_build(request.id).await.map(|_| ()),
                    RunTarget::Job(job) => store.complete_job(job.id).await,
                };
                if let Err(e) = released {
                    warn!(target = %target.description(), error = %e, "Failed to release claim");
                }
            }
        }
    }

    /// Bring the branch's build scripts up to date before a run reads them.
    async fn refresh_scripts(&self, branch: &str) {
        let config = &self.deps.config;
        let ws = Workspace {
            branch: branch.to_string(),
            client_spec: format!("{}_{}", config.machine, branch),
            root: config.workspace_root(branch),
        };
        let spec = format!("{}/...", config.script_dir);
        if let Err(e) = self.deps.scc.sync(&ws, &spec, &Revision::Head).await {
            warn!(branch, error = %e, "Failed to refresh build scripts");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::SUCCEEDED;
    use crate::testing::{BRANCH, Harness, MACHINE, MockProcess};
    use buildfarm_core::{BatchId, NewSubJob};
    use buildfarm_db::{SYSTEM_DOWN_VARIABLE, WorkStore};
    use chrono::Utc;

    fn coordinator(harness: &Harness) -> AgentCoordinator {
        AgentCoordinator::new(harness.deps(), CancellationToken::new())
    }

    async fn tick_until_idle(coordinator: &mut AgentCoordinator) {
        for _ in 0..100 {
            coordinator.tick().await;
            if !coordinator.is_busy() {
                return;
            }
        }
        panic!("run did not finish");
    }

    fn triggered(description: &str, script: &str) -> BuildRequest {
        let mut request = BuildRequest::new(description, script, BRANCH);
        request.pending = true;
        request.operator = Some("alice".to_string());
        request
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_fires_first_then_per_period() {
        let mut every = Every::new(Duration::from_secs(5));
        assert!(every.due());
        assert!(!every.due());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!every.due());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(every.due());
        assert!(!every.due());
    }

    #[tokio::test]
    async fn test_claims_and_runs_triggered_build() {
        let harness = Harness::new();
        harness.write_script("ExamplePC", "sync\n");
        let id = harness.store.insert_request(triggered("Example PC", "ExamplePC"));
        let mut coordinator = coordinator(&harness);
        let agent = coordinator.register().await.unwrap();

        coordinator.tick().await;
        assert!(coordinator.is_busy());
        assert_eq!(harness.store.request(id).unwrap().machine.as_deref(), Some(MACHINE));
        let agents = harness.store.list_agents().await.unwrap();
        assert_eq!(agents.iter().find(|a| a.id == agent).unwrap().state, AgentState::Building);

        tick_until_idle(&mut coordinator).await;

        let runs = harness.store.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, SUCCEEDED);
        assert!(!harness.store.request(id).unwrap().is_claimed());
        let agents = harness.store.list_agents().await.unwrap();
        assert_eq!(agents.iter().find(|a| a.id == agent).unwrap().state, AgentState::Connected);
        assert!(harness.scc.calls()[0].starts_with("sync Development/Builder/Scripts/..."));
    }

    #[tokio::test]
    async fn test_locked_schedule_beats_unlocked_trigger() {
        let harness = Harness::new();
        harness.store.insert_request(triggered("Anyone PC", "AnyonePC"));
        let mut locked = BuildRequest::new("Locked PC", "LockedPC", BRANCH);
        locked.machine_lock = Some("build-0%".to_string());
        locked.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let locked_id = harness.store.insert_request(locked);
        let mut coordinator = coordinator(&harness);
        coordinator.register().await.unwrap();

        coordinator.tick().await;

        assert_eq!(coordinator.active().unwrap().target_id(), locked_id);
    }

    #[tokio::test]
    async fn test_locked_agent_skips_unlocked_schedule() {
        let harness = Harness::new();
        let mut unlocked = BuildRequest::new("Nightly PC", "NightlyPC", BRANCH);
        unlocked.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let unlocked_id = harness.store.insert_request(unlocked);
        let mut locked = BuildRequest::new("Locked PC", "LockedPC", BRANCH);
        locked.machine_lock = Some(MACHINE.to_string());
        harness.store.insert_request(locked);
        let mut coordinator = coordinator(&harness);
        coordinator.register().await.unwrap();

        coordinator.tick().await;

        assert!(!coordinator.is_busy());
        assert!(!harness.store.request(unlocked_id).unwrap().is_claimed());
    }

    #[tokio::test]
    async fn test_locked_agent_skips_sub_jobs() {
        let harness = Harness::new();
        harness.write_script("CookJob", "status Cooking\n");
        let job = harness
            .store
            .add_job(&NewSubJob {
                name: "Job_Level1".to_string(),
                command: "CookJob".to_string(),
                parameter: "Level1".to_string(),
                batch: BatchId::from_raw(3),
                game: String::new(),
                platform: String::new(),
                branch: BRANCH.to_string(),
                label: String::new(),
            })
            .await
            .unwrap();
        let mut locked = BuildRequest::new("Locked PC", "LockedPC", BRANCH);
        locked.machine_lock = Some(MACHINE.to_string());
        harness.store.insert_request(locked);
        let mut coordinator = coordinator(&harness);
        coordinator.register().await.unwrap();

        coordinator.tick().await;

        assert!(!coordinator.is_busy());
        let stored = harness.store.job(job.id).unwrap();
        assert!(stored.machine.is_none());
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn test_retrigger_of_running_build_notifies_operator() {
        let harness = Harness::new();
        let mut request = triggered("Example PC", "ExamplePC");
        request.machine = Some("build-09".to_string());
        let id = harness.store.insert_request(request);
        let mut coordinator = coordinator(&harness);
        coordinator.register().await.unwrap();

        coordinator.tick().await;

        assert!(!coordinator.is_busy());
        assert!(!harness.store.request(id).unwrap().pending);
        match harness.notifier.sent().as_slice() {
            [Notification::AlreadyInProgress { operator, description }] => {
                assert_eq!(operator, "alice");
                assert_eq!(description, "Example PC");
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_claims_sub_job_when_no_builds() {
        let harness = Harness::new();
        harness.write_script("CookJob", "status Cooking\n");
        let job = harness
            .store
            .add_job(&NewSubJob {
                name: "Job_Level1".to_string(),
                command: "CookJob".to_string(),
                parameter: "Level1".to_string(),
                batch: BatchId::from_raw(3),
                game: String::new(),
                platform: String::new(),
                branch: BRANCH.to_string(),
                label: String::new(),
            })
            .await
            .unwrap();
        let mut coordinator = coordinator(&harness);
        coordinator.register().await.unwrap();

        coordinator.tick().await;
        assert!(coordinator.active().unwrap().is_job());
        tick_until_idle(&mut coordinator).await;

        let stored = harness.store.job(job.id).unwrap();
        assert!(stored.complete);
        assert!(stored.succeeded);
    }

    #[tokio::test]
    async fn test_kill_request_stops_active_run() {
        let harness = Harness::new();
        harness.write_script("ExamplePC", "cookmaps Entry\n");
        let killed = harness.launcher.push(MockProcess::hangs(true));
        let id = harness.store.insert_request(triggered("Example PC", "ExamplePC"));
        let mut coordinator = coordinator(&harness);
        coordinator.register().await.unwrap();
        coordinator.tick().await;
        coordinator.tick().await;
        assert!(coordinator.is_busy());

        assert!(harness.store.request_kill("example pc", "bob").await.unwrap());
        coordinator.tick().await;

        assert!(!coordinator.is_busy());
        assert!(killed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!harness.store.request(id).unwrap().is_claimed());
        assert!(matches!(harness.notifier.sent().as_slice(), [Notification::Killed(run)] if run.killer == "bob"));
    }

    #[tokio::test]
    async fn test_restart_request_ends_loop() {
        let harness = Harness::new();
        let mut coordinator = coordinator(&harness);
        coordinator.register().await.unwrap();
        assert!(harness.store.request_restart(MACHINE).await.unwrap());

        assert_eq!(coordinator.tick().await, Some(ExitReason::Restart));
    }

    #[tokio::test]
    async fn test_system_down_stops_claiming() {
        let harness = Harness::new();
        let id = harness.store.insert_request(triggered("Example PC", "ExamplePC"));
        harness
            .store
            .set_variable("", SYSTEM_DOWN_VARIABLE, "Farm maintenance")
            .await
            .unwrap();
        let mut coordinator = coordinator(&harness);
        coordinator.register().await.unwrap();

        assert_eq!(coordinator.tick().await, Some(ExitReason::SystemDown));
        assert!(!harness.store.request(id).unwrap().is_claimed());
    }

    #[tokio::test]
    async fn test_shutdown_marks_agent_dead() {
        let harness = Harness::new();
        let token = CancellationToken::new();
        let mut coordinator = AgentCoordinator::new(harness.deps(), token.clone());
        token.cancel();

        assert_eq!(coordinator.run().await.unwrap(), ExitReason::Shutdown);

        let agents = harness.store.list_agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].state, AgentState::Dead);
        assert!(agents[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn test_registration_zombies_previous_record() {
        let harness = Harness::new();
        let mut first = coordinator(&harness);
        let old = first.register().await.unwrap();
        let mut second = coordinator(&harness);
        let new = second.register().await.unwrap();

        let agents = harness.store.list_agents().await.unwrap();
        assert_eq!(agents.iter().find(|a| a.id == old).unwrap().state, AgentState::Zombied);
        assert_eq!(agents.iter().find(|a| a.id == new).unwrap().state, AgentState::Connected);
    }
}
