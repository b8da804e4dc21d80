//! Per-run build state machine.
//!
//! A [`BuildStateMachine`] drives one claimed build request or sub-job from
//! its first script line to Exit. The coordinator calls
//! [`BuildStateMachine::tick`] once per agent tick and each call performs at
//! most one mode step, so kill requests are noticed between any two steps.
//!
//! Modes:
//! - Init pulls the next command (pending queue first) and dispatches it
//! - Monitor polls a launched process for exit, hang and timeout
//! - Wait polls another build request's last good changelist
//! - WaitForJobs polls the completion count of this run's sub-job batch
//! - Finalise classifies the command's log and either continues or fails
//! - Exit releases everything the run holds

use buildfarm_config::script::changes;
use buildfarm_config::script::label::parse_name;
use buildfarm_config::{ExpansionContext, ScriptInterpreter, ScriptState};
use buildfarm_core::{
    AUTO_TIMER, BuildRequest, BuildRun, Command, Failure, Mode, Notification, ResourceId, Result,
    RunSummary, SubJob, TriggerOutcome,
};
use chrono::Utc;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::Collaborators;
use crate::classifier::{ClassifyOptions, Verdict, classify};
use crate::coordinator::Every;
use crate::dispatcher::{Dispatched, Dispatcher, files};
use crate::stats;
use crate::status::{self, StatusEvent, Stopwatch};
use crate::symbols::{self, SymStoreStep, SymbolUpload};

pub const SUCCEEDED: &str = "Succeeded";
pub const FAILED: &str = "Failed";
pub const KILLED: &str = "Killed";

/// What a run was claimed for.
#[derive(Debug, Clone)]
pub enum RunTarget {
    Request(BuildRequest),
    Job(SubJob),
}

impl RunTarget {
    pub fn id(&self) -> ResourceId {
        match self {
            RunTarget::Request(request) => request.id,
            RunTarget::Job(job) => job.id,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            RunTarget::Request(request) => &request.description,
            RunTarget::Job(job) => &job.name,
        }
    }

    pub fn branch(&self) -> &str {
        match self {
            RunTarget::Request(request) => &request.branch,
            RunTarget::Job(job) => &job.branch,
        }
    }

    /// Name of the build script, without extension.
    pub fn script(&self) -> &str {
        match self {
            RunTarget::Request(request) => &request.script,
            RunTarget::Job(job) => &job.command,
        }
    }
}

pub struct BuildStateMachine {
    deps: Collaborators,
    dispatcher: Dispatcher,
    target: RunTarget,
    run: BuildRun,
    state: ScriptState,
    ctx: ExpansionContext,
    script: ScriptInterpreter,
    mode: Mode,
    active: Option<Dispatched>,
    /// Exit code of the last process that ran to completion.
    exit_code: Option<i32>,
    symstore: VecDeque<SymStoreStep>,
    command_started: Instant,
    last_response: Instant,
    stopwatch: Stopwatch,
    poll: Every,
    wait_target: String,
    jobs_complete: i64,
    conch_waiting: Option<Instant>,
    conch_status: Every,
    /// Collaborator error text for the current failure.
    detail: Option<String>,
    killer: String,
    final_status: Option<&'static str>,
    cleaned_up: bool,
}

fn hms(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

impl BuildStateMachine {
    /// Open a build run for `target` and load its script.
    pub async fn start(deps: Collaborators, target: RunTarget) -> Result<Self> {
        let config = deps.config.clone();
        let (run, ctx, mut state) = match &target {
            RunTarget::Request(request) => {
                let run = deps
                    .store
                    .begin_build(request.id, &config.machine, &request.script)
                    .await?;
                let variables = deps.store.variables(&request.branch).await?;
                let mut state = ScriptState::new(&request.description, &request.branch, run.started_at);
                state.operator = request.operator.clone().unwrap_or_default();
                state.promotable = request.promotable;
                state.last_good_changelist = request.last_good_changelist;
                (run, ExpansionContext::for_request(request, variables), state)
            }
            RunTarget::Job(job) => {
                let run = deps.store.begin_job(job.id, &config.machine).await?;
                let variables = deps.store.variables(&job.branch).await?;
                let mut state = ScriptState::new(&job.name, &job.branch, run.started_at);
                state.is_job = true;
                state.batch = job.batch;
                state.label.game = job.game.clone();
                state.label.platform = job.platform.clone();
                state.dependency = job.label.clone();
                (run, ExpansionContext::for_job(job, variables), state)
            }
        };
        state.machine = config.machine.clone();
        state.operation_timeout = config.operation_timeout;
        state.responding_timeout = config.responding_timeout;

        let dispatcher = Dispatcher::new(deps.clone());
        if state.is_job && !state.dependency.is_empty() && state.label.adopt(&state.dependency.clone()) {
            let ws = dispatcher.workspace(&state);
            match deps.scc.label(&ws, &state.dependency).await {
                Ok(Some(details)) => state.label.apply_description(&details.description),
                Ok(None) => warn!(label = %state.dependency, "Job dependency label does not exist"),
                Err(e) => warn!(label = %state.dependency, error = %e, "Failed to read job dependency label"),
            }
        }

        let path = config
            .workspace_root(target.branch())
            .join(&config.script_dir)
            .join(format!("{}.txt", target.script()));
        let script = ScriptInterpreter::load(&path);
        if !script.has_script() {
            warn!(path = %path.display(), "Build script not found");
        }

        info!(run_id = %run.id, target = %target.description(), script = %target.script(), "Starting run");
        let now = Instant::now();
        let intervals = &config.intervals;
        Ok(Self {
            dispatcher,
            target,
            run,
            state,
            ctx,
            script,
            mode: Mode::Init,
            active: None,
            exit_code: None,
            symstore: VecDeque::new(),
            command_started: now,
            last_response: now,
            stopwatch: Stopwatch::default(),
            poll: Every::new(intervals.build_poll),
            wait_target: String::new(),
            jobs_complete: 0,
            conch_waiting: None,
            conch_status: Every::new(intervals.conch_status),
            detail: None,
            killer: String::new(),
            final_status: None,
            cleaned_up: false,
            deps,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> &ScriptState {
        &self.state
    }

    pub fn target(&self) -> &RunTarget {
        &self.target
    }

    pub fn target_id(&self) -> ResourceId {
        self.target.id()
    }

    pub fn is_job(&self) -> bool {
        self.state.is_job
    }

    pub fn run_id(&self) -> ResourceId {
        self.run.id
    }

    /// `Succeeded`, `Failed` or `Killed` once the run has ended.
    pub fn final_status(&self) -> Option<&'static str> {
        self.final_status
    }

    /// True once Exit cleanup has run.
    pub fn is_finished(&self) -> bool {
        self.cleaned_up
    }

    /// Advance the run by one step.
    pub async fn tick(&mut self) -> Mode {
        if self.cleaned_up {
            return Mode::Exit;
        }
        let next = match self.mode {
            Mode::Init => self.init().await,
            Mode::Monitor => self.monitor().await,
            Mode::Wait => self.wait().await,
            Mode::WaitForJobs => self.wait_for_jobs().await,
            Mode::Finalise => self.finalise().await,
            Mode::Exit => Mode::Exit,
        };
        self.mode = next;
        if next == Mode::Exit {
            self.exit().await;
        }
        next
    }

    /// Stop the run now: kill its process, flag its sub-jobs and clean up.
    pub async fn kill(&mut self, killer: &str) {
        if self.cleaned_up {
            return;
        }
        self.killer = killer.to_string();
        let line = format!("[STATUS] Killing build '{}' (requested by {killer})", self.state.description);

        if let Some(mut active) = self.active.take() {
            active.log.write(&line);
            if let Some(process) = active.process.as_mut() {
                if let Err(e) = process.kill().await {
                    warn!(run_id = %self.run.id, error = %e, "Failed to kill process");
                }
            }
            if let Some(toolchain) = &active.toolchain {
                if let Err(e) = toolchain.disable() {
                    warn!(error = %e, "Failed to disable toolchain override");
                }
            }
        } else {
            info!(target: "buildfarm::build", "{line}");
        }
        self.handle_line(&line).await;

        if self.state.jobs_dispatched > 0 {
            match self.deps.store.kill_batch(self.state.batch).await {
                Ok(flagged) => info!(batch = %self.state.batch, flagged, "Flagged sub-jobs for kill"),
                Err(e) => warn!(batch = %self.state.batch, error = %e, "Failed to flag sub-jobs for kill"),
            }
        }
        self.delete_new_label().await;
        if matches!(self.target, RunTarget::Request(_)) {
            self.notify(Notification::Killed(self.summary())).await;
        }

        self.final_status = Some(KILLED);
        self.mode = Mode::Exit;
        self.exit().await;
    }

    async fn init(&mut self) -> Mode {
        let command = match self.state.pending.pop_front() {
            Some(command) => command,
            None => {
                let parsed = self.script.parse_next_line(&mut self.state, &self.ctx);
                for notice in &parsed.notices {
                    self.announce(notice).await;
                }
                if !matches!(parsed.command, Command::Config | Command::Error | Command::Finished) {
                    self.state.command_line = self.ctx.expand(&self.state.command_line);
                }
                parsed.command
            }
        };
        self.state.command = command;

        match command {
            Command::Config => Mode::Init,
            Command::Error => {
                self.state.error.get_or_insert(Failure::IllegalCommand);
                Mode::Finalise
            }
            Command::Finished => {
                self.complete().await;
                Mode::Exit
            }
            Command::TriggerMail => {
                self.notify(Notification::Triggered(self.summary())).await;
                Mode::Init
            }
            Command::SetDependency => self.set_dependency().await,
            Command::Wait => {
                self.wait_target = self.state.command_line.clone();
                self.command_started = Instant::now();
                self.poll = Every::new(self.deps.config.intervals.build_poll);
                let line = format!(
                    "[STATUS] Waiting for '{}' to build changelist {}",
                    self.wait_target, self.state.label.changelist
                );
                self.announce(&line).await;
                Mode::Wait
            }
            Command::WaitForJobs => {
                self.jobs_complete = -1;
                self.poll = Every::new(self.deps.config.intervals.job_count);
                Mode::WaitForJobs
            }
            Command::Trigger => self.trigger().await,
            Command::UpdateLabel => {
                let value = self.state.label_name();
                self.set_branch_variable(value).await
            }
            Command::UpdateFolder => {
                let value = self.state.folder_name();
                self.set_branch_variable(value).await
            }
            Command::RedFlash => {
                let sms = self.state.sms_address.clone();
                self.notify(Notification::RedFlash { run: self.summary(), sms }).await;
                Mode::Init
            }
            Command::CheckSpace => {
                let report = stats::storage_report(&self.deps.config.storage);
                self.notify(Notification::Status { run: self.summary(), report }).await;
                Mode::Init
            }
            Command::MsvcFull => self.composite(Command::MsvcClean, Command::MsvcBuild).await,
            Command::GccFull => self.composite(Command::GccClean, Command::GccBuild).await,
            Command::ShaderFull => self.composite(Command::ShaderClean, Command::ShaderBuild).await,
            Command::UpdateSourceServer | Command::UpdateSymbolServer | Command::UpdateSymbolServerTick
                if self.state.label.platform.eq_ignore_ascii_case("ps3") =>
            {
                info!(run_id = %self.run.id, "Suppressing {command} for PS3");
                Mode::Init
            }
            Command::UpdateSourceServer => {
                self.composite(Command::UpdateSourceServer, Command::UpdateSymbolServer).await
            }
            Command::UpdateSymbolServer => self.plan_symbol_store(),
            Command::UpdateSymbolServerTick => self.symbol_store_tick().await,
            command => {
                if command.is_publish() && self.state.flags.block_on_publish && !self.acquire_conch().await {
                    self.state.pending.push_front(command);
                    return Mode::Init;
                }
                if command == Command::Conform && self.state.languages.len() > 2 {
                    self.state.pending.push_front(Command::Conform);
                }
                self.dispatch(command).await
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Mode {
        let dispatched = self.dispatcher.execute(command, &mut self.state).await;
        let mode = dispatched.mode();
        let now = Instant::now();
        self.command_started = now;
        self.last_response = now;
        self.active = Some(dispatched);
        self.exit_code = None;
        mode
    }

    /// Run `first` now and `second` straight after it.
    async fn composite(&mut self, first: Command, second: Command) -> Mode {
        self.state.pending.push_front(second);
        self.dispatch(first).await
    }

    fn plan_symbol_store(&mut self) -> Mode {
        let version = self.state.label.build_version;
        if version == 0 {
            return self.fail_command(
                Command::UpdateSymbolServer,
                "no engine version found; has BumpEngineVersion been called?".to_string(),
            );
        }
        let store = self
            .state
            .applications
            .get("symbolstore")
            .or_else(|| self.deps.config.applications.get("symbolstore"))
            .cloned();
        let Some(store) = store else {
            return self.fail_command(Command::UpdateSymbolServer, "no symbol store configured".to_string());
        };

        let label = &self.state.label;
        let binaries = symbols::binaries(&label.game, &label.platform, &self.state.build_config);
        let upload = SymbolUpload {
            store,
            platform: label.platform.clone(),
            changelist: label.changelist,
            version,
        };
        let root = self.dispatcher.workspace_root(&self.state);
        self.symstore = symbols::plan(&root, binaries, &upload);
        self.state.pending.push_front(Command::UpdateSymbolServerTick);
        Mode::Init
    }

    /// Perform the next symbol store step; each tool run is its own command.
    async fn symbol_store_tick(&mut self) -> Mode {
        let Some(step) = self.symstore.pop_front() else {
            info!(run_id = %self.run.id, "Symbol server updated");
            return Mode::Init;
        };
        self.state.pending.push_front(Command::UpdateSymbolServerTick);
        match step {
            SymStoreStep::DeleteIndexes => {
                let root = self.dispatcher.workspace_root(&self.state);
                if let Err(e) = symbols::delete_indexes(&root) {
                    warn!(run_id = %self.run.id, error = %e, "Failed to delete symbol store indexes");
                }
                Mode::Init
            }
            SymStoreStep::Status(exe) => {
                self.announce(&format!("[STATUS] Updating symbol server for '{exe}'")).await;
                Mode::Init
            }
            SymStoreStep::Run(line) => {
                self.state.command_line = line;
                self.dispatch(Command::UpdateSymbolServerTick).await
            }
        }
    }

    fn fail_command(&mut self, command: Command, detail: String) -> Mode {
        self.state.error = Some(Failure::Command(command));
        self.detail = Some(detail);
        Mode::Finalise
    }

    async fn set_dependency(&mut self) -> Mode {
        let dependency = self.state.dependency.clone();
        if dependency.is_empty() {
            return self.fail_command(Command::SetDependency, "no dependency given".to_string());
        }

        if let Ok(changelist) = dependency.parse::<i64>() {
            self.state.label.set_changelist(changelist);
            return Mode::Init;
        }

        if parse_name(&dependency).is_some() {
            let ws = self.dispatcher.workspace(&self.state);
            return match self.deps.scc.label(&ws, &dependency).await {
                Ok(Some(details)) => {
                    self.state.label.adopt(&dependency);
                    self.state.label.apply_description(&details.description);
                    Mode::Init
                }
                Ok(None) => self.fail_command(Command::SetDependency, format!("non existent label '{dependency}'")),
                Err(e) => self.fail_command(Command::SetDependency, e.to_string()),
            };
        }

        match self.deps.store.find_build_request(&dependency).await {
            Ok(Some(request)) => {
                self.state.label.set_changelist(request.last_good_changelist);
                Mode::Init
            }
            Ok(None) => self.fail_command(Command::SetDependency, format!("unknown dependency '{dependency}'")),
            Err(e) => self.fail_command(Command::SetDependency, e.to_string()),
        }
    }

    async fn trigger(&mut self) -> Mode {
        let description = self.state.command_line.clone();
        let operator = if self.state.operator.is_empty() {
            AUTO_TIMER.to_string()
        } else {
            self.state.operator.clone()
        };

        match self.deps.store.trigger_build(&description, &operator).await {
            Ok(TriggerOutcome::Triggered) => {
                self.announce(&format!("[STATUS] Triggered '{description}'")).await;
                Mode::Init
            }
            Ok(TriggerOutcome::AlreadyBuilding) => {
                self.announce(&format!("[STATUS] Suppressing retrigger of '{description}'"))
                    .await;
                self.notify(Notification::AlreadyInProgress { operator, description })
                    .await;
                Mode::Init
            }
            Ok(TriggerOutcome::NotFound) => {
                self.fail_command(Command::Trigger, format!("no build request named '{description}'"))
            }
            Err(e) => self.fail_command(Command::Trigger, e.to_string()),
        }
    }

    async fn set_branch_variable(&mut self, value: String) -> Mode {
        let command = self.state.command;
        let name = self.state.command_line.trim().to_string();
        if name.is_empty() {
            return self.fail_command(command, "no variable name given".to_string());
        }
        match self
            .deps
            .store
            .set_variable(&self.state.branch, &name, &value)
            .await
        {
            Ok(()) => {
                info!(branch = %self.state.branch, name = %name, value = %value, "Updated branch variable");
                Mode::Init
            }
            Err(e) => self.fail_command(command, e.to_string()),
        }
    }

    /// Take the bandwidth conch for a publish, reporting the wait while it is
    /// held elsewhere.
    async fn acquire_conch(&mut self) -> bool {
        let RunTarget::Request(request) = &self.target else {
            return true;
        };
        let id = request.id;
        match self.deps.store.acquire_conch(id).await {
            Ok(true) => {
                self.conch_waiting = None;
                self.conch_status = Every::new(self.deps.config.intervals.conch_status);
                self.announce("[STATUS] Network bandwidth acquired - publishing!").await;
                true
            }
            Ok(false) => {
                let since = *self.conch_waiting.get_or_insert_with(Instant::now);
                if self.conch_status.due() {
                    let line = format!("[STATUS] Waiting for network bandwidth ( {} )", hms(since.elapsed()));
                    self.announce(&line).await;
                }
                false
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "Failed to acquire conch");
                false
            }
        }
    }

    async fn release_conch(&self) {
        if let RunTarget::Request(request) = &self.target {
            if let Err(e) = self.deps.store.release_conch(request.id).await {
                warn!(request_id = %request.id, error = %e, "Failed to release conch");
            }
        }
    }

    async fn monitor(&mut self) -> Mode {
        let command = self.state.command;
        let Some(active) = self.active.as_mut() else {
            return Mode::Finalise;
        };
        let Some(process) = active.process.as_mut() else {
            return Mode::Finalise;
        };

        let finished = process.is_finished();
        let lines: Vec<String> = process.drain_output().into_iter().map(|l| l.content).collect();
        let exit_code = process.exit_code();
        let responding = !finished && process.is_responding();
        for line in &lines {
            active.log.write(line);
        }
        for line in &lines {
            self.handle_line(line).await;
        }

        if finished {
            self.exit_code = exit_code;
            if let Some(code) = exit_code.filter(|code| *code != 0) {
                self.state.error.get_or_insert(Failure::Command(command));
                self.detail.get_or_insert_with(|| format!("exited with code {code}"));
            }
            return Mode::Finalise;
        }

        let now = Instant::now();
        if responding {
            self.last_response = now;
        }
        let failure = if now.duration_since(self.command_started) > self.state.operation_timeout {
            Failure::TimedOut
        } else if now.duration_since(self.last_response) > self.state.responding_timeout {
            Failure::Crashed
        } else {
            return Mode::Monitor;
        };

        self.state.error = Some(failure);
        if let Some(active) = self.active.as_mut() {
            active.log.write(&format!("Error, {command}: {failure}; killing process"));
            if let Some(process) = active.process.as_mut() {
                if let Err(e) = process.kill().await {
                    warn!(run_id = %self.run.id, error = %e, "Failed to kill process");
                }
            }
        }
        Mode::Finalise
    }

    async fn wait(&mut self) -> Mode {
        if self.command_started.elapsed() > self.state.operation_timeout {
            self.state.error = Some(Failure::WaitTimedOut);
            return Mode::Finalise;
        }
        if !self.poll.due() {
            return Mode::Wait;
        }

        match self.deps.store.find_build_request(&self.wait_target).await {
            Ok(Some(other)) if other.last_good_changelist >= self.state.label.changelist => {
                let line = format!(
                    "[STATUS] '{}' has built changelist {}",
                    other.description, other.last_good_changelist
                );
                self.announce(&line).await;
                Mode::Finalise
            }
            Ok(Some(_)) => Mode::Wait,
            Ok(None) => {
                let detail = format!("no build request named '{}'", self.wait_target);
                self.fail_command(Command::Wait, detail)
            }
            Err(e) => {
                warn!(target = %self.wait_target, error = %e, "Failed to poll waited-on build");
                Mode::Wait
            }
        }
    }

    async fn wait_for_jobs(&mut self) -> Mode {
        if !self.poll.due() {
            return Mode::WaitForJobs;
        }
        let expected = i64::from(self.state.jobs_dispatched);
        let counts = match self.deps.store.batch_counts(self.state.batch).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(batch = %self.state.batch, error = %e, "Failed to count batch");
                return Mode::WaitForJobs;
            }
        };

        if counts.complete != self.jobs_complete {
            self.jobs_complete = counts.complete;
            let line = format!("[STATUS] {} of {} job(s) complete", counts.complete, expected);
            self.announce(&line).await;
        }
        if counts.complete < expected {
            return Mode::WaitForJobs;
        }
        if counts.succeeded < expected {
            self.state.error = Some(Failure::FailedJobs);
            self.detail = Some(format!("{} of {} job(s) failed", expected - counts.succeeded, expected));
        }
        Mode::Finalise
    }

    async fn finalise(&mut self) -> Mode {
        let command = self.state.command;
        let mut active = self.active.take();

        if let Some(toolchain) = active.as_ref().and_then(|a| a.toolchain.as_ref()) {
            if let Err(e) = toolchain.disable() {
                warn!(error = %e, "Failed to disable toolchain override");
            }
        }
        if command.is_publish() && self.state.flags.block_on_publish {
            self.release_conch().await;
        }

        let mut excerpt = String::new();
        if let Some(active) = &active {
            if let Some(failure) = active.failure {
                self.state.error.get_or_insert(failure);
            }
            if let Some(detail) = &active.detail {
                self.detail.get_or_insert_with(|| detail.clone());
            }

            let mut options = ClassifyOptions {
                report_entire_log: false,
                check_cook: command == Command::CookMaps,
                check_publish: command.is_publish(),
                check_errors: self.state.flags.check_errors,
                check_warnings: self.state.flags.check_warnings,
            };
            if self.state.error.is_none() {
                let classification = classify(active.log.contents(), &options);
                let failed_with = match classification.verdict {
                    Verdict::Succeeded => None,
                    Verdict::Failed => Some(classification.excerpt),
                    Verdict::MissingCookMarker => Some("Could not find cooking successful message".to_string()),
                    Verdict::MissingPublishMarker => Some("Could not find publish completion message".to_string()),
                };
                if let Some(text) = failed_with {
                    self.state.error = Some(Failure::Command(command));
                    excerpt = text;
                }
            } else {
                options.report_entire_log = command.is_source_control();
                options.check_cook = false;
                options.check_publish = false;
                let classification = classify(active.log.contents(), &options);
                if classification.verdict != Verdict::Succeeded {
                    excerpt = classification.excerpt;
                }
            }
        }

        let Some(failure) = self.state.error else {
            self.command_succeeded(command).await;
            self.detail = None;
            return Mode::Init;
        };

        if command == Command::CheckSigned && matches!(failure, Failure::Command(_) | Failure::Process) {
            self.state.error = None;
            if self.exit_code.is_some_and(|code| code != 0) {
                self.announce("[STATUS] Signature check failed; signing").await;
                self.state.pending.push_front(Command::Sign);
            } else {
                let detail = self.detail.as_deref().unwrap_or("no exit code");
                warn!(run_id = %self.run.id, detail, "Signature check did not complete; not signing");
            }
            self.detail = None;
            return Mode::Init;
        }

        if let Some(active) = active.as_mut() {
            let archive = self.deps.config.failed_log_dir.clone();
            match active.log.copy_to(&archive) {
                Ok(path) => info!(path = %path.display(), "Archived failed command log"),
                Err(e) => warn!(dir = %archive.display(), error = %e, "Failed to archive command log"),
            }
        }
        let message = self.failure_message(failure, excerpt).await;
        self.fail(failure, message).await;
        Mode::Exit
    }

    async fn command_succeeded(&mut self, command: Command) {
        let store = &self.deps.store;
        match command {
            Command::Sync | Command::ArtistSync => {
                if let Err(e) = store.set_run_changelist(self.run.id, self.state.label.changelist).await {
                    warn!(run_id = %self.run.id, error = %e, "Failed to record run changelist");
                }
            }
            Command::Submit if self.state.flags.create_label => {
                let label = self.state.label_name();
                let mut names = vec!["LatestRawBuild"];
                if self.state.promotable {
                    names.push("LatestBuild");
                }
                for name in names {
                    if let Err(e) = store.set_variable(&self.state.branch, name, &label).await {
                        warn!(name, error = %e, "Failed to record latest build");
                    }
                }
            }
            _ => {}
        }
    }

    async fn failure_message(&self, failure: Failure, excerpt: String) -> String {
        let command = self.state.command;
        let detail = self.detail.clone().unwrap_or_default();
        match failure {
            Failure::NoScript => format!("Could not find build script '{}'", self.target.script()),
            Failure::IllegalCommand => format!("Illegal command: '{}'", self.state.command_line),
            Failure::Process => format!("Failed to start '{command}': {detail}"),
            Failure::TimedOut => format!(
                "'{command}' timed out after {} minute(s)",
                self.state.operation_timeout.as_secs() / 60
            ),
            Failure::Crashed => format!(
                "'{command}' stopped responding for {} minute(s) and was killed",
                self.state.responding_timeout.as_secs() / 60
            ),
            Failure::WaitTimedOut => format!(
                "Timed out waiting for '{}' to build changelist {}",
                self.wait_target, self.state.label.changelist
            ),
            Failure::FailedJobs => {
                let mut message = detail;
                if let Some(description) = self.dependency_description().await {
                    message.push_str("\n\n");
                    message.push_str(description.trim_end());
                }
                message
            }
            Failure::Command(_) if !excerpt.is_empty() => excerpt,
            Failure::Command(_) if !detail.is_empty() => format!("{command} failed: {detail}"),
            Failure::Command(_) => format!("{command} failed"),
        }
    }

    async fn dependency_description(&self) -> Option<String> {
        if self.state.dependency.is_empty() {
            return None;
        }
        let ws = self.dispatcher.workspace(&self.state);
        match self.deps.scc.label(&ws, &self.state.dependency).await {
            Ok(details) => details.map(|d| d.description),
            Err(e) => {
                warn!(label = %self.state.dependency, error = %e, "Failed to read dependency label");
                None
            }
        }
    }

    async fn fail(&mut self, failure: Failure, message: String) {
        info!(run_id = %self.run.id, failure = %failure, "Run failed");
        let first_line = message.lines().next().unwrap_or_default().to_string();
        self.set_status(&first_line).await;

        if self.state.is_job {
            self.report_to_dependency(&first_line).await;
        } else {
            let cc_it = self.state.command.is_publish();
            self.notify(Notification::Failed {
                run: self.summary(),
                message,
                cc_it,
            })
            .await;
        }
        self.delete_new_label().await;
        self.final_status = Some(FAILED);
    }

    /// Append a sub-job failure to the dependency label the parent reads.
    async fn report_to_dependency(&self, message: &str) {
        let Some(description) = self.dependency_description().await else {
            return;
        };
        let ws = self.dispatcher.workspace(&self.state);
        let updated = format!(
            "{}\nJob failed: {}: {}\n",
            description.trim_end(),
            self.state.description,
            message
        );
        if let Err(e) = self
            .deps
            .scc
            .update_label_description(&ws, &self.state.dependency, &updated)
            .await
        {
            warn!(label = %self.state.dependency, error = %e, "Failed to record job failure on label");
        }
    }

    async fn delete_new_label(&mut self) {
        if !self.state.flags.new_label_created {
            return;
        }
        let label = self.state.label_name();
        let ws = self.dispatcher.workspace(&self.state);
        match self.deps.scc.delete_label(&ws, &label).await {
            Ok(()) => info!(label = %label, "Deleted label created by failed run"),
            Err(e) => warn!(label = %label, error = %e, "Failed to delete label"),
        }
        self.state.flags.new_label_created = false;
    }

    /// The script ran to its end.
    async fn complete(&mut self) {
        let flags = self.state.flags;
        let changelist = self.state.label.changelist;
        let last_good = self.state.last_good_changelist;
        let labelled = flags.new_label_created || flags.promoting;

        match &self.target {
            RunTarget::Request(request) => {
                let store = &self.deps.store;
                if changelist > last_good {
                    let label = labelled.then(|| self.reported_label());
                    if let Err(e) = store
                        .set_last_good(request.id, changelist, Utc::now(), label.as_deref())
                        .await
                    {
                        warn!(request_id = %request.id, error = %e, "Failed to record last good build");
                    }
                }
                if labelled {
                    if let Err(e) = store.set_run_label(self.run.id, &self.reported_label()).await {
                        warn!(run_id = %self.run.id, error = %e, "Failed to record run label");
                    }
                }

                let summary = self.summary();
                let mail = if flags.promoting {
                    Some(Notification::Promoted(summary.clone()))
                } else if flags.publishing {
                    Some(Notification::Published(summary.clone()))
                } else if flags.building {
                    if last_good > 0 && changelist <= last_good {
                        Some(Notification::UpToDate(summary.clone()))
                    } else {
                        Some(Notification::Succeeded(summary.clone()))
                    }
                } else if flags.making_install {
                    Some(Notification::InstallMade(summary.clone()))
                } else {
                    None
                };
                if let Some(mail) = mail {
                    self.notify(mail).await;
                }
                if flags.sending_qa_changes && !self.state.changes.is_empty() {
                    let submitters = changes::submitters(&self.state.changes);
                    self.notify(Notification::QaChanges { run: summary, submitters }).await;
                }
            }
            RunTarget::Job(job) => {
                if let Err(e) = self.deps.store.mark_job_succeeded(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to mark job succeeded");
                }
            }
        }

        info!(run_id = %self.run.id, changelist, "Run succeeded");
        self.final_status = Some(SUCCEEDED);
    }

    /// Universal cleanup; runs once however the run ended.
    async fn exit(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        let config = self.deps.config.clone();
        let ws = self.dispatcher.workspace(&self.state);

        if self.state.flags.files_checked_out {
            match self.deps.scc.revert(&ws, "...").await {
                Ok(()) => info!(client = %ws.client_spec, "Reverted outstanding checkouts"),
                Err(e) => warn!(client = %ws.client_spec, error = %e, "Failed to revert checkouts"),
            }
            self.state.flags.files_checked_out = false;
        }
        for spec in std::mem::take(&mut self.state.made_writable) {
            if let Err(e) = files::set_read_only(&ws.root, &spec, true) {
                warn!(spec = %spec, error = %e, "Failed to restore read-only flags");
            }
        }
        for name in &config.kill_list {
            if let Err(e) = self.deps.launcher.kill_by_name(name).await {
                warn!(process = %name, error = %e, "Failed to kill helper process");
            }
        }

        let status = self.final_status.unwrap_or(FAILED);
        self.final_status = Some(status);
        match &self.target {
            RunTarget::Request(request) => {
                if let Err(e) = self.deps.store.release_build(request.id).await {
                    warn!(request_id = %request.id, error = %e, "Failed to release build request");
                }
            }
            RunTarget::Job(job) => {
                if let Err(e) = self.deps.store.complete_job(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to complete job");
                }
            }
        }
        if let Err(e) = self.deps.store.finish_run(self.run.id, status).await {
            warn!(run_id = %self.run.id, error = %e, "Failed to close build run");
        }

        if let RunTarget::Request(request) = &self.target {
            if request.looping && status != KILLED {
                let operator = request.operator.as_deref().unwrap_or(AUTO_TIMER);
                match self.deps.store.trigger_build(&request.description, operator).await {
                    Ok(outcome) => info!(request = %request.description, ?outcome, "Retriggered looping build"),
                    Err(e) => warn!(request = %request.description, error = %e, "Failed to retrigger looping build"),
                }
            }
        }
        info!(run_id = %self.run.id, status, "Run finished");
    }

    fn reported_label(&self) -> String {
        if self.state.dependency.is_empty() {
            self.state.label_name()
        } else {
            self.state.dependency.clone()
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            description: self.state.description.clone(),
            machine: self.state.machine.clone(),
            operator: self.state.operator.clone(),
            killer: self.killer.clone(),
            started_at: self.run.started_at,
            ended_at: Some(Utc::now()),
            changelist: self.state.label.changelist,
            label: self.reported_label(),
            folder: self.state.folder_name(),
            trigger_address: self.state.trigger_address.clone(),
            fail_address: self.state.fail_address.clone(),
            success_address: self.state.success_address.clone(),
            changes: changes::collate(&self.state.changes, &self.state.reports),
            is_job: self.state.is_job,
        }
    }

    /// Log an interpreter line and act on any marker in it.
    async fn announce(&mut self, line: &str) {
        info!(target: "buildfarm::build", "{line}");
        self.handle_line(line).await;
    }

    async fn handle_line(&mut self, line: &str) {
        match status::inspect(line) {
            Some(StatusEvent::Status(text)) => self.set_status(&text).await,
            Some(StatusEvent::WatchStart(key)) => self.stopwatch.start(key),
            Some(StatusEvent::WatchStop) => {
                if let Some((key, millis)) = self.stopwatch.stop() {
                    self.record_perf(&key, millis).await;
                }
            }
            Some(StatusEvent::WatchTime { key, value }) => self.record_perf(&key, value).await,
            Some(StatusEvent::Glitch) => {
                self.notify(Notification::Glitch {
                    machine: self.state.machine.clone(),
                    line: line.to_string(),
                })
                .await;
            }
            None => {}
        }
    }

    async fn set_status(&mut self, status: &str) {
        self.state.status = status.to_string();
        if let Err(e) = self.deps.store.set_run_status(self.run.id, status).await {
            warn!(run_id = %self.run.id, error = %e, "Failed to update run status");
        }
    }

    async fn record_perf(&self, key: &str, millis: i64) {
        if let Err(e) = self.deps.store.record_perf(&self.state.machine, key, millis).await {
            warn!(key, error = %e, "Failed to record performance data");
        }
    }

    async fn notify(&self, notification: Notification) {
        if let Err(e) = self.deps.notifier.notify(notification).await {
            warn!(run_id = %self.run.id, error = %e, "Failed to send notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BRANCH, HEAD, Harness, MACHINE, MockProcess};
    use buildfarm_core::{BuildRequest, NewSubJob, SubJob};
    use buildfarm_db::WorkStore;
    use std::sync::atomic::Ordering;

    const SCRIPT: &str = "ExamplePC";

    fn request() -> BuildRequest {
        let mut request = BuildRequest::new("Example PC", SCRIPT, BRANCH);
        request.machine = Some(MACHINE.to_string());
        request.operator = Some("alice".to_string());
        request
    }

    async fn start(harness: &Harness, target: RunTarget) -> BuildStateMachine {
        if let RunTarget::Request(request) = &target {
            harness.store.insert_request(request.clone());
        }
        BuildStateMachine::start(harness.deps(), target).await.unwrap()
    }

    async fn run_to_end(machine: &mut BuildStateMachine) {
        for _ in 0..100 {
            if machine.tick().await == Mode::Exit {
                return;
            }
        }
        panic!("run did not finish");
    }

    async fn tick_until(machine: &mut BuildStateMachine, mode: Mode) {
        for _ in 0..100 {
            if machine.tick().await == mode {
                return;
            }
        }
        panic!("run never reached {mode}");
    }

    fn run_status(harness: &Harness, machine: &BuildStateMachine) -> String {
        harness
            .store
            .runs()
            .into_iter()
            .find(|r| r.id == machine.run_id())
            .map(|r| r.status)
            .unwrap()
    }

    #[tokio::test]
    async fn test_sync_checkout_submit_succeeds() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "sync\ncheckout Foo/Bar.txt\nsubmit\n");
        let request = request();
        let id = request.id;
        let mut machine = start(&harness, RunTarget::Request(request)).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        assert!(machine.state().pending.is_empty());
        assert!(machine.state().error.is_none());
        assert!(!machine.state().flags.files_checked_out);
        let calls = harness.scc.calls();
        assert_eq!(calls[0], "sync ...#head");
        assert!(calls.contains(&"checkout Foo/Bar.txt".to_string()));
        assert!(calls.iter().any(|c| c.starts_with("submit [BUILDER] 'Example PC' built from changelist 4321")));
        assert!(!calls.iter().any(|c| c.starts_with("revert")));

        assert_eq!(run_status(&harness, &machine), SUCCEEDED);
        let stored = harness.store.request(id).unwrap();
        assert!(!stored.is_claimed());
        assert_eq!(stored.last_good_changelist, HEAD);
        assert!(matches!(harness.notifier.sent().as_slice(), [Notification::Succeeded(_)]));
        assert_eq!(*harness.launcher.killed_names.lock(), vec!["mspdbsrv".to_string()]);
    }

    #[tokio::test]
    async fn test_submit_resolves_once_then_gives_up() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "checkout Foo/Bar.txt\nsubmit\n");
        *harness.scc.resolves_needed.lock() = 2;
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(FAILED));
        assert_eq!(machine.state().error, Some(Failure::Command(Command::Submit)));
        let calls = harness.scc.calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("submit")).count(), 2);
        assert!(calls.contains(&"resolve".to_string()));
        assert!(calls.contains(&"revert ...".to_string()), "checkouts reverted at exit");
    }

    #[tokio::test]
    async fn test_up_to_date_build_mails_up_to_date() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "sync\ncheckout Foo/Bar.txt\nsubmit\n");
        let mut request = request();
        request.last_good_changelist = HEAD;
        let mut machine = start(&harness, RunTarget::Request(request)).await;

        run_to_end(&mut machine).await;

        assert!(matches!(harness.notifier.sent().as_slice(), [Notification::UpToDate(_)]));
    }

    #[tokio::test]
    async fn test_illegal_command_fails_run() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "game Example\nfrobnicate now\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(FAILED));
        assert_eq!(machine.state().error, Some(Failure::IllegalCommand));
        match harness.notifier.sent().as_slice() {
            [Notification::Failed { message, cc_it, .. }] => {
                assert_eq!(message, "Illegal command: 'frobnicate now'");
                assert!(!cc_it);
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
        assert_eq!(run_status(&harness, &machine), FAILED);
    }

    #[tokio::test]
    async fn test_missing_script_fails_run() {
        let harness = Harness::new();
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.state().error, Some(Failure::NoScript));
        assert_eq!(machine.final_status(), Some(FAILED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_process_is_killed_as_crashed() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "cookmaps Entry\n");
        let killed = harness.launcher.push(MockProcess::hangs(false));
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        assert_eq!(machine.tick().await, Mode::Monitor);
        assert_eq!(machine.tick().await, Mode::Monitor);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(machine.tick().await, Mode::Finalise);
        run_to_end(&mut machine).await;

        assert!(killed.load(Ordering::SeqCst));
        assert_eq!(machine.state().error, Some(Failure::Crashed));
        assert_eq!(machine.final_status(), Some(FAILED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_timeout_is_not_reported_as_crash() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "cookmaps Entry\n");
        let killed = harness.launcher.push(MockProcess::hangs(true));
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        assert_eq!(machine.tick().await, Mode::Monitor);
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(25)).await;
            machine.tick().await;
        }
        run_to_end(&mut machine).await;

        assert!(killed.load(Ordering::SeqCst));
        assert_eq!(machine.state().error, Some(Failure::TimedOut));
    }

    #[tokio::test]
    async fn test_cook_without_success_marker_fails() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "cookmaps Entry\n");
        harness.launcher.push(MockProcess::exits(0, &["Cooking Entry"]));
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.state().error, Some(Failure::Command(Command::CookMaps)));
        match harness.notifier.sent().as_slice() {
            [Notification::Failed { message, .. }] => {
                assert_eq!(message, "Could not find cooking successful message");
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
        let archived = harness.config.failed_log_dir.read_dir().unwrap().count();
        assert_eq!(archived, 1);
    }

    #[tokio::test]
    async fn test_cook_with_success_marker_succeeds() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "watchstart Cook\ncookmaps Entry\nwatchstop\n");
        harness
            .launcher
            .push(MockProcess::exits(0, &["[STATUS] Cooking Entry", "Success - 0 error(s)"]));
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        let perf = harness.store.perf();
        assert_eq!(perf.len(), 1);
        assert_eq!(perf[0].key, "Cook");
        assert_eq!(perf[0].machine, MACHINE);
    }

    #[tokio::test]
    async fn test_failed_signature_check_signs() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "checksigned Binaries/Game.exe\n");
        harness.launcher.push(MockProcess::exits(1, &["SignTool Error: No signature found."]));
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        let started = harness.launcher.started();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].args, vec!["sign", "/a", "/v", "Binaries/Game.exe"]);
    }

    #[tokio::test]
    async fn test_signature_check_that_cannot_start_does_not_sign() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "checksigned Binaries/Game.exe\nstatus Done\n");
        harness.launcher.refuse_start.store(true, Ordering::SeqCst);
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        assert!(machine.state().error.is_none());
        assert!(harness.launcher.started().is_empty());
        assert_eq!(machine.state().status, "Done");
    }

    #[tokio::test]
    async fn test_signature_check_with_clean_exit_does_not_sign() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "checksigned Binaries/Game.exe\n");
        harness
            .launcher
            .push(MockProcess::exits(0, &["SignTool Error: WinVerifyTrust returned error"]));
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        assert_eq!(harness.launcher.started().len(), 1);
    }

    #[tokio::test]
    async fn test_signature_check_without_file_does_not_sign() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "checksigned\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        assert!(harness.launcher.started().is_empty());
    }

    const VERSION_FILE: &str = "Development/Src/Core/Inc/UnVersion.h";

    fn symbol_harness() -> Harness {
        let mut harness = Harness::new();
        harness.config.applications.insert("symstore".to_string(), "/opt/symstore".to_string());
        harness
            .config
            .applications
            .insert("symbolstore".to_string(), "//symbols/store".to_string());
        let version = harness.workspace().join(VERSION_FILE);
        std::fs::create_dir_all(version.parent().unwrap()).unwrap();
        std::fs::write(version, "#define ENGINE_VERSION 612\n").unwrap();
        harness
    }

    #[tokio::test]
    async fn test_source_server_update_stores_symbols() {
        let harness = symbol_harness();
        harness.write_script(
            SCRIPT,
            &format!("versionfile {VERSION_FILE}\ngetengineversion\ngame Example\nplatform PC\nbuildconfig Release\nupdatesourceserver\n"),
        );
        std::fs::write(harness.workspace().join(symbols::EXE_INDEX), "stale").unwrap();
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        let started = harness.launcher.started();
        assert_eq!(started.len(), 5);
        assert!(started[1..].iter().all(|s| s.program == "/opt/symstore"));
        assert!(started[1].args.contains(&"exe_index.txt".to_string()));
        assert!(started[2].args.contains(&"pdb_index.txt".to_string()));
        let store = &started[3].args;
        assert!(store.contains(&"//symbols/store".to_string()));
        assert!(store.contains(&"UnrealEngine3-PC".to_string()));
        assert!(store.contains(&"612".to_string()));
        assert_eq!(
            machine.state().status,
            "Updating symbol server for 'Binaries/ExampleGame.exe'"
        );
        assert!(!harness.workspace().join(symbols::EXE_INDEX).exists());
    }

    #[tokio::test]
    async fn test_symbol_server_needs_engine_version() {
        let harness = symbol_harness();
        harness.write_script(SCRIPT, "game Example\nplatform PC\nbuildconfig Release\nupdatesymbolserver\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(FAILED));
        assert_eq!(harness.launcher.started().len(), 1);
    }

    #[tokio::test]
    async fn test_source_server_is_skipped_on_ps3() {
        let harness = symbol_harness();
        harness.write_script(SCRIPT, "game Example\nplatform PS3\nupdatesourceserver\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        assert!(harness.launcher.started().is_empty());
    }

    #[tokio::test]
    async fn test_localized_checkout_narrows_languages() {
        let harness = Harness::new();
        harness
            .scc
            .missing
            .lock()
            .insert("ExampleGame/Content/Sounds/FRA/Dialog_FRA.upk".to_string());
        harness.write_script(SCRIPT, "languages INT FRA DEU\ncheckoutdialog Example Dialog\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        assert_eq!(machine.state().languages, vec!["INT".to_string(), "DEU".to_string()]);
        let calls = harness.scc.calls();
        assert!(calls.contains(&"checkout ExampleGame/Content/Sounds/INT/Dialog.upk".to_string()));
        assert!(calls.contains(&"checkout ExampleGame/Content/Sounds/DEU/Dialog_DEU.upk".to_string()));
    }

    #[tokio::test]
    async fn test_gdf_checkout_needs_game_and_resources() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "languages INT\ncheckoutgdf Example\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(FAILED));
        assert!(!harness.scc.calls().iter().any(|c| c.starts_with("checkout ")));
    }

    #[tokio::test]
    async fn test_unreal_game_job_names_game_and_config() {
        let harness = Harness::new();
        harness.write_script(
            SCRIPT,
            "platform PC\naddunrealgamejob Release Example ext\naddunrealfullgamejob Debug Example\n",
        );
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        let jobs = harness.store.jobs_in_batch(machine.state().batch);
        assert_eq!(jobs.len(), 2);
        let game = jobs.iter().find(|j| j.name == "Job_Example_PC_Release").unwrap();
        assert_eq!(game.command, "Jobs/UnrealGameJob_ext");
        assert_eq!(game.parameter, "Release");
        let full = jobs.iter().find(|j| j.name == "Job_Example_PC_Debug").unwrap();
        assert_eq!(full.command, "Jobs/UnrealFullGameJob");
    }

    #[tokio::test]
    async fn test_wait_for_jobs_joins_batch() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "addjob CookJob Level1\naddjob CookJob Level2\nwaitforjobs\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        tick_until(&mut machine, Mode::WaitForJobs).await;
        let jobs = harness.store.jobs_in_batch(machine.state().batch);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs.iter().filter(|j| j.name == "Job_Level1").count(), 1);

        harness.store.mark_job_succeeded(jobs[0].id).await.unwrap();
        harness.store.complete_job(jobs[0].id).await.unwrap();
        assert_eq!(machine.tick().await, Mode::WaitForJobs);
        assert_eq!(machine.tick().await, Mode::WaitForJobs);

        harness.store.mark_job_succeeded(jobs[1].id).await.unwrap();
        harness.store.complete_job(jobs[1].id).await.unwrap();
        assert_eq!(machine.tick().await, Mode::Finalise);
        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
    }

    #[tokio::test]
    async fn test_wait_for_jobs_reports_failed_jobs() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "addjob CookJob Level1\naddjob CookJob Level2\nwaitforjobs\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        tick_until(&mut machine, Mode::WaitForJobs).await;
        let jobs = harness.store.jobs_in_batch(machine.state().batch);
        harness.store.mark_job_succeeded(jobs[0].id).await.unwrap();
        for job in &jobs {
            harness.store.complete_job(job.id).await.unwrap();
        }
        run_to_end(&mut machine).await;

        assert_eq!(machine.state().error, Some(Failure::FailedJobs));
        match harness.notifier.sent().as_slice() {
            [Notification::Failed { message, .. }] => assert_eq!(message, "1 of 2 job(s) failed"),
            other => panic!("unexpected notifications: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_job_reports_on_dependency_label() {
        let harness = Harness::new();
        let label = "Main_[2024-03-01_17.45]";
        harness.scc.add_label(label, "Label created automatically by the build farm\nchangelist: 1200\n");
        harness.write_script("CookJob", "frobnicate\n");

        let job = harness
            .store
            .add_job(&NewSubJob {
                name: "Job_Example_PC_Level1".to_string(),
                command: "CookJob".to_string(),
                parameter: "Level1".to_string(),
                batch: buildfarm_core::BatchId::from_raw(7),
                game: "Example".to_string(),
                platform: "PC".to_string(),
                branch: BRANCH.to_string(),
                label: label.to_string(),
            })
            .await
            .unwrap();
        let job: SubJob = harness.store.claim_job(MACHINE).await.unwrap().unwrap_or(job);
        let id = job.id;
        let mut machine = start(&harness, RunTarget::Job(job)).await;
        assert_eq!(machine.state().label.changelist, 1200);

        run_to_end(&mut machine).await;

        assert!(harness.notifier.sent().is_empty(), "sub-jobs never mail");
        let description = harness.scc.labels.lock().get(label).unwrap().description.clone();
        assert!(description.contains("Job failed: Job_Example_PC_Level1: Illegal command: 'frobnicate'"));
        let stored = harness.store.job(id).unwrap();
        assert!(stored.complete);
        assert!(!stored.succeeded);
    }

    #[tokio::test]
    async fn test_kill_stops_process_and_mails_killer() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "cookmaps Entry\n");
        let killed = harness.launcher.push(MockProcess::hangs(true));
        let request = request();
        let id = request.id;
        let mut machine = start(&harness, RunTarget::Request(request)).await;
        assert_eq!(machine.tick().await, Mode::Monitor);

        machine.kill("bob").await;

        assert!(machine.is_finished());
        assert!(killed.load(Ordering::SeqCst));
        assert_eq!(machine.final_status(), Some(KILLED));
        match harness.notifier.sent().as_slice() {
            [Notification::Killed(run)] => assert_eq!(run.killer, "bob"),
            other => panic!("unexpected notifications: {other:?}"),
        }
        assert!(!harness.store.request(id).unwrap().is_claimed());
        assert_eq!(run_status(&harness, &machine), KILLED);
    }

    #[tokio::test]
    async fn test_publish_waits_for_conch() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "blockonpublish\npublish Builds\n");
        harness
            .launcher
            .push(MockProcess::exits(0, &["CookerSync completed successfully"]));
        let holder = BuildRequest::new("Other PC", "OtherPC", BRANCH);
        let holder_id = harness.store.insert_request(holder);
        harness.store.set_conch_acquired_at(holder_id, Utc::now()).unwrap();

        let mut machine = start(&harness, RunTarget::Request(request())).await;
        assert_eq!(machine.tick().await, Mode::Init);
        assert_eq!(machine.tick().await, Mode::Init);
        assert_eq!(machine.state().pending.front(), Some(&Command::Publish));
        assert_eq!(run_status(&harness, &machine), "Waiting for network bandwidth ( 00:00:00 )");

        harness.store.release_conch(holder_id).await.unwrap();
        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        assert!(harness.store.conch_holder().await.unwrap().is_none());
        assert!(matches!(harness.notifier.sent().as_slice(), [Notification::Published(_)]));
    }

    #[tokio::test]
    async fn test_retrigger_of_running_build_is_suppressed() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "trigger Other PC\n");
        let mut other = BuildRequest::new("Other PC", "OtherPC", BRANCH);
        other.machine = Some("build-09".to_string());
        harness.store.insert_request(other);
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        assert_eq!(machine.final_status(), Some(SUCCEEDED));
        match harness.notifier.sent().as_slice() {
            [Notification::AlreadyInProgress { operator, description }] => {
                assert_eq!(operator, "alice");
                assert_eq!(description, "Other PC");
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_label_sets_branch_variable() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "updatelabel LatestCook\n");
        let mut machine = start(&harness, RunTarget::Request(request())).await;

        run_to_end(&mut machine).await;

        let vars = harness.store.variables(BRANCH).await.unwrap();
        assert_eq!(vars.get("LatestCook"), Some(&machine.state().label_name()));
    }

    #[tokio::test]
    async fn test_looping_build_is_retriggered() {
        let harness = Harness::new();
        harness.write_script(SCRIPT, "sync\n");
        let mut request = request();
        request.looping = true;
        let id = request.id;
        let mut machine = start(&harness, RunTarget::Request(request)).await;

        run_to_end(&mut machine).await;

        let stored = harness.store.request(id).unwrap();
        assert!(stored.pending);
        assert_eq!(stored.operator.as_deref(), Some("alice"));
    }
}
