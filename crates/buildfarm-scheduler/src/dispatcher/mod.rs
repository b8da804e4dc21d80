//! Command dispatch.
//!
//! [`Dispatcher::execute`] opens the per-command log and performs one
//! abstract command: a source-control call, a filesystem action, a sub-job
//! insert, or an external tool launch. Synchronous commands are complete when
//! it returns; launched tools hand back a [`RunningProcess`] to be monitored.

pub mod files;
mod source_control;
mod tools;

pub use tools::ToolchainOverride;

use buildfarm_config::ScriptState;
use buildfarm_config::script::extract_parameters;
use buildfarm_core::{Command, CommandKind, Failure, Mode, NewSubJob, RunningProcess, Workspace};
use std::path::PathBuf;

use crate::Collaborators;
use crate::logbook::CommandLog;

/// Outcome of dispatching one command.
pub struct Dispatched {
    pub log: CommandLog,
    pub process: Option<Box<dyn RunningProcess>>,
    pub failure: Option<Failure>,
    /// What went wrong, in the collaborator's words.
    pub detail: Option<String>,
    pub toolchain: Option<ToolchainOverride>,
}

impl Dispatched {
    fn finished(log: CommandLog) -> Self {
        Self {
            log,
            process: None,
            failure: None,
            detail: None,
            toolchain: None,
        }
    }

    fn failed(log: CommandLog, failure: Failure, detail: String) -> Self {
        Self {
            log,
            process: None,
            failure: Some(failure),
            detail: Some(detail),
            toolchain: None,
        }
    }

    /// Monitor while a process runs, otherwise straight to Finalise.
    pub fn mode(&self) -> Mode {
        if self.process.is_some() {
            Mode::Monitor
        } else {
            Mode::Finalise
        }
    }
}

pub struct Dispatcher {
    deps: Collaborators,
}

impl Dispatcher {
    pub fn new(deps: Collaborators) -> Self {
        Self { deps }
    }

    pub fn workspace_root(&self, state: &ScriptState) -> PathBuf {
        self.deps.config.workspace_root(&state.branch)
    }

    pub fn workspace(&self, state: &ScriptState) -> Workspace {
        let client_spec = if state.client_spec.is_empty() {
            format!("{}_{}", state.machine, state.branch)
        } else {
            state.client_spec.clone()
        };
        Workspace {
            branch: state.branch.clone(),
            client_spec,
            root: self.workspace_root(state),
        }
    }

    /// Open the log for the command about to run.
    pub fn open_log(&self, state: &ScriptState) -> CommandLog {
        let dir = self.workspace_root(state).join(&self.deps.config.log_dir);
        CommandLog::open(&dir, &state.log_file_name())
    }

    pub async fn execute(&self, command: Command, state: &mut ScriptState) -> Dispatched {
        state.command = command;
        let mut log = self.open_log(state);

        let step = match command.kind() {
            CommandKind::Process => return self.launch(command, state, log).await,
            CommandKind::SourceControl => self.source_control(command, state, &mut log).await,
            CommandKind::FileSystem => {
                let root = self.workspace_root(state);
                files::execute(command, state, &root, &mut log)
            }
            CommandKind::Jobs => self.add_job(command, state, &mut log).await,
            CommandKind::Pseudo => Err(format!("{command} cannot be dispatched")),
        };

        match step {
            Ok(()) => Dispatched::finished(log),
            Err(detail) => {
                log.write(&format!("Error, {command}: {detail}"));
                Dispatched::failed(log, Failure::Command(command), detail)
            }
        }
    }

    /// Insert one sub-job into the run's batch. `addjob` names the script
    /// directly; the Unreal variants run a compile job script for a given
    /// configuration and game.
    async fn add_job(&self, command: Command, state: &mut ScriptState, log: &mut CommandLog) -> files::Step {
        let params = extract_parameters(&state.command_line);
        let (game, script, parameters) = match command {
            Command::AddJob => {
                if params.len() < 2 {
                    return Err("too few parameters. Usage: AddJob <Script> <File1> [File2...].".to_string());
                }
                (state.label.game.clone(), params[0].clone(), params[1..].to_vec())
            }
            _ => {
                let script = if command == Command::AddUnrealFullGameJob {
                    "Jobs/UnrealFullGameJob"
                } else {
                    "Jobs/UnrealGameJob"
                };
                match params.as_slice() {
                    [config, game] => (game.clone(), script.to_string(), vec![config.clone()]),
                    [config, game, extension] => (game.clone(), format!("{script}_{extension}"), vec![config.clone()]),
                    _ => {
                        return Err(format!(
                            "incorrect number of parameters. Usage: {command} <Config> <Game> [ScriptExtension]."
                        ));
                    }
                }
            }
        };

        let mut name = String::from("Job");
        for part in [&game, &state.label.platform] {
            if !part.is_empty() {
                name.push('_');
                name.push_str(part);
            }
        }
        name.push('_');
        name.push_str(&parameters[0]);

        let job = NewSubJob {
            name,
            command: script,
            parameter: parameters.join(" "),
            batch: state.batch,
            game,
            platform: state.label.platform.clone(),
            branch: state.branch.clone(),
            label: state.dependency.clone(),
        };
        self.deps.store.add_job(&job).await.map_err(|e| e.to_string())?;
        state.jobs_dispatched += 1;
        log.write(&format!("Added Job: {}", job.name));
        Ok(())
    }
}
