//! External tool launches.

use buildfarm_config::ScriptState;
use buildfarm_config::script::extract_parameters;
use buildfarm_core::{Command, Failure, ProcessSpec};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{Dispatched, Dispatcher};
use crate::logbook::CommandLog;

/// A toolchain directory kept renamed aside and moved into place only while
/// the command that needs it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainOverride {
    active: PathBuf,
    disabled: PathBuf,
}

impl ToolchainOverride {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let active = dir.into();
        let mut disabled = active.clone().into_os_string();
        disabled.push("_Disabled");
        Self {
            active,
            disabled: PathBuf::from(disabled),
        }
    }

    /// Move the toolchain into place. Returns false when there is nothing to
    /// enable.
    pub fn enable(&self) -> io::Result<bool> {
        if self.active.exists() || !self.disabled.exists() {
            return Ok(false);
        }
        fs::rename(&self.disabled, &self.active)?;
        info!(dir = %self.active.display(), "Enabled toolchain override");
        Ok(true)
    }

    pub fn disable(&self) -> io::Result<()> {
        if self.active.exists() && !self.disabled.exists() {
            fs::rename(&self.active, &self.disabled)?;
            info!(dir = %self.active.display(), "Disabled toolchain override");
        }
        Ok(())
    }

    pub fn active(&self) -> &Path {
        &self.active
    }
}

impl Dispatcher {
    pub(super) async fn launch(&self, command: Command, state: &mut ScriptState, mut log: CommandLog) -> Dispatched {
        let config = &self.deps.config;
        let Some(key) = command.tool_key() else {
            let detail = format!("{command} does not launch a tool");
            log.write(&format!("Error, {detail}"));
            return Dispatched::failed(log, Failure::Command(command), detail);
        };
        let Some(tool) = config.tools.get(key) else {
            let detail = format!("no tool configured for '{key}'");
            log.write(&format!("Error, {detail}"));
            return Dispatched::failed(log, Failure::Command(command), detail);
        };

        if command == Command::Conform {
            if state.languages.len() < 2 {
                let detail = "conform needs at least two languages".to_string();
                log.write(&format!("Error, {detail}"));
                return Dispatched::failed(log, Failure::Command(command), detail);
            }
            state.conform_source = state.languages.pop_front().unwrap_or_default();
            state.label.language = state.languages.front().cloned().unwrap_or_default();
        }

        let params = extract_parameters(&state.command_line);
        if command.is_publish() {
            state.publish_destinations = params.clone();
        }

        let mut values = state.placeholders();
        for (name, path) in &config.applications {
            values.entry(format!("app:{name}")).or_insert_with(|| path.clone());
        }
        values.insert("destinations".to_string(), state.publish_destinations.join(" "));

        let invocation = match tool.render(key, &params, &values) {
            Ok(invocation) => invocation,
            Err(e) => {
                log.write(&format!("Error, {e}"));
                return Dispatched::failed(log, Failure::Command(command), e.to_string());
            }
        };

        let root = self.workspace_root(state);
        let program = if invocation.program.contains('/') && Path::new(&invocation.program).is_relative() {
            root.join(&invocation.program).to_string_lossy().into_owned()
        } else {
            invocation.program
        };
        let working_dir = match &invocation.cwd {
            Some(cwd) => root.join(cwd),
            None => root.clone(),
        };

        let toolchain = tool.override_dir.as_ref().map(|dir| ToolchainOverride::new(root.join(dir)));
        if let Some(toolchain) = &toolchain {
            if let Err(e) = toolchain.enable() {
                warn!(dir = %toolchain.active().display(), error = %e, "Failed to enable toolchain override");
            }
        }

        let spec = ProcessSpec::new(program, invocation.args, working_dir);
        log.write(&format!("Executing '{}'", spec.display_line()));

        match self.deps.launcher.start(spec).await {
            Ok(process) => Dispatched {
                log,
                process: Some(process),
                failure: None,
                detail: None,
                toolchain,
            },
            Err(e) => {
                if let Some(toolchain) = &toolchain {
                    if let Err(e) = toolchain.disable() {
                        warn!(error = %e, "Failed to disable toolchain override");
                    }
                }
                log.write(&format!("Error, failed to start {command}: {e}"));
                Dispatched::failed(log, Failure::Process, e.to_string())
            }
        }
    }
}
