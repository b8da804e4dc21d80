//! Process supervisor traits.
//!
//! Launchers start external tools; a [`RunningProcess`] is a polling façade
//! over the child. Output is drained by the caller once per tick, and both
//! timeouts are enforced by the caller, never pushed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::Result;

/// What to launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub capture: CaptureMode,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            env: HashMap::new(),
            capture: CaptureMode::Both,
        }
    }

    /// Command line as it is written to the run log.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    Stdout,
    Both,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
}

/// A started child process.
#[async_trait]
pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Take every line captured since the previous call, in order.
    fn drain_output(&mut self) -> Vec<OutputLine>;

    /// True once the child exited and its output is fully captured.
    fn is_finished(&mut self) -> bool;

    /// True if the child showed signs of life since the previous check.
    fn is_responding(&mut self) -> bool;

    fn exit_code(&self) -> Option<i32>;

    /// Hard-kill the child and everything it spawned.
    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn start(&self, spec: ProcessSpec) -> Result<Box<dyn RunningProcess>>;

    /// Kill every process on this machine with the given image name.
    async fn kill_by_name(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_line_quotes_spaced_args() {
        let spec = ProcessSpec::new(
            "devenv",
            vec!["Game.sln".into(), "/build".into(), "Release Final".into()],
            "/builds/main",
        );
        assert_eq!(spec.display_line(), r#"devenv Game.sln /build "Release Final""#);
    }
}
