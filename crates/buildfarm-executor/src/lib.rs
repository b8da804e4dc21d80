//! Process execution backends for build farm agents.
//!
//! Provides the local launcher that runs build tools as child processes of
//! the agent and exposes them through the polling supervisor façade, and the
//! `p4` client the agent uses for source control.

pub mod local;
pub mod perforce;

pub use buildfarm_core::process::{
    CaptureMode, OutputLine, OutputStream, ProcessLauncher, ProcessSpec, RunningProcess,
};
pub use local::{LocalProcess, LocalProcessLauncher};
pub use perforce::PerforceClient;
