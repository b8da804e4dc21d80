//! Core domain types and traits for the build farm.
//!
//! This crate contains:
//! - Resource and batch identifiers
//! - Records shared through the work store
//! - Abstract commands, modes and failures
//! - Collaborator traits for processes, source control and notifications

pub mod command;
pub mod error;
pub mod id;
pub mod model;
pub mod notify;
pub mod process;
pub mod source_control;

pub use command::{Command, CommandKind, Failure, Mode};
pub use error::{Error, Result};
pub use id::{BatchId, ResourceId};
pub use model::{
    AUTO_TIMER, AgentRecord, AgentState, BuildRequest, BuildRun, NewSubJob, Registration,
    ResourceSample, SubJob, TriggerClaim, TriggerOutcome,
};
pub use notify::{Notification, Notifier, RunSummary};
pub use process::{CaptureMode, OutputLine, OutputStream, ProcessLauncher, ProcessSpec, RunningProcess};
pub use source_control::{
    ChangeDescription, LabelDetails, Revision, SourceControl, SubmitOutcome, Workspace,
};
