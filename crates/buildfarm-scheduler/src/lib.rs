//! Build execution for build farm agents.
//!
//! An agent runs one [`AgentCoordinator`] loop. It claims work from the
//! shared store and drives each claimed build or sub-job through a
//! [`BuildStateMachine`], which interprets the build script line by line and
//! hands every action to the [`Dispatcher`].

pub mod classifier;
pub mod coordinator;
pub mod dispatcher;
pub mod emailer;
pub mod logbook;
pub mod machine;
pub mod stats;
pub mod status;
pub mod symbols;

#[cfg(test)]
mod testing;

pub use classifier::{Classification, ClassifyOptions, Verdict, classify};
pub use coordinator::{AgentCoordinator, ExitReason};
pub use dispatcher::{Dispatched, Dispatcher, ToolchainOverride};
pub use emailer::{Emailer, Mail, MailTransport};
pub use logbook::CommandLog;
pub use machine::{BuildStateMachine, RunTarget};

use buildfarm_config::AgentConfig;
use buildfarm_core::{Notifier, ProcessLauncher, SourceControl};
use buildfarm_db::WorkStore;
use std::sync::Arc;

/// Everything a run talks to outside its own state.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn WorkStore>,
    pub scc: Arc<dyn SourceControl>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<AgentConfig>,
}
