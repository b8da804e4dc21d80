//! Configuration and build-script interpretation for the build farm.
//!
//! This crate handles:
//! - Agent configuration (`buildfarm.kdl`)
//! - The external tool catalogue
//! - The line-oriented build-script language

pub mod agent;
pub mod error;
pub mod script;
pub mod tools;

pub use agent::{AgentConfig, Intervals, MailConfig, load_agent_config, parse_agent_config};
pub use error::{ConfigError, ConfigResult};
pub use script::{ExpansionContext, LabelInfo, Parsed, ScriptInterpreter, ScriptState};
pub use tools::{Invocation, ToolCatalog, ToolSpec};
