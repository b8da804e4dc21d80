//! Agent configuration parsing.
//!
//! ```kdl
//! agent "build-07" {
//!     database-url "postgres://farm@db/farm"
//!     root "/builds"
//!     failed-log-dir "/shared/FailedBuilds"
//!     mail-domain "example.com"
//!     oversight "buildmaster@example.com"
//!     kill "DW20" "mspdbsrv"
//!     intervals tick-ms=500 heartbeat=30 build-poll=5
//!     timeouts operation=10 responding=10
//! }
//! tool "cookmaps" program="Binaries/{game}Game" args="CookPackages {args}" min=1
//! application "msvc" "/opt/msvc/devenv"
//! ```

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::tools::{ToolCatalog, ToolSpec};
use crate::{ConfigError, ConfigResult};

/// Poll cadences of the agent coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intervals {
    pub tick: Duration,
    pub heartbeat: Duration,
    pub stats: Duration,
    pub build_poll: Duration,
    pub job_poll: Duration,
    pub kill_poll: Duration,
    pub restart_check: Duration,
    pub system_check: Duration,
    pub job_count: Duration,
    pub conch_status: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            heartbeat: Duration::from_secs(30),
            stats: Duration::from_secs(300),
            build_poll: Duration::from_secs(5),
            job_poll: Duration::from_secs(5),
            kill_poll: Duration::from_secs(2),
            restart_check: Duration::from_secs(5),
            system_check: Duration::from_secs(300),
            job_count: Duration::from_secs(1),
            conch_status: Duration::from_secs(5),
        }
    }
}

impl Intervals {
    /// Every check on every tick; used by tests.
    pub fn immediate() -> Self {
        Self {
            tick: Duration::from_millis(10),
            heartbeat: Duration::ZERO,
            stats: Duration::ZERO,
            build_poll: Duration::ZERO,
            job_poll: Duration::ZERO,
            kill_poll: Duration::ZERO,
            restart_check: Duration::ZERO,
            system_check: Duration::ZERO,
            job_count: Duration::ZERO,
            conch_status: Duration::ZERO,
        }
    }
}

/// Mail recipients and delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailConfig {
    pub domain: String,
    pub sender: String,
    pub oversight: Vec<String>,
    pub qa: Vec<String>,
    pub engine_leads: Vec<String>,
    pub it: Vec<String>,
    pub webhook: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub machine: String,
    pub database_url: Option<String>,
    pub root: PathBuf,
    pub script_dir: String,
    pub log_dir: String,
    pub failed_log_dir: PathBuf,
    pub mail: MailConfig,
    pub kill_list: Vec<String>,
    pub storage: Vec<PathBuf>,
    pub intervals: Intervals,
    pub operation_timeout: Duration,
    pub responding_timeout: Duration,
    pub tools: ToolCatalog,
    pub applications: BTreeMap<String, String>,
}

impl AgentConfig {
    pub fn new(machine: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            machine: machine.into(),
            database_url: None,
            failed_log_dir: root.join("FailedBuilds"),
            root,
            script_dir: "Development/Builder/Scripts".to_string(),
            log_dir: "Development/Builder/Logs".to_string(),
            mail: MailConfig {
                sender: "buildfarm".to_string(),
                ..MailConfig::default()
            },
            kill_list: vec![
                "DW20".to_string(),
                "vsimake".to_string(),
                "Autoreporter".to_string(),
                "mspdbsrv".to_string(),
            ],
            storage: Vec::new(),
            intervals: Intervals::default(),
            operation_timeout: crate::script::state::DEFAULT_OPERATION_TIMEOUT,
            responding_timeout: crate::script::state::DEFAULT_RESPONDING_TIMEOUT,
            tools: ToolCatalog::default(),
            applications: BTreeMap::new(),
        }
    }

    /// Workspace directory for a branch.
    pub fn workspace_root(&self, branch: &str) -> PathBuf {
        self.root.join(branch)
    }
}

/// Read and parse an agent configuration file.
pub fn load_agent_config(path: &Path) -> ConfigResult<AgentConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_agent_config(&text)
}

/// Parse agent configuration from KDL text.
pub fn parse_agent_config(kdl: &str) -> ConfigResult<AgentConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config: Option<AgentConfig> = None;
    let mut tools = Vec::new();
    let mut applications = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "agent" => {
                if config.is_some() {
                    return Err(ConfigError::Duplicate("agent".to_string()));
                }
                config = Some(parse_agent(node)?);
            }
            "tool" => tools.push(parse_tool(node)?),
            "application" => {
                let args = get_all_string_args(node);
                match args.as_slice() {
                    [name, path] => {
                        applications.insert(name.clone(), path.clone());
                    }
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            field: "application".to_string(),
                            message: "expected a name and a path".to_string(),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    let mut config = config.ok_or_else(|| ConfigError::MissingField("agent".to_string()))?;
    for (key, spec) in tools {
        config.tools.insert(key, spec);
    }
    config.applications = applications;
    Ok(config)
}

fn parse_agent(node: &KdlNode) -> ConfigResult<AgentConfig> {
    let machine = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("agent name".to_string()))?;
    let mut config = AgentConfig::new(machine, ".");
    let mut failed_log_dir = None;

    let Some(children) = node.children() else {
        return Ok(config);
    };

    for child in children.nodes() {
        let name = child.name().value();
        match name {
            "database-url" => config.database_url = get_first_string_arg(child),
            "root" => config.root = PathBuf::from(require_string(child, name)?),
            "script-dir" => config.script_dir = require_string(child, name)?,
            "log-dir" => config.log_dir = require_string(child, name)?,
            "failed-log-dir" => failed_log_dir = Some(PathBuf::from(require_string(child, name)?)),
            "mail-domain" => config.mail.domain = require_string(child, name)?,
            "mail-sender" => config.mail.sender = require_string(child, name)?,
            "oversight" => config.mail.oversight = get_all_string_args(child),
            "qa" => config.mail.qa = get_all_string_args(child),
            "engine-leads" => config.mail.engine_leads = get_all_string_args(child),
            "it" => config.mail.it = get_all_string_args(child),
            "webhook" => {
                let raw = require_string(child, name)?;
                let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                    field: name.to_string(),
                    message: e.to_string(),
                })?;
                config.mail.webhook = Some(url);
            }
            "kill" => config.kill_list = get_all_string_args(child),
            "storage" => config.storage = get_all_string_args(child).into_iter().map(PathBuf::from).collect(),
            "intervals" => parse_intervals(child, &mut config.intervals)?,
            "timeouts" => {
                if let Some(minutes) = get_int_prop(child, "operation")? {
                    config.operation_timeout = Duration::from_secs(minutes * 60);
                }
                if let Some(minutes) = get_int_prop(child, "responding")? {
                    config.responding_timeout = Duration::from_secs(minutes * 60);
                }
            }
            _ => {}
        }
    }

    config.failed_log_dir = failed_log_dir.unwrap_or_else(|| config.root.join("FailedBuilds"));
    Ok(config)
}

fn parse_intervals(node: &KdlNode, intervals: &mut Intervals) -> ConfigResult<()> {
    if let Some(ms) = get_int_prop(node, "tick-ms")? {
        intervals.tick = Duration::from_millis(ms);
    }
    let seconds = [
        ("heartbeat", &mut intervals.heartbeat),
        ("stats", &mut intervals.stats),
        ("build-poll", &mut intervals.build_poll),
        ("job-poll", &mut intervals.job_poll),
        ("kill-poll", &mut intervals.kill_poll),
        ("restart-check", &mut intervals.restart_check),
        ("system-check", &mut intervals.system_check),
        ("job-count", &mut intervals.job_count),
        ("conch-status", &mut intervals.conch_status),
    ];
    for (name, slot) in seconds {
        if let Some(secs) = get_int_prop(node, name)? {
            *slot = Duration::from_secs(secs);
        }
    }
    Ok(())
}

fn parse_tool(node: &KdlNode) -> ConfigResult<(String, ToolSpec)> {
    let key = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("tool name".to_string()))?
        .to_lowercase();
    let program = get_string_prop(node, "program")
        .ok_or_else(|| ConfigError::MissingField(format!("tool '{key}' program")))?;

    let mut spec = ToolSpec::new(&program, &get_string_prop(node, "args").unwrap_or_else(|| "{args}".to_string()));
    spec.cwd = get_string_prop(node, "cwd");
    spec.override_dir = get_string_prop(node, "override");
    if let Some(min) = get_int_prop(node, "min")? {
        spec.min_args = min as usize;
    }
    spec.max_args = get_int_prop(node, "max")?.map(|m| m as usize);
    Ok((key, spec))
}

fn require_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("expected a non-negative integer, got {value}"),
        })
}
