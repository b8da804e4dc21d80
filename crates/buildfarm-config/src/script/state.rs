//! Live interpreter state for one run.

use buildfarm_core::{BatchId, ChangeDescription, Command, Failure};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use super::label::LabelInfo;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_RESPONDING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Per-run switches set by directives and actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunFlags {
    pub check_errors: bool,
    pub check_warnings: bool,
    pub append_language: bool,
    pub create_label: bool,
    pub new_label_created: bool,
    pub block_on_publish: bool,
    pub force_copy: bool,
    pub unity_disabled: bool,
    pub unity_stress_test: bool,
    pub promoting: bool,
    pub building: bool,
    pub making_install: bool,
    pub publishing: bool,
    pub sending_qa_changes: bool,
    pub files_checked_out: bool,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            check_errors: true,
            check_warnings: false,
            append_language: false,
            create_label: false,
            new_label_created: false,
            block_on_publish: false,
            force_copy: false,
            unity_disabled: false,
            unity_stress_test: false,
            promoting: false,
            building: false,
            making_install: false,
            publishing: false,
            sending_qa_changes: false,
            files_checked_out: false,
        }
    }
}

/// Everything one run accumulates while its script executes.
#[derive(Debug, Clone)]
pub struct ScriptState {
    pub description: String,
    pub branch: String,
    pub operator: String,
    pub machine: String,
    pub is_job: bool,
    pub promotable: bool,
    pub last_good_changelist: i64,
    pub started_at: DateTime<Utc>,

    pub label: LabelInfo,
    pub dependency: String,
    pub synced_label: String,
    pub source_build: String,
    pub copy_destination: String,
    pub client_spec: String,

    pub build_config: String,
    pub script_config: String,
    pub cook_config: String,
    pub install_config: String,
    pub content_path: String,
    pub compression: String,
    pub mod_name: String,
    /// Requested PS3 SDK version.
    pub ps3_sdk: String,
    pub applications: BTreeMap<String, String>,
    pub version_file: String,
    pub misc_version_files: Vec<String>,
    pub languages: VecDeque<String>,
    /// Language most recently conformed from.
    pub conform_source: String,

    pub operation_timeout: Duration,
    pub responding_timeout: Duration,

    pub trigger_address: String,
    pub fail_address: String,
    pub success_address: String,
    pub sms_address: String,
    pub reports: Vec<String>,

    pub flags: RunFlags,
    pub made_writable: Vec<String>,
    pub publish_destinations: Vec<String>,
    pub changes: Vec<ChangeDescription>,

    pub pending: VecDeque<Command>,
    pub command: Command,
    pub command_line: String,
    /// Failure raised by the interpreter or state machine rather than a command.
    pub error: Option<Failure>,
    /// Last human-readable status or failure message.
    pub status: String,

    pub line_count: usize,
    pub log_root: String,
    pub batch: BatchId,
    pub jobs_dispatched: u32,
}

impl ScriptState {
    pub fn new(description: impl Into<String>, branch: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let branch = branch.into();
        Self {
            description: description.into(),
            label: LabelInfo::new(branch.clone(), started_at),
            branch,
            operator: String::new(),
            machine: String::new(),
            is_job: false,
            promotable: false,
            last_good_changelist: 0,
            started_at,
            dependency: String::new(),
            synced_label: String::new(),
            source_build: String::new(),
            copy_destination: String::new(),
            client_spec: String::new(),
            build_config: "Release".to_string(),
            script_config: String::new(),
            cook_config: String::new(),
            install_config: String::new(),
            content_path: String::new(),
            compression: "size".to_string(),
            mod_name: String::new(),
            ps3_sdk: String::new(),
            applications: BTreeMap::new(),
            version_file: String::new(),
            misc_version_files: Vec::new(),
            languages: VecDeque::new(),
            conform_source: String::new(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            responding_timeout: DEFAULT_RESPONDING_TIMEOUT,
            trigger_address: String::new(),
            fail_address: String::new(),
            success_address: String::new(),
            sms_address: String::new(),
            reports: Vec::new(),
            flags: RunFlags::default(),
            made_writable: Vec::new(),
            publish_destinations: Vec::new(),
            changes: Vec::new(),
            pending: VecDeque::new(),
            command: Command::Config,
            command_line: String::new(),
            error: None,
            status: String::new(),
            line_count: 0,
            log_root: format!("Builder_[{}]", started_at.format("%Y-%m-%d_%H.%M")),
            batch: BatchId::now(),
            jobs_dispatched: 0,
        }
    }

    pub fn label_name(&self) -> String {
        self.label.label_name()
    }

    pub fn folder_name(&self) -> String {
        self.label.folder_name(self.flags.append_language)
    }

    /// Language used for cooking and publishing; `INT` when none is set.
    pub fn language_or_default(&self) -> &str {
        if self.label.language.is_empty() {
            "INT"
        } else {
            &self.label.language
        }
    }

    /// Per-command log file name for the command currently executing.
    pub fn log_file_name(&self) -> String {
        if self.flags.append_language && !self.label.language.is_empty() {
            format!(
                "{}_{}_{}_{}.txt",
                self.log_root, self.line_count, self.command, self.label.language
            )
        } else {
            format!("{}_{}_{}.txt", self.log_root, self.line_count, self.command)
        }
    }

    /// Values for `{name}` placeholders in tool templates and file specs.
    pub fn placeholders(&self) -> HashMap<String, String> {
        let mut values = HashMap::new();
        let mut put = |key: &str, value: String| {
            values.insert(key.to_string(), value);
        };

        put("game", self.label.game.clone());
        put("platform", self.label.platform.clone());
        put("branch", self.branch.clone());
        put("config", self.build_config.clone());
        put("scriptconfig", self.script_config.clone());
        put("installconfig", self.install_config.clone());
        put("compression", self.compression.clone());
        put("contentpath", self.content_path.clone());
        put("modname", self.mod_name.clone());
        put("language", self.language_or_default().to_string());
        put("conformsource", self.conform_source.clone());
        put("defines", self.label.defines().join(" "));
        put("label", self.label_name());
        put("folder", self.folder_name());
        put("dependency", self.dependency.clone());
        put("sourcebuild", self.source_build.clone());
        put("ps3sdk", self.ps3_sdk.clone());
        put("shadersuffix", shader_suffix(&self.label.platform));
        put("common", "-unattended -nopause -buildmachine -forcelogflush".to_string());
        put("force", if self.flags.force_copy { "-f" } else { "" }.to_string());
        put(
            "cookconfig",
            if self.cook_config.is_empty() {
                String::new()
            } else {
                format!("-CookConfig={}", self.cook_config)
            },
        );
        put(
            "unity",
            if self.flags.unity_stress_test {
                "-StressTestUnity"
            } else if self.flags.unity_disabled {
                "-DisableUnity"
            } else {
                ""
            }
            .to_string(),
        );
        for (name, path) in &self.applications {
            put(&format!("app:{name}"), path.clone());
        }

        values
    }
}

/// Platform suffix of reference and local shader cache packages.
pub fn shader_suffix(platform: &str) -> String {
    match platform.to_lowercase().as_str() {
        "pc" => "PC-D3D-SM3".to_string(),
        "pc_sm2" => "PC-D3D-SM2".to_string(),
        "pc_sm4" => "PC-D3D-SM4".to_string(),
        "xenon" => "Xbox360".to_string(),
        "ps3" => "PS3".to_string(),
        _ => platform.to_string(),
    }
}

/// Parse a timeout argument: bare numbers are minutes, `s`/`m`/`h` suffixes
/// are honoured. Zero or unparseable values yield `None`.
pub fn parse_timeout(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (digits, scale) = match text.char_indices().last()? {
        (i, 's' | 'S') => (&text[..i], 1),
        (i, 'm' | 'M') => (&text[..i], 60),
        (i, 'h' | 'H') => (&text[..i], 3600),
        _ => (text, 60),
    };
    let value: u64 = digits.trim().parse().ok()?;
    (value > 0).then(|| Duration::from_secs(value * scale))
}
