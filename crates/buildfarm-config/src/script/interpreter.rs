//! Line-at-a-time build-script interpreter.
//!
//! Each call to [`ScriptInterpreter::parse_next_line`] consumes one script
//! line, applies any configuration directive to the [`ScriptState`], and
//! returns the abstract command the state machine should run next.
//! Directives yield [`Command::Config`]; the end of the script yields
//! [`Command::Finished`]; an unknown keyword yields [`Command::Error`] with
//! [`Failure::IllegalCommand`] recorded on the state.

use buildfarm_core::{Command, Failure};
use std::path::Path;

use super::expand::ExpansionContext;
use super::keywords::{self, Directive, RunFlag};
use super::state::{ScriptState, parse_timeout};
use super::tokenize::extract_parameters;

/// What one script line produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub command: Command,
    /// Lines to log for this step, such as `[STATUS] ...` markers.
    pub notices: Vec<String>,
}

impl Parsed {
    fn command(command: Command) -> Self {
        Self {
            command,
            notices: Vec::new(),
        }
    }

    fn notice(command: Command, notice: String) -> Self {
        Self {
            command,
            notices: vec![notice],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptInterpreter {
    lines: Option<Vec<String>>,
    position: usize,
}

impl ScriptInterpreter {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: Some(text.lines().map(str::to_string).collect()),
            position: 0,
        }
    }

    /// An interpreter with no script; every parse reports `NoScript`.
    pub fn missing() -> Self {
        Self {
            lines: None,
            position: 0,
        }
    }

    /// Load a script file. A missing or unreadable file yields an
    /// interpreter that reports `NoScript`.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_text(&text),
            Err(_) => Self::missing(),
        }
    }

    pub fn has_script(&self) -> bool {
        self.lines.is_some()
    }

    pub fn parse_next_line(&mut self, state: &mut ScriptState, ctx: &ExpansionContext) -> Parsed {
        let Some(lines) = &self.lines else {
            state.error = Some(Failure::NoScript);
            state.command = Command::Error;
            return Parsed::command(Command::Error);
        };

        let Some(line) = lines.get(self.position).cloned() else {
            state.command = Command::Finished;
            return Parsed::notice(Command::Finished, "[STATUS] Script parsing completed".to_string());
        };
        self.position += 1;
        state.line_count += 1;

        let keyword = line.split([' ', '\t']).next().unwrap_or("");
        let command_line = line[keyword.len()..]
            .trim()
            .replace('\\', "/")
            .replace("//", "\\\\");
        let keyword = keyword.to_lowercase();
        state.command_line = command_line;

        if keyword.is_empty() || keyword == "//" {
            state.command = Command::Config;
            return Parsed::command(Command::Config);
        }

        let Some(entry) = keywords::lookup(&keyword) else {
            state.command_line = line;
            state.error = Some(Failure::IllegalCommand);
            state.command = Command::Error;
            return Parsed::command(Command::Error);
        };

        let mut parsed = Parsed::command(entry.command);
        if let Some(directive) = entry.directive {
            if let Some(notice) = apply_directive(directive, state, ctx) {
                parsed.notices.push(notice);
            }
        }
        if let Some(flag) = entry.flag {
            raise_flag(flag, state);
        }
        if let Some(spec) = entry.spec {
            state.command_line = if state.command_line.is_empty() {
                spec.to_string()
            } else {
                format!("{} {}", spec, state.command_line)
            };
        }

        state.command = entry.command;
        parsed
    }
}

fn raise_flag(flag: RunFlag, state: &mut ScriptState) {
    match flag {
        RunFlag::Promoting => state.flags.promoting = true,
        RunFlag::Building => state.flags.building = true,
        RunFlag::MakingInstall => state.flags.making_install = true,
        RunFlag::Publishing => state.flags.publishing = true,
        RunFlag::SendingQaChanges => state.flags.sending_qa_changes = true,
    }
}

fn apply_directive(directive: Directive, state: &mut ScriptState, ctx: &ExpansionContext) -> Option<String> {
    let value = ctx.expand(&state.command_line);

    match directive {
        Directive::Status => return Some(format!("[STATUS] {value}")),
        Directive::WatchStart => return Some(format!("[WATCHSTART {value}]")),
        Directive::WatchStop => return Some("[WATCHSTOP]".to_string()),
        Directive::CheckErrors(on) => state.flags.check_errors = on,
        Directive::CheckWarnings(on) => state.flags.check_warnings = on,
        Directive::LanguageSpecific(on) => state.flags.append_language = on,
        Directive::CreateLabel => state.flags.create_label = true,
        Directive::Report => state.reports = extract_parameters(&value),
        Directive::TriggerAddress => state.trigger_address = value,
        Directive::FailAddress => state.fail_address = value,
        Directive::SuccessAddress => state.success_address = value,
        Directive::SmsAddress => state.sms_address = value,
        Directive::Define => {
            state.label.clear_defines();
            for define in extract_parameters(&value) {
                if !state.label.add_define(&define) {
                    return Some(format!("Error, too many defines; ignoring '{define}'"));
                }
            }
        }
        Directive::Language => state.label.language = value.to_uppercase(),
        Directive::Languages => {
            state.languages = extract_parameters(&value)
                .into_iter()
                .map(|l| l.to_uppercase())
                .filter(|l| !l.is_empty())
                .collect();
        }
        Directive::ClientSpec => state.client_spec = value,
        Directive::Timeout => {
            state.operation_timeout = parse_timeout(&value).unwrap_or(super::state::DEFAULT_OPERATION_TIMEOUT);
        }
        Directive::RespondingTimeout => {
            if let Some(timeout) = parse_timeout(&value) {
                state.responding_timeout = timeout;
            }
        }
        Directive::Application(name) => {
            state.applications.insert(name.to_string(), value);
        }
        Directive::Ps3Sdk => state.ps3_sdk = value,
        Directive::VersionFile => state.version_file = value,
        Directive::MiscVersionFiles => state.misc_version_files = extract_parameters(&value),
        Directive::Game => state.label.game = value,
        Directive::Platform => state.label.platform = value,
        Directive::BuildConfig => state.build_config = value,
        Directive::ScriptConfig => state.script_config = value,
        Directive::CookConfig => state.cook_config = value,
        Directive::ModName => state.mod_name = value,
        Directive::InstallConfig => state.install_config = value,
        Directive::ContentPath => state.content_path = value,
        Directive::CompressionConfig => state.compression = value,
        Directive::Dependency => state.dependency = value,
        Directive::SourceBuild => state.source_build = value,
        Directive::CopyDest => state.copy_destination = value,
        Directive::BlockOnPublish => state.flags.block_on_publish = true,
        Directive::ForceCopy => state.flags.force_copy = true,
        Directive::Unity => {
            for option in extract_parameters(&value) {
                match option.to_lowercase().as_str() {
                    "disable" => state.flags.unity_disabled = true,
                    "stresstest" => state.flags.unity_stress_test = true,
                    _ => {}
                }
            }
        }
    }
    None
}
