//! Label and publish-folder naming.
//!
//! A label looks like `Main_[2024-03-01_17.45]_[DEBUG]` and a publish folder
//! like `Example_PC_[2024-03-01_17.45]_[DEBUG]_FRA`. Both carry the run's
//! timestamp and up to two defines; folders also carry the language when the
//! script is language-specific.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H.%M";
const MAX_DEFINES: usize = 2;

static CHANGELIST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*changelist:\s*(\d+)").unwrap());
static ENGINE_VERSION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*engine version:\s*(\d+)").unwrap());

/// How the revision a run builds from was identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevisionType {
    #[default]
    Invalid,
    Label,
    ChangeList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelInfo {
    pub branch: String,
    pub game: String,
    pub platform: String,
    pub timestamp: DateTime<Utc>,
    pub changelist: i64,
    pub build_version: i64,
    pub language: String,
    pub revision_type: RevisionType,
    defines: Vec<String>,
}

/// The pieces recovered from a label or folder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub prefix: String,
    pub timestamp: DateTime<Utc>,
    pub defines: Vec<String>,
    pub language: Option<String>,
}

impl LabelInfo {
    pub fn new(branch: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            branch: branch.into(),
            game: String::new(),
            platform: String::new(),
            timestamp,
            changelist: 0,
            build_version: 0,
            language: String::new(),
            revision_type: RevisionType::Invalid,
            defines: Vec::new(),
        }
    }

    pub fn defines(&self) -> &[String] {
        &self.defines
    }

    pub fn clear_defines(&mut self) {
        self.defines.clear();
    }

    /// Record a define; returns false once both slots are taken.
    pub fn add_define(&mut self, define: &str) -> bool {
        if self.defines.len() >= MAX_DEFINES {
            return false;
        }
        self.defines.push(define.to_string());
        true
    }

    fn stamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    fn define_suffix(&self) -> String {
        self.defines.iter().map(|d| format!("_[{d}]")).collect()
    }

    pub fn label_name(&self) -> String {
        format!("{}_[{}]{}", self.branch, self.stamp(), self.define_suffix())
    }

    pub fn folder_name(&self, append_language: bool) -> String {
        let mut name = format!(
            "{}_{}_[{}]{}",
            self.game,
            self.platform,
            self.stamp(),
            self.define_suffix()
        );
        if append_language && !self.language.is_empty() {
            name.push('_');
            name.push_str(&self.language);
        }
        name
    }

    /// Build from a known changelist.
    pub fn set_changelist(&mut self, changelist: i64) {
        self.changelist = changelist;
        self.revision_type = RevisionType::ChangeList;
    }

    /// Adopt the timestamp and defines of an existing label or folder.
    pub fn adopt(&mut self, name: &str) -> bool {
        let Some(parsed) = parse_name(name) else {
            return false;
        };
        self.timestamp = parsed.timestamp;
        self.defines = parsed.defines;
        if let Some(language) = parsed.language {
            self.language = language;
        }
        self.revision_type = RevisionType::Label;
        true
    }

    /// Pick up `changelist:` and `Engine version:` lines from a label description.
    pub fn apply_description(&mut self, description: &str) {
        if let Some(cl) = CHANGELIST_LINE
            .captures(description)
            .and_then(|c| c[1].parse().ok())
        {
            self.changelist = cl;
        }
        if let Some(version) = ENGINE_VERSION_LINE
            .captures(description)
            .and_then(|c| c[1].parse().ok())
        {
            self.build_version = version;
        }
    }

    /// Description written to labels this agent creates.
    pub fn description(&self) -> String {
        let mut text = String::from("Label created automatically by the build farm\n");
        text.push_str(&format!("changelist: {}\n", self.changelist));
        if self.build_version > 0 {
            text.push_str(&format!("Engine version: {}\n", self.build_version));
        }
        text
    }
}

/// Split a label or folder name into its prefix, timestamp, defines and language.
pub fn parse_name(name: &str) -> Option<ParsedName> {
    let open = name.find("_[")?;
    let prefix = name[..open].to_string();
    let mut rest = &name[open + 1..];

    let mut brackets = Vec::new();
    loop {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        brackets.push(inner[..close].to_string());
        rest = &inner[close + 1..];
        match rest.strip_prefix('_') {
            Some(next) if next.starts_with('[') => rest = next,
            _ => break,
        }
    }

    let stamp = brackets.first()?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    let language = rest
        .strip_prefix('_')
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string());

    Some(ParsedName {
        prefix,
        timestamp,
        defines: brackets[1..].to_vec(),
        language,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info() -> LabelInfo {
        let mut info = LabelInfo::new("Main", Utc.with_ymd_and_hms(2024, 3, 1, 17, 45, 12).unwrap());
        info.game = "Example".into();
        info.platform = "PC".into();
        info
    }

    #[test]
    fn test_label_and_folder_names() {
        let mut info = info();
        assert_eq!(info.label_name(), "Main_[2024-03-01_17.45]");
        assert!(info.add_define("DEBUG"));
        assert!(info.add_define("FINAL"));
        assert!(!info.add_define("THIRD"));
        assert_eq!(info.label_name(), "Main_[2024-03-01_17.45]_[DEBUG]_[FINAL]");

        info.language = "FRA".into();
        assert_eq!(info.folder_name(false), "Example_PC_[2024-03-01_17.45]_[DEBUG]_[FINAL]");
        assert_eq!(info.folder_name(true), "Example_PC_[2024-03-01_17.45]_[DEBUG]_[FINAL]_FRA");
    }

    #[test]
    fn test_parse_folder_name() {
        let parsed = parse_name("Example_PC_[2024-03-01_17.45]_[DEBUG]_FRA").unwrap();
        assert_eq!(parsed.prefix, "Example_PC");
        assert_eq!(parsed.defines, vec!["DEBUG".to_string()]);
        assert_eq!(parsed.language.as_deref(), Some("FRA"));
        assert_eq!(parsed.timestamp, Utc.with_ymd_and_hms(2024, 3, 1, 17, 45, 0).unwrap());
    }

    #[test]
    fn test_parse_rejects_unstamped_names() {
        assert!(parse_name("Main").is_none());
        assert!(parse_name("Main_[not a date]").is_none());
    }

    #[test]
    fn test_adopt_existing_label() {
        let mut info = info();
        assert!(info.adopt("Main_[2023-12-24_08.00]_[LTCG]"));
        assert_eq!(info.revision_type, RevisionType::Label);
        assert_eq!(info.defines(), ["LTCG".to_string()]);
        assert_eq!(info.label_name(), "Main_[2023-12-24_08.00]_[LTCG]");
    }

    #[test]
    fn test_description_round_trip() {
        let mut info = info();
        info.set_changelist(4242);
        info.build_version = 311;
        let text = info.description();

        let mut other = LabelInfo::new("Main", Utc::now());
        other.apply_description(&text);
        assert_eq!(other.changelist, 4242);
        assert_eq!(other.build_version, 311);
    }
}
