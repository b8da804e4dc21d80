//! Log classification.
//!
//! A finished command's log is scanned top to bottom against an ordered
//! rule table. The first rule matching a line decides what happens to it:
//! ignored, kept as an error, or kept as a warning (only when warning
//! checking is on). Some rules also keep a fixed number of following lines,
//! which is how stack traces and compiler context survive into the excerpt.
//!
//! Lines that look like a project or phase header (`------ ... ------`,
//! `Entering directory`) are remembered and written once ahead of the first
//! match inside that phase, so an excerpt reads like:
//!
//! ```text
//! ------ Build started: Project: Core, Configuration: Release Win32 ------
//! UnObj.cpp(412) : error C2065: 'Outer' : undeclared identifier
//! ```

use regex::Regex;
use std::sync::LazyLock;

/// Status reported when nothing in the log matched.
pub const SUCCEEDED: &str = "Succeeded";

/// Printed by the cooker when every package cooked.
pub const COOK_SUCCESS_MARKER: &str = "Success - 0 error(s)";

/// Printed by CookerSync once every destination has been written.
pub const PUBLISH_SUCCESS_MARKER: &str = "CookerSync completed successfully";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Ignore,
    Error,
    Warning,
}

struct Rule {
    pattern: Regex,
    trailing: usize,
    severity: Severity,
}

const RULE_TABLE: &[(&str, usize, Severity)] = &[
    // Summary lines that mention errors without being one.
    (r"(?i)\b0 error\(s\)", 0, Severity::Ignore),
    (r"(?i)\b0 errors?\b", 0, Severity::Ignore),
    // Crash handler output, followed by the call stack.
    (r"=== Critical error: ===", 10, Severity::Error),
    (r"Unhandled Exception", 6, Severity::Error),
    (r"(?i)\bfatal error\b", 0, Severity::Error),
    // Compilers and linkers.
    (r"\berror [A-Z]{1,3}\d{3,5}\s*:", 0, Severity::Error),
    (r":\d+(:\d+)?: error:", 2, Severity::Error),
    (r"(?i)undefined reference to", 0, Severity::Error),
    (r"(?i)unresolved external symbol", 0, Severity::Error),
    // Shell.
    (r"(?i)is not recognized as an internal or external command", 0, Severity::Error),
    (r"(?i)command not found", 0, Severity::Error),
    // Script compiler and commandlets.
    (r"^\s*Error,", 0, Severity::Error),
    (r"^\s*Critical:", 0, Severity::Error),
    (r"(?i)^\s*error:", 0, Severity::Error),
    (r"(?i)\bBUILD FAILED\b", 0, Severity::Error),
    // Files that were expected but absent.
    (r"(?i)can't find file", 0, Severity::Error),
    (r"(?i)could not find file", 0, Severity::Error),
    (r"(?i)no such file or directory", 0, Severity::Error),
    // Source control lock conflicts.
    (r"(?i)already locked by", 0, Severity::Error),
    (r"(?i)exclusive file already opened", 0, Severity::Error),
    // Warnings.
    (r"\bwarning [A-Z]{1,3}\d{3,5}\s*:", 0, Severity::Warning),
    (r":\d+(:\d+)?: warning:", 0, Severity::Warning),
    (r"^\s*Warning,", 0, Severity::Warning),
];

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    RULE_TABLE
        .iter()
        .map(|(pattern, trailing, severity)| Rule {
            pattern: Regex::new(pattern).unwrap(),
            trailing: *trailing,
            severity: *severity,
        })
        .collect()
});

static PHASE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"------|Entering directory").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyOptions {
    /// Return the whole log as the excerpt; used when a source-control
    /// command failed and every line of its log is relevant.
    pub report_entire_log: bool,
    pub check_cook: bool,
    pub check_publish: bool,
    pub check_errors: bool,
    pub check_warnings: bool,
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self {
            report_entire_log: false,
            check_cook: false,
            check_publish: false,
            check_errors: true,
            check_warnings: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Succeeded,
    Failed,
    /// Clean log, but the cooker never printed its success line.
    MissingCookMarker,
    /// Clean log, but CookerSync never printed its completion line.
    MissingPublishMarker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    /// [`SUCCEEDED`] when nothing matched, otherwise the matched lines.
    pub excerpt: String,
}

pub fn classify(log: &str, options: &ClassifyOptions) -> Classification {
    if options.report_entire_log {
        let text = log.trim();
        return if text.is_empty() {
            Classification {
                verdict: Verdict::Succeeded,
                excerpt: SUCCEEDED.to_string(),
            }
        } else {
            Classification {
                verdict: Verdict::Failed,
                excerpt: text.to_string(),
            }
        };
    }

    let lines: Vec<&str> = log.lines().collect();
    let mut excerpt: Vec<&str> = Vec::new();
    let mut phase: Option<&str> = None;
    let mut phase_reported = false;
    let mut cook_seen = false;
    let mut publish_seen = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        cook_seen |= line.contains(COOK_SUCCESS_MARKER);
        publish_seen |= line.contains(PUBLISH_SUCCESS_MARKER);

        if PHASE_MARKER.is_match(line) {
            phase = Some(line);
            phase_reported = false;
            i += 1;
            continue;
        }

        let Some(rule) = RULES.iter().find(|r| r.pattern.is_match(line)) else {
            i += 1;
            continue;
        };
        let keep = match rule.severity {
            Severity::Ignore => false,
            Severity::Error => options.check_errors,
            Severity::Warning => options.check_warnings,
        };
        if !keep {
            i += 1;
            continue;
        }

        if let Some(header) = phase.filter(|_| !phase_reported) {
            excerpt.push(header.trim_end());
            phase_reported = true;
        }
        let end = (i + 1 + rule.trailing).min(lines.len());
        for kept in &lines[i..end] {
            cook_seen |= kept.contains(COOK_SUCCESS_MARKER);
            publish_seen |= kept.contains(PUBLISH_SUCCESS_MARKER);
            excerpt.push(kept.trim_end());
        }
        i = end;
    }

    let verdict = if !excerpt.is_empty() {
        Verdict::Failed
    } else if options.check_cook && !cook_seen {
        Verdict::MissingCookMarker
    } else if options.check_publish && !publish_seen {
        Verdict::MissingPublishMarker
    } else {
        Verdict::Succeeded
    };

    Classification {
        verdict,
        excerpt: if excerpt.is_empty() {
            SUCCEEDED.to_string()
        } else {
            excerpt.join("\n")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cook() -> ClassifyOptions {
        ClassifyOptions {
            check_cook: true,
            ..ClassifyOptions::default()
        }
    }

    #[test]
    fn test_cook_marker_alone_succeeds() {
        let result = classify("Success - 0 error(s)\n", &cook());
        assert_eq!(result.verdict, Verdict::Succeeded);
        assert_eq!(result.excerpt, SUCCEEDED);
    }

    #[test]
    fn test_missing_cook_marker_fails_without_errors() {
        let log = "Cooking ExampleEntry\nSaving packages\n";
        let result = classify(log, &cook());
        assert_eq!(result.verdict, Verdict::MissingCookMarker);
        assert_eq!(result.excerpt, SUCCEEDED);

        let plain = classify(log, &ClassifyOptions::default());
        assert_eq!(plain.verdict, Verdict::Succeeded);
    }

    #[test]
    fn test_missing_publish_marker() {
        let options = ClassifyOptions {
            check_publish: true,
            ..ClassifyOptions::default()
        };
        assert_eq!(classify("Copying 12 files\n", &options).verdict, Verdict::MissingPublishMarker);
        let done = format!("Copying 12 files\n{PUBLISH_SUCCESS_MARKER}\n");
        assert_eq!(classify(&done, &options).verdict, Verdict::Succeeded);
    }

    #[test]
    fn test_errors_are_reported_under_their_phase() {
        let log = "\
------ Build started: Project: Engine ------
Compiling UnObj.cpp
------ Build started: Project: Core ------
Compiling UnName.cpp
UnName.cpp(88) : error C2065: 'Outer' : undeclared identifier
Core - 1 error(s), 0 warning(s)
";
        let result = classify(log, &ClassifyOptions::default());
        assert_eq!(result.verdict, Verdict::Failed);
        assert_eq!(
            result.excerpt,
            "------ Build started: Project: Core ------\nUnName.cpp(88) : error C2065: 'Outer' : undeclared identifier"
        );
    }

    #[test]
    fn test_phase_header_written_once() {
        let log = "make: Entering directory `/builds/Main/Development/Src'\nfoo.o: undefined reference to `bar'\nbaz.o: undefined reference to `qux'\n";
        let result = classify(log, &ClassifyOptions::default());
        assert_eq!(result.excerpt.lines().count(), 3);
        assert!(result.excerpt.starts_with("make: Entering directory"));
    }

    #[test]
    fn test_crash_keeps_call_stack() {
        let mut log = String::from("Loading map\n=== Critical error: ===\n");
        for frame in 0..12 {
            log.push_str(&format!("frame {frame}\n"));
        }
        let result = classify(&log, &ClassifyOptions::default());
        let lines: Vec<&str> = result.excerpt.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "=== Critical error: ===");
        assert_eq!(lines[10], "frame 9");
    }

    #[test]
    fn test_summary_lines_are_not_errors() {
        let log = "Build succeeded.\n    0 Error(s)\nCore - 0 errors, 0 warnings\n";
        assert_eq!(classify(log, &ClassifyOptions::default()).verdict, Verdict::Succeeded);
    }

    #[yare::parameterized(
        warnings_ignored = { false, Verdict::Succeeded },
        warnings_checked = { true, Verdict::Failed },
    )]
    fn test_warnings_only_when_checked(check_warnings: bool, expected: Verdict) {
        let log = "UnName.cpp(12) : warning C4244: conversion from 'double' to 'float'\n";
        let options = ClassifyOptions {
            check_warnings,
            ..ClassifyOptions::default()
        };
        assert_eq!(classify(log, &options).verdict, expected);
    }

    #[test]
    fn test_ignore_errors() {
        let options = ClassifyOptions {
            check_errors: false,
            ..ClassifyOptions::default()
        };
        let result = classify("Error, ExampleGame.u failed to compile\n", &options);
        assert_eq!(result.verdict, Verdict::Succeeded);
    }

    #[test]
    fn test_report_entire_log() {
        let options = ClassifyOptions {
            report_entire_log: true,
            ..ClassifyOptions::default()
        };
        let log = "Syncing '...' to #head\nconnect to server failed; check $P4PORT\n";
        let result = classify(log, &options);
        assert_eq!(result.verdict, Verdict::Failed);
        assert_eq!(result.excerpt, log.trim());
    }

    #[test]
    fn test_lock_conflict() {
        let log = "//depot/Main/Foo.upk - already locked by someone@their-desk\n";
        assert_eq!(classify(log, &ClassifyOptions::default()).verdict, Verdict::Failed);
    }
}
