//! Changes report collation.
//!
//! Changelist descriptions may carry `#Section` tags. When a script asks for
//! report sections with `report`, each change is listed under the first
//! requested section it is tagged with, and untagged changes fall into a
//! trailing general section. Changes the build farm submitted itself are
//! left out.

use buildfarm_core::ChangeDescription;
use regex::Regex;
use std::sync::LazyLock;

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#([A-Za-z][A-Za-z0-9_]*)").unwrap());

const FARM_PREFIX: &str = "[BUILDER] ";
const GENERAL_SECTION: &str = "General";

fn is_farm_change(change: &ChangeDescription) -> bool {
    change.description.starts_with(FARM_PREFIX)
}

fn section_for<'a>(change: &ChangeDescription, sections: &'a [String]) -> Option<&'a str> {
    TAG_REGEX
        .captures_iter(&change.description)
        .find_map(|caps| {
            sections
                .iter()
                .find(|s| s.eq_ignore_ascii_case(&caps[1]))
                .map(String::as_str)
        })
}

fn write_change(out: &mut String, change: &ChangeDescription) {
    out.push_str(&format!(
        "Change {} by {} on {}\n",
        change.changelist,
        change.user,
        change.submitted_at.format("%Y/%m/%d %H:%M")
    ));
    for line in change.description.lines().filter(|l| !l.trim().is_empty()) {
        out.push_str("    ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.push('\n');
}

/// Render the changes since the last good build, grouped by section.
pub fn collate(changes: &[ChangeDescription], sections: &[String]) -> String {
    let relevant: Vec<&ChangeDescription> = changes.iter().filter(|c| !is_farm_change(c)).collect();
    if relevant.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    for section in sections {
        let tagged: Vec<_> = relevant
            .iter()
            .filter(|c| section_for(c, sections) == Some(section.as_str()))
            .collect();
        if tagged.is_empty() {
            continue;
        }
        out.push_str(&format!("[{section}]\n"));
        for change in tagged {
            write_change(&mut out, change);
        }
    }

    let untagged: Vec<_> = relevant
        .iter()
        .filter(|c| section_for(c, sections).is_none())
        .collect();
    if !untagged.is_empty() {
        if !sections.is_empty() {
            out.push_str(&format!("[{GENERAL_SECTION}]\n"));
        }
        for change in untagged {
            write_change(&mut out, change);
        }
    }

    out
}

/// Distinct users who submitted the given changes, in first-seen order.
pub fn submitters(changes: &[ChangeDescription]) -> Vec<String> {
    let mut users: Vec<String> = Vec::new();
    for change in changes.iter().filter(|c| !is_farm_change(c)) {
        if !users.contains(&change.user) {
            users.push(change.user.clone());
        }
    }
    users
}
