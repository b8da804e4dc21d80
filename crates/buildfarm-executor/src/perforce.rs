//! Perforce source control through the `p4` command line client.
//!
//! Every call runs `p4 -c <client> -d <root> ...` from the workspace root so
//! relative file specs such as `...` resolve against the client.

use async_trait::async_trait;
use buildfarm_core::{
    ChangeDescription, Error, LabelDetails, Result, Revision, SourceControl, SubmitOutcome, Workspace,
};
use chrono::{NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

static CHANGE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Change (\d+) on (\d{4}/\d{2}/\d{2}(?: \d{2}:\d{2}:\d{2})?) by ([^@\s]+)@").unwrap()
});
static SUBMITTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Change (\d+) (?:renamed change (\d+) and )?submitted").unwrap());
static MUST_RESOLVE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\S+) - must resolve").unwrap());

/// Output of one `p4` invocation.
struct P4Output {
    success: bool,
    stdout: String,
    stderr: String,
}

impl P4Output {
    fn into_result(self) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(Error::SourceControl(self.stderr.trim().to_string()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerforceClient {
    program: String,
}

impl Default for PerforceClient {
    fn default() -> Self {
        Self::new("p4")
    }
}

impl PerforceClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    async fn exec(&self, ws: &Workspace, args: &[&str], input: Option<&str>) -> Result<P4Output> {
        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg(&ws.client_spec)
            .arg("-d")
            .arg(&ws.root)
            .args(args)
            .current_dir(&ws.root)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(client = %ws.client_spec, args = ?args, "Running p4");

        let mut child = command
            .spawn()
            .map_err(|e| Error::SourceControl(format!("failed to start {}: {e}", self.program)))?;
        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(text.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        Ok(P4Output {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run(&self, ws: &Workspace, args: &[&str]) -> Result<String> {
        self.exec(ws, args, None).await?.into_result()
    }

    async fn label_spec(&self, ws: &Workspace, label: &str) -> Result<String> {
        self.run(ws, &["label", "-o", label]).await
    }

    async fn write_label(&self, ws: &Workspace, label: &str, description: &str) -> Result<()> {
        let spec = with_description(&self.label_spec(ws, label).await?, description);
        self.exec(ws, &["label", "-i"], Some(&spec)).await?.into_result()?;
        Ok(())
    }
}

/// `<spec><revision>`, with head spelled the way `p4 changes` wants it.
fn at(file_spec: &str, revision: &Revision) -> String {
    match revision {
        Revision::Head => format!("{file_spec}#have"),
        other => format!("{file_spec}{other}"),
    }
}

/// Lines of `output` that report a file opened with `action`.
fn count_opened(output: &str, action: &str) -> usize {
    let marker = format!(" - opened for {action}");
    output.lines().filter(|l| l.contains(&marker)).count()
}

fn parse_change_number(output: &str) -> Option<i64> {
    output.lines().find_map(|l| CHANGE_HEADER.captures(l).and_then(|c| c[1].parse().ok()))
}

fn parse_submit(output: &str) -> Option<SubmitOutcome> {
    if let Some(caps) = SUBMITTED.captures(output) {
        let changelist = caps.get(2).or_else(|| caps.get(1))?.as_str().parse().ok()?;
        return Some(SubmitOutcome::Submitted { changelist });
    }
    let files: Vec<String> = output
        .lines()
        .filter_map(|l| MUST_RESOLVE.captures(l.trim()).map(|c| c[1].to_string()))
        .collect();
    (!files.is_empty()).then_some(SubmitOutcome::NeedsResolve { files })
}

/// Parse `p4 changes -l` output, oldest change first.
fn parse_changes(output: &str) -> Vec<ChangeDescription> {
    let mut changes: Vec<ChangeDescription> = Vec::new();
    for line in output.lines() {
        if let Some(caps) = CHANGE_HEADER.captures(line) {
            let Ok(changelist) = caps[1].parse() else {
                continue;
            };
            let stamp = &caps[2];
            let submitted_at = NaiveDateTime::parse_from_str(stamp, "%Y/%m/%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(&format!("{stamp} 00:00:00"), "%Y/%m/%d %H:%M:%S"))
                .map(|naive| Utc.from_utc_datetime(&naive))
                .unwrap_or_default();
            changes.push(ChangeDescription {
                changelist,
                user: caps[3].to_string(),
                submitted_at,
                description: String::new(),
                files: Vec::new(),
            });
        } else if let Some(change) = changes.last_mut() {
            let text = line.trim();
            if !text.is_empty() {
                if !change.description.is_empty() {
                    change.description.push('\n');
                }
                change.description.push_str(text);
            }
        }
    }
    changes.sort_by_key(|c| c.changelist);
    changes
}

/// The `Description:` field of a label or change spec.
fn spec_description(spec: &str) -> String {
    let mut lines = spec.lines().skip_while(|l| !l.starts_with("Description:"));
    let mut description = String::new();
    if let Some(first) = lines.next() {
        let inline = first.trim_start_matches("Description:").trim();
        if !inline.is_empty() {
            description.push_str(inline);
            description.push('\n');
        }
    }
    for line in lines.take_while(|l| l.starts_with('\t') || l.is_empty()) {
        description.push_str(line.trim_start_matches('\t'));
        description.push('\n');
    }
    description.trim_end().to_string() + "\n"
}

/// Replace the `Description:` field of a spec form.
fn with_description(spec: &str, description: &str) -> String {
    let mut out = String::new();
    let mut lines = spec.lines().peekable();
    while let Some(line) = lines.next() {
        if line.starts_with("Description:") {
            out.push_str("Description:\n");
            for text in description.lines() {
                out.push('\t');
                out.push_str(text);
                out.push('\n');
            }
            while lines.peek().is_some_and(|l| l.starts_with('\t') || l.is_empty()) {
                lines.next();
            }
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[async_trait]
impl SourceControl for PerforceClient {
    async fn sync(&self, ws: &Workspace, file_spec: &str, revision: &Revision) -> Result<i64> {
        let target = format!("{file_spec}{revision}");
        let sync = self.exec(ws, &["sync", &target], None).await?;
        // "file(s) up-to-date." arrives on stderr with a zero exit.
        if !sync.success {
            return Err(Error::SourceControl(sync.stderr.trim().to_string()));
        }
        let changes = self
            .run(ws, &["changes", "-m1", "-s", "submitted", &at(file_spec, revision)])
            .await?;
        Ok(parse_change_number(&changes).unwrap_or_default())
    }

    async fn sync_change(&self, ws: &Workspace, changelist: i64) -> Result<()> {
        self.run(ws, &["sync", &format!("@={changelist}")]).await?;
        Ok(())
    }

    async fn checkout(&self, ws: &Workspace, file_spec: &str) -> Result<usize> {
        let output = self.run(ws, &["edit", file_spec]).await?;
        Ok(count_opened(&output, "edit"))
    }

    async fn open_for_delete(&self, ws: &Workspace, file_spec: &str) -> Result<usize> {
        let output = self.run(ws, &["delete", file_spec]).await?;
        Ok(count_opened(&output, "delete"))
    }

    async fn revert(&self, ws: &Workspace, file_spec: &str) -> Result<()> {
        self.run(ws, &["revert", file_spec]).await?;
        Ok(())
    }

    async fn submit(&self, ws: &Workspace, description: &str) -> Result<SubmitOutcome> {
        let output = self.exec(ws, &["submit", "-d", description], None).await?;
        let text = format!("{}\n{}", output.stdout, output.stderr);
        parse_submit(&text).ok_or_else(|| Error::SourceControl(output.stderr.trim().to_string()))
    }

    async fn resolve(&self, ws: &Workspace) -> Result<()> {
        self.run(ws, &["resolve", "-ay"]).await?;
        Ok(())
    }

    async fn create_label(&self, ws: &Workspace, label: &str, description: &str, revision: &Revision) -> Result<()> {
        self.write_label(ws, label, description).await?;
        let target = format!("...{revision}");
        self.run(ws, &["tag", "-l", label, &target]).await?;
        Ok(())
    }

    async fn update_label_description(&self, ws: &Workspace, label: &str, description: &str) -> Result<()> {
        self.write_label(ws, label, description).await
    }

    async fn delete_label(&self, ws: &Workspace, label: &str) -> Result<()> {
        self.run(ws, &["label", "-d", label]).await?;
        Ok(())
    }

    async fn label(&self, ws: &Workspace, label: &str) -> Result<Option<LabelDetails>> {
        let listed = self.run(ws, &["labels", "-e", label]).await?;
        if listed.trim().is_empty() {
            return Ok(None);
        }
        let spec = self.label_spec(ws, label).await?;
        Ok(Some(LabelDetails {
            name: label.to_string(),
            description: spec_description(&spec),
        }))
    }

    async fn tag(&self, ws: &Workspace, file_spec: &str, label: &str, revision: &Revision) -> Result<()> {
        let target = format!("{file_spec}{revision}");
        self.run(ws, &["tag", "-l", label, &target]).await?;
        Ok(())
    }

    async fn changes_since(&self, ws: &Workspace, changelist: i64) -> Result<Vec<ChangeDescription>> {
        let range = format!("...@{},#head", changelist + 1);
        let output = self.run(ws, &["changes", "-l", "-t", "-s", "submitted", &range]).await?;
        Ok(parse_changes(&output))
    }

    async fn inconsistent_files(&self, ws: &Workspace, file_spec: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for check in ["-se", "-sd"] {
            let output = self.run(ws, &["diff", check, file_spec]).await?;
            files.extend(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string));
        }
        Ok(files)
    }

    async fn client_root(&self, ws: &Workspace) -> Result<PathBuf> {
        let output = self.run(ws, &["info"]).await?;
        output
            .lines()
            .find_map(|l| l.strip_prefix("Client root: "))
            .map(|root| PathBuf::from(root.trim()))
            .ok_or_else(|| Error::SourceControl(format!("no client root for '{}'", ws.client_spec)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    const CHANGES: &str = "\
Change 1205 on 2024/03/01 17:40:12 by carol@carol_main

\tFix crash in the cooker
\twhen a package is missing

Change 1201 on 2024/03/01 09:02:55 by dave@dave_main

\tNew foliage meshes
";

    #[test]
    fn test_parse_changes_oldest_first() {
        let changes = parse_changes(CHANGES);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].changelist, 1201);
        assert_eq!(changes[0].user, "dave");
        assert_eq!(changes[1].description, "Fix crash in the cooker\nwhen a package is missing");
        assert_eq!(
            changes[1].submitted_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 17, 40, 12).unwrap()
        );
    }

    #[parameterized(
        plain = { "Submitting change 4322.\nChange 4322 submitted.\n", Some(4322) },
        renamed = { "Change 4300 renamed change 4322 and submitted.\n", Some(4322) },
        nothing = { "No files to submit.\n", None },
    )]
    fn test_parse_submitted(output: &str, expected: Option<i64>) {
        let changelist = match parse_submit(output) {
            Some(SubmitOutcome::Submitted { changelist }) => Some(changelist),
            _ => None,
        };
        assert_eq!(changelist, expected);
    }

    #[test]
    fn test_parse_submit_needs_resolve() {
        let output = "Merges still pending -- use 'resolve' to merge files.\n//depot/Main/Foo/Bar.txt - must resolve #5\n";
        assert_eq!(
            parse_submit(output),
            Some(SubmitOutcome::NeedsResolve {
                files: vec!["//depot/Main/Foo/Bar.txt".to_string()]
            })
        );
    }

    #[test]
    fn test_count_opened() {
        let output = "//depot/Main/a.txt#3 - opened for edit\n//depot/Main/b.txt#1 - opened for edit\n//depot/Main/c.txt - currently opened for edit\n";
        assert_eq!(count_opened(output, "edit"), 2);
        assert_eq!(count_opened(output, "delete"), 0);
    }

    #[test]
    fn test_label_description_round_trip() {
        let spec = "Label:\tMain_[2024-03-01_17.45]\n\nOwner:\tbuilder\n\nDescription:\n\tCreated by builder.\n\nOptions:\tunlocked noautoreload\n\nView:\n\t//depot/...\n";
        let updated = with_description(spec, "Label created automatically by the build farm\nchangelist: 1200\n");
        assert_eq!(
            spec_description(&updated),
            "Label created automatically by the build farm\nchangelist: 1200\n"
        );
        assert!(updated.contains("Options:\tunlocked noautoreload"));
        assert!(updated.contains("View:\n\t//depot/...\n"));
    }

    #[test]
    fn test_head_changes_use_have_revision() {
        assert_eq!(at("...", &Revision::Head), "...#have");
        assert_eq!(at("...", &Revision::ChangeList(12)), "...@12");
    }

    #[test]
    fn test_change_number_from_changes_output() {
        assert_eq!(parse_change_number("Change 4321 on 2024/03/01 by alice@ws 'Fix'\n"), Some(4321));
        assert_eq!(parse_change_number(""), None);
    }
}
