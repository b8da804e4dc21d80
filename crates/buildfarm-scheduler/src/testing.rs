//! Hand-written collaborators shared by the scheduler's tests.

use async_trait::async_trait;
use buildfarm_config::{AgentConfig, Intervals};
use buildfarm_core::{
    ChangeDescription, Error, LabelDetails, Notification, Notifier, OutputLine, OutputStream,
    ProcessLauncher, ProcessSpec, Result, Revision, RunningProcess, SourceControl, SubmitOutcome,
    Workspace,
};
use buildfarm_db::MemoryWorkStore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use crate::Collaborators;

pub const MACHINE: &str = "build-07";
pub const BRANCH: &str = "Main";
pub const HEAD: i64 = 4321;

/// Source control that records every call and succeeds unless told otherwise.
#[derive(Default)]
pub struct MockSourceControl {
    pub calls: Mutex<Vec<String>>,
    pub failing: Mutex<HashSet<&'static str>>,
    pub labels: Mutex<HashMap<String, LabelDetails>>,
    pub changes: Mutex<Vec<ChangeDescription>>,
    pub inconsistent: Mutex<Vec<String>>,
    /// File specs that match nothing in the depot.
    pub missing: Mutex<HashSet<String>>,
    /// Number of submits that answer with a resolve request first.
    pub resolves_needed: Mutex<u32>,
}

impl MockSourceControl {
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub fn add_label(&self, name: &str, description: &str) {
        self.labels.lock().insert(
            name.to_string(),
            LabelDetails {
                name: name.to_string(),
                description: description.to_string(),
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, operation: &'static str, detail: String) -> Result<()> {
        self.calls.lock().push(format!("{operation} {detail}").trim_end().to_string());
        if self.failing.lock().contains(operation) {
            return Err(Error::SourceControl(format!("{operation} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceControl for MockSourceControl {
    async fn sync(&self, _ws: &Workspace, file_spec: &str, revision: &Revision) -> Result<i64> {
        self.record("sync", format!("{file_spec}{revision}"))?;
        Ok(match revision {
            Revision::ChangeList(cl) => *cl,
            _ => HEAD,
        })
    }

    async fn sync_change(&self, _ws: &Workspace, changelist: i64) -> Result<()> {
        self.record("sync_change", changelist.to_string())
    }

    async fn checkout(&self, _ws: &Workspace, file_spec: &str) -> Result<usize> {
        self.record("checkout", file_spec.to_string())?;
        if self.missing.lock().contains(file_spec) {
            return Ok(0);
        }
        Ok(1)
    }

    async fn open_for_delete(&self, _ws: &Workspace, file_spec: &str) -> Result<usize> {
        self.record("open_for_delete", file_spec.to_string())?;
        Ok(1)
    }

    async fn revert(&self, _ws: &Workspace, file_spec: &str) -> Result<()> {
        self.record("revert", file_spec.to_string())
    }

    async fn submit(&self, _ws: &Workspace, description: &str) -> Result<SubmitOutcome> {
        self.record("submit", description.to_string())?;
        let mut pending = self.resolves_needed.lock();
        if *pending > 0 {
            *pending -= 1;
            return Ok(SubmitOutcome::NeedsResolve {
                files: vec!["//depot/Main/Foo/Bar.txt".to_string()],
            });
        }
        Ok(SubmitOutcome::Submitted { changelist: HEAD + 1 })
    }

    async fn resolve(&self, _ws: &Workspace) -> Result<()> {
        self.record("resolve", String::new())
    }

    async fn create_label(&self, _ws: &Workspace, label: &str, description: &str, revision: &Revision) -> Result<()> {
        self.record("create_label", format!("{label}{revision}"))?;
        self.add_label(label, description);
        Ok(())
    }

    async fn update_label_description(&self, _ws: &Workspace, label: &str, description: &str) -> Result<()> {
        self.record("update_label_description", label.to_string())?;
        self.add_label(label, description);
        Ok(())
    }

    async fn delete_label(&self, _ws: &Workspace, label: &str) -> Result<()> {
        self.record("delete_label", label.to_string())?;
        self.labels.lock().remove(label);
        Ok(())
    }

    async fn label(&self, _ws: &Workspace, label: &str) -> Result<Option<LabelDetails>> {
        Ok(self.labels.lock().get(label).cloned())
    }

    async fn tag(&self, _ws: &Workspace, file_spec: &str, label: &str, revision: &Revision) -> Result<()> {
        self.record("tag", format!("{file_spec} {label} {revision}"))
    }

    async fn changes_since(&self, _ws: &Workspace, changelist: i64) -> Result<Vec<ChangeDescription>> {
        self.record("changes_since", changelist.to_string())?;
        Ok(self
            .changes
            .lock()
            .iter()
            .filter(|c| c.changelist > changelist)
            .cloned()
            .collect())
    }

    async fn inconsistent_files(&self, _ws: &Workspace, file_spec: &str) -> Result<Vec<String>> {
        self.record("inconsistent_files", file_spec.to_string())?;
        Ok(self.inconsistent.lock().clone())
    }

    async fn client_root(&self, ws: &Workspace) -> Result<PathBuf> {
        Ok(ws.root.clone())
    }
}

/// A scripted child process.
pub struct MockProcess {
    output: Vec<OutputLine>,
    finished: bool,
    responding: bool,
    exit_code: Option<i32>,
    pub killed: Arc<AtomicBool>,
}

impl MockProcess {
    /// Prints `lines` and exits with `code` on the first poll.
    pub fn exits(code: i32, lines: &[&str]) -> Self {
        Self {
            output: lines
                .iter()
                .map(|l| OutputLine {
                    stream: OutputStream::Stdout,
                    content: l.to_string(),
                })
                .collect(),
            finished: true,
            responding: true,
            exit_code: Some(code),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Never exits on its own.
    pub fn hangs(responding: bool) -> Self {
        Self {
            output: Vec::new(),
            finished: false,
            responding,
            exit_code: None,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl RunningProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn drain_output(&mut self) -> Vec<OutputLine> {
        std::mem::take(&mut self.output)
    }

    fn is_finished(&mut self) -> bool {
        self.finished || self.killed.load(Ordering::SeqCst)
    }

    fn is_responding(&mut self) -> bool {
        self.responding
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit_code = Some(-1);
        Ok(())
    }
}

/// Hands out scripted processes in order; a clean exit once they run out.
#[derive(Default)]
pub struct MockLauncher {
    pub queued: Mutex<VecDeque<MockProcess>>,
    pub started: Mutex<Vec<ProcessSpec>>,
    pub killed_names: Mutex<Vec<String>>,
    pub refuse_start: AtomicBool,
}

impl MockLauncher {
    pub fn push(&self, process: MockProcess) -> Arc<AtomicBool> {
        let killed = process.killed.clone();
        self.queued.lock().push_back(process);
        killed
    }

    pub fn started(&self) -> Vec<ProcessSpec> {
        self.started.lock().clone()
    }
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn start(&self, spec: ProcessSpec) -> Result<Box<dyn RunningProcess>> {
        if self.refuse_start.load(Ordering::SeqCst) {
            return Err(Error::ExecutionFailed(format!("cannot start {}", spec.program)));
        }
        self.started.lock().push(spec);
        let process = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockProcess::exits(0, &[]));
        Ok(Box::new(process))
    }

    async fn kill_by_name(&self, name: &str) -> Result<()> {
        self.killed_names.lock().push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.sent.lock().push(notification);
        Ok(())
    }
}

/// A temporary agent root with mock collaborators around a memory store.
pub struct Harness {
    pub store: Arc<MemoryWorkStore>,
    pub scc: Arc<MockSourceControl>,
    pub launcher: Arc<MockLauncher>,
    pub notifier: Arc<RecordingNotifier>,
    pub config: AgentConfig,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = AgentConfig::new(MACHINE, dir.path());
        config.intervals = Intervals::immediate();
        config.operation_timeout = Duration::from_secs(60);
        config.responding_timeout = Duration::from_secs(30);
        config.kill_list = vec!["mspdbsrv".to_string()];
        Self {
            store: Arc::new(MemoryWorkStore::new()),
            scc: Arc::new(MockSourceControl::default()),
            launcher: Arc::new(MockLauncher::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            config,
            dir,
        }
    }

    pub fn deps(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            scc: self.scc.clone(),
            launcher: self.launcher.clone(),
            notifier: self.notifier.clone(),
            config: Arc::new(self.config.clone()),
        }
    }

    pub fn workspace(&self) -> PathBuf {
        self.config.workspace_root(BRANCH)
    }

    /// Write `<script>.txt` into the branch's script directory.
    pub fn write_script(&self, script: &str, text: &str) {
        let dir = self.workspace().join(&self.config.script_dir);
        std::fs::create_dir_all(&dir).expect("script dir");
        std::fs::write(dir.join(format!("{script}.txt")), text).expect("script");
    }
}
