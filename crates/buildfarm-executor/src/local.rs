//! Local child-process launcher.
//!
//! Each child gets its own process group so a kill takes down everything it
//! spawned. Reader tasks push output lines into a bounded queue that the
//! owning state machine drains once per tick.

use async_trait::async_trait;
use buildfarm_core::process::{
    CaptureMode, OutputLine, OutputStream, ProcessLauncher, ProcessSpec, RunningProcess,
};
use buildfarm_core::{Error, Result};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines buffered per child before the readers stop pulling from its pipes.
const OUTPUT_QUEUE_DEPTH: usize = 8192;

/// Launches build tools on the agent machine.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessLauncher;

impl LocalProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for LocalProcessLauncher {
    async fn start(&self, spec: ProcessSpec) -> Result<Box<dyn RunningProcess>> {
        let process = LocalProcess::spawn(spec)?;
        Ok(Box::new(process))
    }

    async fn kill_by_name(&self, name: &str) -> Result<()> {
        let mut command = if cfg!(windows) {
            let image = format!("{name}.exe");
            let mut c = Command::new("taskkill");
            c.args(["/F", "/IM", image.as_str()]);
            c
        } else {
            let mut c = Command::new("pkill");
            c.args(["-KILL", "-x", name]);
            c
        };
        let status = command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        // Both tools exit non-zero when nothing matched.
        debug!(process = %name, code = ?status.code(), "Killed processes by name");
        Ok(())
    }
}

/// A build tool running as a child of this agent.
pub struct LocalProcess {
    child: Child,
    pid: Option<u32>,
    lines: mpsc::Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
    activity: Arc<AtomicBool>,
    exit: Option<ExitStatus>,
    cpu_ticks: Option<u64>,
}

impl LocalProcess {
    pub fn spawn(spec: ProcessSpec) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let (stdout, stderr) = match spec.capture {
            CaptureMode::Both => (Stdio::piped(), Stdio::piped()),
            CaptureMode::Stdout => (Stdio::piped(), Stdio::null()),
            CaptureMode::None => (Stdio::null(), Stdio::null()),
        };
        command.stdout(stdout).stderr(stderr);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            Error::ExecutionFailed(format!("Failed to start '{}': {}", spec.display_line(), e))
        })?;
        let pid = child.id();
        info!(pid = ?pid, command = %spec.display_line(), "Started process");

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let activity = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(out, OutputStream::Stdout, tx.clone(), activity.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(err, OutputStream::Stderr, tx.clone(), activity.clone())));
        }

        Ok(Self {
            child,
            pid,
            lines: rx,
            readers,
            activity,
            exit: None,
            cpu_ticks: None,
        })
    }

    /// CPU time consumed so far, in clock ticks.
    #[cfg(target_os = "linux")]
    fn cpu_ticks(&self) -> Option<u64> {
        let pid = self.pid?;
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // Fields after the parenthesised command name start at state.
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_ticks(&self) -> Option<u64> {
        None
    }
}

async fn read_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>, activity: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                activity.store(true, Ordering::Relaxed);
                let content = String::from_utf8_lossy(&buf).trim_end().to_string();
                if tx.send(OutputLine { stream, content }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Output read error");
                break;
            }
        }
    }
}

#[async_trait]
impl RunningProcess for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn drain_output(&mut self) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Ok(line) = self.lines.try_recv() {
            lines.push(line);
        }
        lines
    }

    fn is_finished(&mut self) -> bool {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = ?self.pid, status = %status, "Process exited");
                    self.exit = Some(status);
                }
                Ok(None) => return false,
                Err(e) => {
                    warn!(pid = ?self.pid, error = %e, "Failed to poll process");
                    return false;
                }
            }
        }
        self.readers.iter().all(JoinHandle::is_finished)
    }

    fn is_responding(&mut self) -> bool {
        let saw_output = self.activity.swap(false, Ordering::Relaxed);
        let ticks = self.cpu_ticks();
        let busy = match (ticks, self.cpu_ticks) {
            (Some(now), Some(before)) => now > before,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if ticks.is_some() {
            self.cpu_ticks = ticks;
        }
        saw_output || busy
    }

    fn exit_code(&self) -> Option<i32> {
        let status = self.exit?;
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Some(128 + signal);
            }
        }
        status.code()
    }

    async fn kill(&mut self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "Failed to kill process group"),
            }
        }

        if self.exit.is_none() {
            match self.child.kill().await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(e) => return Err(Error::ExecutionFailed(format!("Failed to kill process: {}", e))),
            }
            self.exit = self.child.try_wait()?;
        }
        info!(pid = ?self.pid, "Killed process");
        Ok(())
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell(script: &str, capture: CaptureMode) -> ProcessSpec {
        let mut spec = ProcessSpec::new("/bin/sh", vec!["-c".into(), script.into()], std::env::temp_dir());
        spec.capture = capture;
        spec
    }

    async fn run_to_end(process: &mut Box<dyn RunningProcess>) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        for _ in 0..200 {
            lines.extend(process.drain_output());
            if process.is_finished() {
                lines.extend(process.drain_output());
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process did not finish");
    }

    #[tokio::test]
    async fn test_captures_ordered_output_and_exit_code() {
        let launcher = LocalProcessLauncher::new();
        let mut process = launcher
            .start(shell("echo one; echo two; echo oops >&2; exit 3", CaptureMode::Both))
            .await
            .unwrap();

        let lines = run_to_end(&mut process).await;
        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.content.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert!(lines.iter().any(|l| l.stream == OutputStream::Stderr && l.content == "oops"));
        assert_eq!(process.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_stdout_capture_drops_stderr() {
        let launcher = LocalProcessLauncher::new();
        let mut process = launcher
            .start(shell("echo kept; echo dropped >&2", CaptureMode::Stdout))
            .await
            .unwrap();

        let lines = run_to_end(&mut process).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].content, "kept");
        assert_eq!(process.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let launcher = LocalProcessLauncher::new();
        let spec = ProcessSpec::new("/nonexistent/tool", vec![], std::env::temp_dir());
        let err = launcher.start(spec).await.err().unwrap();
        assert!(matches!(err, Error::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_kill_terminates_process_group() {
        let launcher = LocalProcessLauncher::new();
        let mut process = launcher
            .start(shell("sleep 30 & sleep 30", CaptureMode::Both))
            .await
            .unwrap();
        assert!(!process.is_finished());

        process.kill().await.unwrap();
        run_to_end(&mut process).await;
        assert_eq!(process.exit_code(), Some(128 + 9));
    }

    #[tokio::test]
    async fn test_output_counts_as_responding() {
        let launcher = LocalProcessLauncher::new();
        let mut process = launcher
            .start(shell("echo alive; sleep 30", CaptureMode::Both))
            .await
            .unwrap();

        let mut responded = false;
        for _ in 0..100 {
            if process.is_responding() {
                responded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(responded);
        process.kill().await.unwrap();
    }
}
