//! Per-command log files.
//!
//! Each dispatched command gets its own text log under the branch's log
//! directory. The classifier reads it back when the command finishes, and a
//! failed run's last log is copied into the shared failure archive.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct CommandLog {
    file_name: String,
    path: Option<PathBuf>,
    file: Option<File>,
    contents: String,
}

impl CommandLog {
    /// Create `dir/file_name`. If the file cannot be created the log is kept
    /// in memory only, so a full disk never stops a build from reporting.
    pub fn open(dir: &Path, file_name: &str) -> Self {
        let path = dir.join(file_name);
        let file = fs::create_dir_all(dir).and_then(|_| File::create(&path));
        match file {
            Ok(file) => Self {
                file_name: file_name.to_string(),
                path: Some(path),
                file: Some(file),
                contents: String::new(),
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to create command log");
                Self::detached(file_name)
            }
        }
    }

    /// A log that is never written to disk.
    pub fn detached(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            path: None,
            file: None,
            contents: String::new(),
        }
    }

    pub fn write(&mut self, line: &str) {
        info!(target: "buildfarm::build", "{line}");
        self.contents.push_str(line);
        self.contents.push('\n');
        if let Some(file) = &mut self.file {
            if let Err(e) = writeln!(file, "{line}") {
                warn!(error = %e, "Failed to write command log; keeping it in memory");
                self.file = None;
            }
        }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the log into `dir` under its own name.
    pub fn copy_to(&mut self, dir: &Path) -> std::io::Result<PathBuf> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        fs::create_dir_all(dir)?;
        let target = dir.join(&self.file_name);
        fs::write(&target, &self.contents)?;
        Ok(target)
    }
}
