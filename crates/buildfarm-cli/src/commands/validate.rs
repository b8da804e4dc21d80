//! Offline build-script checking.

use anyhow::{Context, Result, bail};
use buildfarm_config::{ExpansionContext, ScriptInterpreter, ScriptState};
use buildfarm_core::Command;
use chrono::Utc;
use std::path::Path;

/// A line the agent would refuse to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptProblem {
    pub line: usize,
    pub message: String,
}

/// Interpret a whole script without running anything.
pub fn check_script(text: &str, branch: &str) -> (usize, Vec<ScriptProblem>) {
    let mut interpreter = ScriptInterpreter::from_text(text);
    let mut state = ScriptState::new("Validate", branch, Utc::now());
    let ctx = ExpansionContext::new();
    let mut problems = Vec::new();
    let mut commands = 0;

    loop {
        let parsed = interpreter.parse_next_line(&mut state, &ctx);
        for notice in parsed.notices.iter().filter(|n| n.starts_with("Error")) {
            problems.push(ScriptProblem {
                line: state.line_count,
                message: notice.clone(),
            });
        }
        match parsed.command {
            Command::Finished => break,
            Command::Error => {
                let failure = state.error.take();
                problems.push(ScriptProblem {
                    line: state.line_count,
                    message: match failure {
                        Some(failure) => format!("{failure}: '{}'", state.command_line),
                        None => format!("'{}'", state.command_line),
                    },
                });
            }
            Command::Config => {}
            _ => commands += 1,
        }
    }

    (commands, problems)
}

pub fn validate(path: &Path, branch: &str) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script: {}", path.display()))?;

    let (commands, problems) = check_script(&text, branch);
    for problem in &problems {
        println!("  line {}: {}", problem.line, problem.message);
    }

    if !problems.is_empty() {
        bail!("{} problem(s) in {}", problems.len(), path.display());
    }

    println!("✓ {} is valid ({} commands)", path.display(), commands);
    Ok(())
}
