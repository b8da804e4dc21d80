//! Inline status markers.
//!
//! Every line a run writes (tool output and interpreter notices alike) is
//! inspected for markers that update the run's status, time a named section
//! or report a network glitch.

use tokio::time::Instant;

const STATUS_PREFIX: &str = "[STATUS] ";
const SEPARATOR: &str = "------";
const GLITCH_MARKER: &str = "=> NETWORK ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Status(String),
    WatchStart(String),
    WatchStop,
    WatchTime { key: String, value: i64 },
    Glitch,
}

pub fn inspect(line: &str) -> Option<StatusEvent> {
    let line = line.trim();

    if let Some(text) = line.strip_prefix(STATUS_PREFIX) {
        return Some(StatusEvent::Status(text.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix("[WATCHSTART ") {
        let key = rest.trim_end_matches(']').trim();
        return (!key.is_empty()).then(|| StatusEvent::WatchStart(key.to_string()));
    }
    if line.starts_with("[WATCHSTOP]") {
        return Some(StatusEvent::WatchStop);
    }
    if let Some(rest) = line.strip_prefix("[WATCHTIME ") {
        let mut parts = rest.trim_end_matches(']').split_whitespace();
        let key = parts.next()?;
        let value = parts.next()?.parse().ok()?;
        return Some(StatusEvent::WatchTime {
            key: key.to_string(),
            value,
        });
    }
    if line.contains(GLITCH_MARKER) {
        return Some(StatusEvent::Glitch);
    }
    if let Some(start) = line.find(SEPARATOR) {
        let rest = &line[start + SEPARATOR.len()..];
        let text = match rest.find(SEPARATOR) {
            Some(end) => &rest[..end],
            None => rest,
        };
        let text = text.trim();
        if !text.is_empty() {
            return Some(StatusEvent::Status(text.to_string()));
        }
    }
    None
}

/// Times one named section at a time.
#[derive(Debug, Default)]
pub struct Stopwatch {
    running: Option<(String, Instant)>,
}

impl Stopwatch {
    /// Start timing `key`, discarding any section already running.
    pub fn start(&mut self, key: impl Into<String>) {
        self.running = Some((key.into(), Instant::now()));
    }

    /// Stop the running section, returning its key and elapsed milliseconds.
    pub fn stop(&mut self) -> Option<(String, i64)> {
        let (key, started) = self.running.take()?;
        let millis = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        Some((key, millis))
    }
}
