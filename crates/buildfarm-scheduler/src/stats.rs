//! Machine resource samples.
//!
//! Read from `/proc` and `statvfs`; anything unavailable on the host reads
//! as zero rather than failing the heartbeat.

use buildfarm_core::ResourceSample;
use std::path::Path;

pub fn sample(root: &Path) -> ResourceSample {
    ResourceSample {
        load_average: std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|text| parse_loadavg(&text))
            .unwrap_or_default(),
        memory_used_percent: std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_meminfo(&text))
            .unwrap_or_default(),
        disk_free_mb: free_space_mb(root).unwrap_or_default(),
    }
}

/// Megabytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
pub fn free_space_mb(path: &Path) -> Option<i64> {
    let stats = nix::sys::statvfs::statvfs(path).ok()?;
    let bytes = u64::from(stats.blocks_available()).checked_mul(u64::from(stats.fragment_size()))?;
    i64::try_from(bytes / (1024 * 1024)).ok()
}

#[cfg(not(unix))]
pub fn free_space_mb(_path: &Path) -> Option<i64> {
    None
}

/// One-minute load average.
fn parse_loadavg(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

fn parse_meminfo(text: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        let line = text.lines().find(|l| l.starts_with(name))?;
        line[name.len()..].split_whitespace().next()?.parse().ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

/// Free space report for every configured storage location.
pub fn storage_report(locations: &[impl AsRef<Path>]) -> String {
    locations
        .iter()
        .map(|location| {
            let location = location.as_ref();
            match free_space_mb(location) {
                Some(mb) => format!("{}: {} MB free", location.display(), mb),
                None => format!("{}: unavailable", location.display()),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));
        assert_eq!(parse_loadavg(""), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16000000 kB\nMemFree:         2000000 kB\nMemAvailable:    4000000 kB\n";
        assert_eq!(parse_meminfo(text), Some(75.0));
        assert_eq!(parse_meminfo("MemTotal: 100 kB\n"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_free_space_of_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_space_mb(dir.path()).is_some());
        let report = storage_report(&[dir.path()]);
        assert!(report.contains("MB free"));
    }
}
