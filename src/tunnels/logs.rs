//! Per-tunnel agent log helpers.
//!
//! Agents write to `{log_dir}/tunnel-{id}.log` (append-only, shared across
//! restarts). These helpers are read-side only and deliberately infallible:
//! a missing or unreadable log yields nothing rather than an error, because
//! they feed status diagnostics that must never fail a status query.

use std::path::{Path, PathBuf};

use tokio::fs;

/// Log file path for a tunnel id.
#[must_use]
pub fn log_path(log_dir: &Path, id: &str) -> PathBuf {
    log_dir.join(format!("tunnel-{id}.log"))
}

/// Last non-empty line of the log, or `None` on any I/O problem.
pub async fn last_line(path: &Path) -> Option<String> {
    let data = fs::read(path).await.ok()?;
    let text = String::from_utf8_lossy(&data);
    text.lines()
        .rev()
        .map(str::trim_end)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}

/// Last `n` lines of the log for diagnostics. Empty on any I/O problem.
pub async fn tail(path: &Path, n: usize) -> Vec<String> {
    let Ok(data) = fs::read(path).await else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&data);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_keyed_by_id() {
        let path = log_path(Path::new("/var/lib/tunneld/logs"), "ab12cd34");
        assert_eq!(
            path,
            PathBuf::from("/var/lib/tunneld/logs/tunnel-ab12cd34.log")
        );
    }

    #[tokio::test]
    async fn test_last_line_skips_trailing_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel-x.log");
        fs::write(&path, "first\nconnection refused\n\n\n")
            .await
            .unwrap();
        assert_eq!(
            last_line(&path).await.as_deref(),
            Some("connection refused")
        );
    }

    #[tokio::test]
    async fn test_last_line_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(last_line(&dir.path().join("nope.log")).await.is_none());
    }

    #[tokio::test]
    async fn test_tail_returns_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel-x.log");
        fs::write(&path, "a\nb\nc\nd\n").await.unwrap();
        assert_eq!(tail(&path, 2).await, vec!["c", "d"]);
        assert_eq!(tail(&path, 10).await, vec!["a", "b", "c", "d"]);
        assert!(tail(&dir.path().join("nope.log"), 5).await.is_empty());
    }
}
