//! JSONL audit log for submission lifecycle events.
//!
//! Mirrors the teacher crate's session-completion log: one append-only
//! JSONL file per month, with retention pruning. The shared token never
//! appears in any record written here.

use std::fs::{self, create_dir_all, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{Datelike, Utc};
use serde::Serialize;
use tracing::warn;

const LOG_DIR_ENV: &str = "JUDGE_AUDIT_LOG_DIR";
const RETENTION_ENV: &str = "JUDGE_AUDIT_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/audit";
const DEFAULT_RETENTION_DAYS: u64 = 90;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionEvent {
    Enqueued,
    Started,
    Finished,
    CleanedUp,
    BackedUp,
}

#[derive(Serialize)]
struct AuditRecord {
    timestamp: String,
    submission_id: String,
    event: SubmissionEvent,
    detail: Option<String>,
}

fn log_base_dir() -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
}

fn retention_days() -> u64 {
    std::env::var(RETENTION_ENV)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

/// Append one lifecycle event for `submission_id` to the current month's log.
pub fn record(submission_id: &str, event: SubmissionEvent, detail: Option<String>) {
    if let Err(err) = try_record(submission_id, event, detail) {
        warn!(submission_id, error = %err, "failed to append audit log entry");
    }
}

fn try_record(
    submission_id: &str,
    event: SubmissionEvent,
    detail: Option<String>,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let record = AuditRecord {
        timestamp: now.to_rfc3339(),
        submission_id: submission_id.to_string(),
        event,
        detail,
    };

    let base_dir = log_base_dir();
    let month_dir = base_dir
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()));
    let path = month_dir.join("submissions.jsonl");
    append_json_line(&path, &record)?;
    enforce_retention(&base_dir)?;
    Ok(())
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", serde_json::to_string(value)?)?;
    writer.flush()?;
    Ok(())
}

fn enforce_retention(base_dir: &Path) -> anyhow::Result<()> {
    let retention = retention_days();
    if retention == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);
    prune_directory(base_dir, cutoff)
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> anyhow::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata.modified().map(|time| time < cutoff).unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_persist_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(LOG_DIR_ENV, dir.path());
        std::env::set_var(RETENTION_ENV, "0");

        record("sub-1", SubmissionEvent::Enqueued, None);
        record(
            "sub-1",
            SubmissionEvent::Finished,
            Some("status=success".to_string()),
        );

        let year_dir = dir.path().read_dir().unwrap().next().unwrap().unwrap().path();
        let month_dir = year_dir.read_dir().unwrap().next().unwrap().unwrap().path();
        let log_path = month_dir.join("submissions.jsonl");
        let contents = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"submission_id\":\"sub-1\""));
    }
}
