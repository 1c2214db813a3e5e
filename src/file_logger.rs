use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use log::warn;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPhase {
    Request,
    Response,
    Error,
    Event,
}

/// A single JSONL line in the daily wire log. Request and response lines
/// for one HTTP call share a `flow_id`.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub slot: usize,
    pub action: String,
    pub phase: LogPhase,
    pub flow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    fn new(slot: usize, action: &str, phase: LogPhase, flow_id: &str) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339(),
            slot,
            action: action.to_string(),
            phase,
            flow_id: flow_id.to_string(),
            duration_ms: None,
            details: None,
        }
    }

    pub fn request(slot: usize, action: &str, flow_id: &str, details: serde_json::Value) -> Self {
        let mut entry = Self::new(slot, action, LogPhase::Request, flow_id);
        entry.details = Some(details);
        entry
    }

    pub fn response(
        slot: usize,
        action: &str,
        flow_id: &str,
        duration_ms: u64,
        details: serde_json::Value,
    ) -> Self {
        let mut entry = Self::new(slot, action, LogPhase::Response, flow_id);
        entry.duration_ms = Some(duration_ms);
        entry.details = Some(details);
        entry
    }

    pub fn error(
        slot: usize,
        action: &str,
        flow_id: &str,
        duration_ms: u64,
        message: &str,
    ) -> Self {
        let mut entry = Self::new(slot, action, LogPhase::Error, flow_id);
        entry.duration_ms = Some(duration_ms);
        entry.details = Some(serde_json::json!({ "error": message }));
        entry
    }

    pub fn event(slot: usize, action: &str, details: serde_json::Value) -> Self {
        let mut entry = Self::new(slot, action, LogPhase::Event, "-");
        entry.details = Some(details);
        entry
    }
}

/// Sink the core writes wire-log lines to. Append must never fail the
/// caller; implementations swallow and report their own I/O errors.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: LogEntry);
}

/// Discards everything. Used when per-slot logging is disabled end to end.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn append(&self, _entry: LogEntry) {}
}

/// Writes one `YYYY-MM-DD.jsonl` file per day under `dir`.
pub struct FileLogger {
    dir: PathBuf,
}

impl FileLogger {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    async fn write_line(&self, entry: &LogEntry) -> Result<(), String> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| format!("create log dir: {e}"))?;

        let date = Local::now().format("%Y-%m-%d").to_string();
        let path = self.dir.join(format!("{date}.jsonl"));

        let mut line =
            serde_json::to_string(entry).map_err(|e| format!("serialize log entry: {e}"))?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| format!("open log file: {e}"))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| format!("write log entry: {e}"))?;

        Ok(())
    }

    /// Deletes daily files older than the retention window.
    pub async fn prune(&self, max_days: u32) {
        let cutoff = Local::now().date_naive() - chrono::Duration::days(i64::from(max_days));

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".jsonl") else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else {
                continue;
            };
            if date < cutoff {
                if let Err(err) = fs::remove_file(entry.path()).await {
                    warn!("failed to prune log file {name}: {err}");
                }
            }
        }
    }
}

#[async_trait]
impl LogSink for FileLogger {
    async fn append(&self, entry: LogEntry) {
        if let Err(err) = self.write_line(&entry).await {
            warn!("wire log append failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_writes_one_jsonl_line_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = FileLogger::new(tmp.path().to_path_buf());

        logger
            .append(LogEntry::request(
                1,
                "fetch_quota",
                "abc",
                serde_json::json!({"url": "https://example"}),
            ))
            .await;
        logger
            .append(LogEntry::response(
                1,
                "fetch_quota",
                "abc",
                12,
                serde_json::json!({"status": 200}),
            ))
            .await;

        let date = Local::now().format("%Y-%m-%d").to_string();
        let content = std::fs::read_to_string(tmp.path().join(format!("{date}.jsonl"))).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["phase"], "request");
        assert_eq!(first["flow_id"], "abc");
        assert!(first.get("duration_ms").is_none());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["phase"], "response");
        assert_eq!(second["flow_id"], "abc");
        assert_eq!(second["duration_ms"], 12);
    }

    #[tokio::test]
    async fn prune_removes_files_past_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let logger = FileLogger::new(tmp.path().to_path_buf());

        let old = tmp.path().join("2001-01-01.jsonl");
        std::fs::write(&old, "{}\n").unwrap();
        let today = Local::now().format("%Y-%m-%d").to_string();
        let current = tmp.path().join(format!("{today}.jsonl"));
        std::fs::write(&current, "{}\n").unwrap();
        let unrelated = tmp.path().join("notes.txt");
        std::fs::write(&unrelated, "keep me").unwrap();

        logger.prune(7).await;

        assert!(!old.exists());
        assert!(current.exists());
        assert!(unrelated.exists());
    }
}
