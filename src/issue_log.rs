//! Per-issue log files.
//!
//! Each task appends to `logs/{identifier}.log`. The line format is
//! `[ISO-8601] [LEVEL] message {optional JSON context}`. Agent stdout and
//! stderr land here too, so the file is the first stop when a run goes
//! sideways. Logging failures degrade to debug traces; they never affect
//! the task outcome.

use anyhow::Context;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct IssueLog {
    path: PathBuf,
}

impl IssueLog {
    /// Open (creating directories as needed) the log for an identifier.
    pub fn open(dir: &Path, identifier: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let path = dir.join(format!("{}.log", sanitize(identifier)));
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: &str, context: Option<&Value>) {
        self.append("INFO", message, context);
    }

    pub fn warn(&self, message: &str, context: Option<&Value>) {
        self.append("WARN", message, context);
    }

    pub fn error(&self, message: &str, context: Option<&Value>) {
        self.append("ERROR", message, context);
    }

    /// Append a multi-line block (agent output) under one header line.
    pub fn block(&self, header: &str, content: &str) {
        if content.trim().is_empty() {
            return;
        }
        self.append("INFO", header, None);
        if let Err(e) = self.raw_append(content) {
            tracing::debug!(path = %self.path.display(), ?e, "issue log write failed");
        }
    }

    fn append(&self, level: &str, message: &str, context: Option<&Value>) {
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let line = match context {
            Some(ctx) => format!("[{timestamp}] [{level}] {message} {ctx}\n"),
            None => format!("[{timestamp}] [{level}] {message}\n"),
        };
        if let Err(e) = self.raw_append(&line) {
            tracing::debug!(path = %self.path.display(), ?e, "issue log write failed");
        }
    }

    fn raw_append(&self, content: &str) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut content = content.to_string();
        if !content.ends_with('\n') {
            content.push('\n');
        }
        file.write_all(content.as_bytes())
    }
}

/// Flatten path separators out of identifiers like `acme/widgets#42`.
fn sanitize(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_flattens_separators() {
        assert_eq!(sanitize("acme/widgets#42"), "acme-widgets#42");
        assert_eq!(sanitize("ENG-7"), "ENG-7");
    }

    #[test]
    fn lines_carry_timestamp_and_level() {
        let dir = tempfile::tempdir().unwrap();
        let log = IssueLog::open(dir.path(), "ENG-7").unwrap();
        log.info("task started", Some(&json!({"branch": "ENG-7"})));
        log.error("agent failed", None);

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] task started {\"branch\":\"ENG-7\"}"));
        assert!(lines[1].contains("[ERROR] agent failed"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn block_skips_empty_content() {
        let dir = tempfile::tempdir().unwrap();
        let log = IssueLog::open(dir.path(), "ENG-8").unwrap();
        log.block("agent stdout", "   \n ");
        assert!(!log.path().exists());
    }

    #[test]
    fn block_appends_header_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let log = IssueLog::open(dir.path(), "ENG-9").unwrap();
        log.block("agent stderr", "line one\nline two");
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("agent stderr"));
        assert!(content.ends_with("line one\nline two\n"));
    }
}
