//! Running-set snapshot persistence — the only persisted datum.
//!
//! Writes are atomic: serialize to `state.json.tmp`, then rename over
//! `state.json`. Reads tolerate a missing file (fresh start) and a corrupt
//! one (logged, treated as empty). A failed write is logged by the caller
//! and never aborts execution.

use crate::task::Task;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// On-disk layout of `state.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub running_agents: Vec<Task>,
    pub saved_at: DateTime<Utc>,
}

pub struct StateStore {
    path: PathBuf,
    /// Serializes writers; the rename itself is atomic but interleaved
    /// tmp-file writes would not be.
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically persist the running set.
    pub fn save(&self, running: Vec<Task>) -> anyhow::Result<()> {
        let snapshot = Snapshot {
            running_agents: running,
            saved_at: Utc::now(),
        };
        let content =
            serde_json::to_string_pretty(&snapshot).context("serializing state snapshot")?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, content)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }

    /// Load the persisted running set. Absent or unreadable state is empty.
    pub fn load(&self) -> Vec<Task> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), ?e, "failed to read state file");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Snapshot>(&content) {
            Ok(snapshot) => snapshot.running_agents,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    ?e,
                    "state file is corrupt, starting with an empty running set"
                );
                Vec::new()
            }
        }
    }
}

/// Sibling temp path: `state.json` → `state.json.tmp`.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;
    use crate::task::TaskStatus;

    fn task(id: &str) -> Task {
        Task {
            provider: ProviderKind::Github,
            issue_id: format!("acme/widgets#{id}"),
            identifier: format!("acme/widgets#{id}"),
            repo: "acme/widgets".into(),
            workspace: PathBuf::from(format!("/worktrees/acme-widgets-{id}")),
            title: "T".into(),
            status: TaskStatus::Running,
            started_at: Some(Utc::now()),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(vec![task("1"), task("2")]).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].issue_id, "acme/widgets#1");
        assert_eq!(loaded[0].status, TaskStatus::Running);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(vec![task("1")]).unwrap();
        assert!(dir.path().join("state.json").exists());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn save_uses_documented_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(vec![task("1")]).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("runningAgents").is_some());
        assert!(value.get("savedAt").is_some());
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = StateStore::new(path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn overwrite_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(vec![task("1")]).unwrap();
        store.save(vec![]).unwrap();
        assert!(store.load().is_empty());
    }
}
