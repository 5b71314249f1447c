//! The unit of work: one admitted issue, one workspace, one agent run.

use crate::providers::ProviderKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a task. Transitions only move forward:
/// `queued → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// A task admitted into the queue.
///
/// `issue_id` is the provider's opaque id (a Linear UUID, a
/// `owner/repo#number` triple for GitHub) and is the dedup key across the
/// pending queue and the running map. `identifier` is the human-facing form
/// shown in responses, comments, and log file names.
///
/// Field names serialize camelCase because tasks are embedded verbatim in
/// the `state.json` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub provider: ProviderKind,
    pub issue_id: String,
    pub identifier: String,
    /// Repository path, relative to the configured repos base.
    pub repo: String,
    /// Absolute workspace path: `{worktrees root}/{branch name}`.
    pub workspace: PathBuf,
    /// Title snapshot taken at admission, used for the commit message.
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task {
            provider: ProviderKind::Linear,
            issue_id: "uuid-1".into(),
            identifier: "ENG-7".into(),
            repo: "my-proj".into(),
            workspace: PathBuf::from("/worktrees/ENG-7"),
            title: "Fix crash".into(),
            status: TaskStatus::Queued,
            started_at: None,
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Running).unwrap(),
            "\"running\""
        );
        let status: TaskStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, TaskStatus::Failed);
    }

    #[test]
    fn task_serializes_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["issueId"], "uuid-1");
        assert_eq!(json["provider"], "linear");
        // started_at is omitted until the task is marked running
        assert!(json.get("startedAt").is_none());
    }

    #[test]
    fn task_round_trips() {
        let mut task = sample();
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.issue_id, task.issue_id);
        assert_eq!(back.status, TaskStatus::Running);
        assert!(back.started_at.is_some());
    }
}
