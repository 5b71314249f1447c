//! In-process task queue: a FIFO of pending tasks plus the running map.
//!
//! Both structures live behind one mutex; every method is short and never
//! holds the lock across I/O. Duplicate admission control is an invariant
//! of `add` — neither the webhook path nor the retry path can regress it.

use crate::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    pending: VecDeque<Task>,
    running: HashMap<String, Task>,
}

/// Queue status summary for the `/status` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub running_tasks: Vec<RunningSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningSummary {
    pub issue: String,
    pub repo: String,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct TaskQueue {
    max_concurrent: usize,
    inner: Mutex<Inner>,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned queue mutex means a panic while holding it; the data
        // is plain bookkeeping, so continue with whatever is there.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a task unless its issue is already queued or running.
    /// Returns whether the task was inserted.
    pub fn add(&self, mut task: Task) -> bool {
        let mut inner = self.lock();
        let duplicate = inner.running.contains_key(&task.issue_id)
            || inner.pending.iter().any(|t| t.issue_id == task.issue_id);
        if duplicate {
            return false;
        }
        task.status = TaskStatus::Queued;
        inner.pending.push_back(task);
        true
    }

    /// Pop the head of the pending queue.
    pub fn next(&self) -> Option<Task> {
        self.lock().pending.pop_front()
    }

    /// Stamp the start time and move the task into the running map.
    pub fn mark_running(&self, task: &mut Task) {
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.lock()
            .running
            .insert(task.issue_id.clone(), task.clone());
    }

    pub fn mark_complete(&self, issue_id: &str) {
        if self.lock().running.remove(issue_id).is_none() {
            tracing::warn!(issue_id, "mark_complete for unknown task");
        }
    }

    pub fn mark_failed(&self, issue_id: &str, error: Option<&str>) {
        if self.lock().running.remove(issue_id).is_none() {
            tracing::warn!(issue_id, "mark_failed for unknown task");
        }
        if let Some(error) = error {
            tracing::warn!(issue_id, error, "task failed");
        }
    }

    pub fn is_queued(&self, issue_id: &str) -> bool {
        self.lock().pending.iter().any(|t| t.issue_id == issue_id)
    }

    pub fn is_running(&self, issue_id: &str) -> bool {
        self.lock().running.contains_key(issue_id)
    }

    /// Number of pending tasks.
    pub fn size(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Whether a new worker may start (running < max).
    pub fn can_start_new(&self) -> bool {
        let inner = self.lock();
        inner.running.len() < self.max_concurrent
    }

    /// Snapshot of the running map, for persistence and status reporting.
    pub fn running_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.lock().running.values().cloned().collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        tasks
    }

    /// Restore entries into the running map as-is. Crash recovery only;
    /// no workers are launched for restored tasks.
    pub fn restore_running(&self, tasks: Vec<Task>) {
        let mut inner = self.lock();
        for task in tasks {
            inner.running.insert(task.issue_id.clone(), task);
        }
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.lock();
        let mut running_tasks: Vec<RunningSummary> = inner
            .running
            .values()
            .map(|t| RunningSummary {
                issue: t.identifier.clone(),
                repo: t.repo.clone(),
                started_at: t.started_at,
            })
            .collect();
        running_tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        QueueStatus {
            queued: inner.pending.len(),
            running: inner.running.len(),
            running_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;
    use std::path::PathBuf;

    fn task(id: &str) -> Task {
        Task {
            provider: ProviderKind::Linear,
            issue_id: id.to_string(),
            identifier: format!("ENG-{id}"),
            repo: "my-proj".into(),
            workspace: PathBuf::from(format!("/worktrees/ENG-{id}")),
            title: "Fix crash".into(),
            status: TaskStatus::Queued,
            started_at: None,
        }
    }

    #[test]
    fn add_preserves_fifo_order() {
        let queue = TaskQueue::new(4);
        for id in ["a", "b", "c"] {
            assert!(queue.add(task(id)));
        }
        assert_eq!(queue.next().unwrap().issue_id, "a");
        assert_eq!(queue.next().unwrap().issue_id, "b");
        assert_eq!(queue.next().unwrap().issue_id, "c");
        assert!(queue.next().is_none());
    }

    #[test]
    fn add_rejects_duplicate_of_queued_issue() {
        let queue = TaskQueue::new(4);
        assert!(queue.add(task("a")));
        assert!(!queue.add(task("a")));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn add_rejects_duplicate_of_running_issue() {
        let queue = TaskQueue::new(4);
        queue.add(task("a"));
        let mut t = queue.next().unwrap();
        queue.mark_running(&mut t);
        assert!(!queue.add(task("a")));
        assert_eq!(queue.size(), 0);
        assert!(queue.is_running("a"));
    }

    #[test]
    fn duplicates_do_not_break_fifo_for_others() {
        let queue = TaskQueue::new(4);
        queue.add(task("a"));
        queue.add(task("b"));
        queue.add(task("a")); // dropped
        queue.add(task("c"));
        let order: Vec<String> = std::iter::from_fn(|| queue.next())
            .map(|t| t.issue_id)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn mark_running_stamps_start_time() {
        let queue = TaskQueue::new(1);
        queue.add(task("a"));
        let mut t = queue.next().unwrap();
        assert!(t.started_at.is_none());
        queue.mark_running(&mut t);
        assert_eq!(t.status, TaskStatus::Running);
        assert!(t.started_at.is_some());
        assert!(queue.running_tasks()[0].started_at.is_some());
    }

    #[test]
    fn capacity_gates_new_workers() {
        let queue = TaskQueue::new(1);
        queue.add(task("a"));
        queue.add(task("b"));
        assert!(queue.can_start_new());
        let mut t = queue.next().unwrap();
        queue.mark_running(&mut t);
        assert!(!queue.can_start_new());
        queue.mark_complete(&t.issue_id);
        assert!(queue.can_start_new());
    }

    #[test]
    fn mark_failed_removes_from_running() {
        let queue = TaskQueue::new(2);
        queue.add(task("a"));
        let mut t = queue.next().unwrap();
        queue.mark_running(&mut t);
        queue.mark_failed("a", Some("agent exploded"));
        assert!(!queue.is_running("a"));
        assert_eq!(queue.running_count(), 0);
    }

    #[test]
    fn restore_running_blocks_duplicate_admits() {
        let queue = TaskQueue::new(2);
        let mut t = task("a");
        t.status = TaskStatus::Running;
        queue.restore_running(vec![t]);
        assert!(queue.is_running("a"));
        assert!(!queue.add(task("a")));
    }

    #[test]
    fn status_reports_counts_and_summaries() {
        let queue = TaskQueue::new(4);
        queue.add(task("a"));
        queue.add(task("b"));
        let mut t = queue.next().unwrap();
        queue.mark_running(&mut t);

        let status = queue.status();
        assert_eq!(status.queued, 1);
        assert_eq!(status.running, 1);
        assert_eq!(status.running_tasks[0].issue, "ENG-a");
        assert_eq!(status.running_tasks[0].repo, "my-proj");
    }
}
