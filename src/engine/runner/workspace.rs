//! Workspace management — per-task git worktrees and the push/PR tail.
//!
//! Thin semantic wrappers over `git` and the `gh` CLI. Each task gets an
//! isolated worktree under the configured root, rooted on a branch derived
//! from the issue, so concurrent agents never step on each other.

use crate::cmd::CommandErrorContext;
use crate::task::Task;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Create a worktree at `worktree_path` on a fresh branch.
///
/// Idempotent: an existing directory is reused as-is (a crashed or retried
/// run picks up where it left off). When git reports the branch already
/// exists, the worktree is re-created against that branch instead of a new
/// one.
pub async fn create_worktree(
    repo_path: &Path,
    worktree_path: &Path,
    branch: &str,
) -> anyhow::Result<()> {
    if worktree_path.exists() {
        tracing::info!(worktree = %worktree_path.display(), "reusing existing worktree");
        return Ok(());
    }

    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let repo = repo_path.to_string_lossy();
    let target = worktree_path.to_string_lossy();

    let output = Command::new("git")
        .args(["-C", &repo, "worktree", "add", "-b", branch, &target])
        .output_with_context()
        .await?;
    if output.status.success() {
        tracing::info!(branch, worktree = %target, "created worktree");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if stderr.contains("already exists") {
        // The branch survived a previous run; attach to it instead.
        tracing::warn!(branch, "branch already exists, reusing it");
        let retry = Command::new("git")
            .args(["-C", &repo, "worktree", "add", &target, branch])
            .output_with_context()
            .await?;
        if retry.status.success() {
            return Ok(());
        }
        let retry_stderr = String::from_utf8_lossy(&retry.stderr);
        anyhow::bail!(
            "failed to create worktree at {target} on existing branch {branch}: {retry_stderr}"
        );
    }

    anyhow::bail!("failed to create worktree at {target}: {stderr}")
}

/// True iff the working tree has modified, staged, or untracked entries.
pub async fn has_changes(dir: &Path) -> bool {
    let diff = Command::new("git")
        .args(["diff", "--quiet"])
        .current_dir(dir)
        .status()
        .await;

    let cached = Command::new("git")
        .args(["diff", "--cached", "--quiet"])
        .current_dir(dir)
        .status()
        .await;

    let untracked = Command::new("git")
        .args(["ls-files", "--others", "--exclude-standard"])
        .current_dir(dir)
        .output()
        .await;

    let has_diff = diff.map(|s| !s.success()).unwrap_or(false);
    let has_cached = cached.map(|s| !s.success()).unwrap_or(false);
    let has_untracked = untracked
        .map(|o| !String::from_utf8_lossy(&o.stdout).trim().is_empty())
        .unwrap_or(false);

    has_diff || has_cached || has_untracked
}

/// Stage everything and create a single commit. "Nothing to commit" counts
/// as success.
pub async fn commit_all(dir: &Path, message: &str) -> anyhow::Result<()> {
    let add = Command::new("git")
        .args(["add", "-A"])
        .current_dir(dir)
        .output_with_context()
        .await?;
    if !add.status.success() {
        let stderr = String::from_utf8_lossy(&add.stderr);
        anyhow::bail!("git add failed: {stderr}");
    }

    let commit = Command::new("git")
        .args(["commit", "-m", message])
        .current_dir(dir)
        .output_with_context()
        .await?;
    if !commit.status.success() {
        let stdout = String::from_utf8_lossy(&commit.stdout);
        if stdout.contains("nothing to commit") {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&commit.stderr);
        anyhow::bail!("git commit failed: {stderr}{stdout}");
    }
    Ok(())
}

/// Push the branch with upstream tracking. Any failure surfaces.
pub async fn push_branch(dir: &Path, branch: &str) -> anyhow::Result<()> {
    let output = Command::new("git")
        .args(["push", "-u", "origin", branch])
        .current_dir(dir)
        .output_with_context()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git push failed: {stderr}");
    }
    tracing::info!(branch, "pushed branch");
    Ok(())
}

/// Open a pull request via the `gh` CLI. Best-effort: on failure the stderr
/// is logged and `None` returned.
pub async fn create_pull_request(
    dir: &Path,
    title: &str,
    body: &str,
    base: &str,
) -> Option<String> {
    let output = Command::new("gh")
        .args(["pr", "create", "--title", title, "--body", body, "--base", base])
        .current_dir(dir)
        .output_with_context()
        .await;

    match output {
        Ok(o) if o.status.success() => {
            let url = String::from_utf8_lossy(&o.stdout).trim().to_string();
            tracing::info!(pr_url = %url, "created pull request");
            Some(url)
        }
        Ok(o) => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            tracing::warn!(err = %stderr, "failed to create pull request");
            None
        }
        Err(e) => {
            tracing::warn!(?e, "failed to create pull request");
            None
        }
    }
}

/// Directories under the worktrees root not owned by any running task.
pub fn find_orphans(worktrees_root: &Path, running: &[Task]) -> Vec<PathBuf> {
    let owned: Vec<&Path> = running.iter().map(|t| t.workspace.as_path()).collect();
    let entries = match std::fs::read_dir(worktrees_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(root = %worktrees_root.display(), ?e, "cannot list worktrees root");
            return Vec::new();
        }
    };

    entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.path())
        .filter(|path| !owned.contains(&path.as_path()))
        .collect()
}

/// Reclaim worktrees no task owns. With `auto_clean` off the orphans are
/// only reported. Removal goes through `git worktree remove` first so git's
/// bookkeeping stays consistent, then falls back to plain directory removal.
pub async fn cleanup_orphans(worktrees_root: &Path, running: &[Task], auto_clean: bool) {
    let orphans = find_orphans(worktrees_root, running);
    if orphans.is_empty() {
        return;
    }

    if !auto_clean {
        for orphan in &orphans {
            tracing::warn!(orphan = %orphan.display(), "orphan worktree found (auto-clean disabled)");
        }
        return;
    }

    for orphan in &orphans {
        tracing::warn!(orphan = %orphan.display(), "removing orphan worktree");
        let target = orphan.to_string_lossy().to_string();
        let removed = Command::new("git")
            .args(["worktree", "remove", "--force", &target])
            .current_dir(orphan)
            .output_with_context()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        if !removed {
            if let Err(e) = std::fs::remove_dir_all(orphan) {
                tracing::warn!(orphan = %orphan.display(), ?e, "failed to remove orphan worktree");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;
    use crate::task::TaskStatus;

    fn running_task(workspace: PathBuf) -> Task {
        Task {
            provider: ProviderKind::Linear,
            issue_id: "uuid-1".into(),
            identifier: "ENG-7".into(),
            repo: "my-proj".into(),
            workspace,
            title: "T".into(),
            status: TaskStatus::Running,
            started_at: Some(chrono::Utc::now()),
        }
    }

    #[test]
    fn find_orphans_excludes_running_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let owned = root.path().join("ENG-7");
        let orphan = root.path().join("ENG-8");
        std::fs::create_dir(&owned).unwrap();
        std::fs::create_dir(&orphan).unwrap();

        let orphans = find_orphans(root.path(), &[running_task(owned)]);
        assert_eq!(orphans, vec![orphan]);
    }

    #[test]
    fn find_orphans_ignores_plain_files() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("stray.txt"), "x").unwrap();
        assert!(find_orphans(root.path(), &[]).is_empty());
    }

    #[test]
    fn find_orphans_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        assert!(find_orphans(&missing, &[]).is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_orphans_when_enabled() {
        let root = tempfile::tempdir().unwrap();
        let orphan = root.path().join("ENG-9");
        std::fs::create_dir(&orphan).unwrap();

        // Not a git worktree, so removal exercises the fallback path.
        cleanup_orphans(root.path(), &[], true).await;
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn cleanup_only_reports_when_disabled() {
        let root = tempfile::tempdir().unwrap();
        let orphan = root.path().join("ENG-10");
        std::fs::create_dir(&orphan).unwrap();

        cleanup_orphans(root.path(), &[], false).await;
        assert!(orphan.exists());
    }

    #[tokio::test]
    async fn create_worktree_reuses_existing_directory() {
        let repo = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();
        // The directory exists, so no git invocation happens at all.
        create_worktree(repo.path(), worktree.path(), "ENG-7")
            .await
            .unwrap();
    }
}
