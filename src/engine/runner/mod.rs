//! Agent runner — per-task orchestration.
//!
//! One worker drives one task end to end: fetch the issue, set up the
//! workspace, launch the coding agent under a hard timeout, then turn the
//! outcome into commits, a push, a pull request, and tracker updates.
//!
//! Failure discipline follows a single rule: everything up to and including
//! the push decides the task outcome; everything after the push (and the
//! status/comment writes around the run) is observability and only logs.

pub mod prompt;
pub mod workspace;

use crate::cmd::CommandErrorContext;
use crate::config::Config;
use crate::issue_log::IssueLog;
use crate::providers::{Issue, IssueProvider, Phase, ProviderRegistry};
use crate::redact::redact;
use crate::task::Task;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;

/// Task-fatal failures, classified for comments and logs.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("workspace setup failed: {0}")]
    Workspace(String),
    #[error("agent timed out after {0} minutes")]
    Timeout(u64),
    #[error("agent exited with code {code}: {detail}")]
    AgentFailed { code: i32, detail: String },
    #[error("commit/push failed: {0}")]
    Push(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub has_changes: bool,
    pub pr_url: Option<String>,
}

pub struct AgentRunner {
    config: Arc<Config>,
    providers: Arc<ProviderRegistry>,
}

impl AgentRunner {
    pub fn new(config: Arc<Config>, providers: Arc<ProviderRegistry>) -> Self {
        Self { config, providers }
    }

    /// Run one task to completion. On failure the tracker gets a failure
    /// comment (best-effort) and the error propagates to the processor.
    pub async fn run(&self, task: &Task) -> Result<RunOutcome, TaskError> {
        let provider = self
            .providers
            .get(task.provider)
            .ok_or_else(|| anyhow::anyhow!("provider {} not configured", task.provider))?;

        let log = IssueLog::open(&self.config.logs_dir, &task.identifier)
            .map_err(TaskError::Other)?;

        match self.execute(task, &provider, &log).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                // The workspace path is `{root}/{branch}` by construction.
                let branch = task
                    .workspace
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                log.error("task failed", Some(&json!({ "error": error.to_string() })));
                let comment = redact(&format!(
                    "⚠️ Agent run failed on branch `{branch}`: {error}"
                ));
                if let Err(e) = provider.add_comment(&task.issue_id, &comment).await {
                    tracing::warn!(issue = %task.identifier, ?e, "failed to post failure comment");
                }
                Err(error)
            }
        }
    }

    async fn execute(
        &self,
        task: &Task,
        provider: &Arc<dyn IssueProvider>,
        log: &IssueLog,
    ) -> Result<RunOutcome, TaskError> {
        // 1. Fetch the issue fresh; the admission-time snapshot may be stale.
        let issue = provider
            .get_issue(&task.issue_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("issue {} no longer exists upstream", task.identifier))?;

        // 2. Resolve paths and the per-issue branch.
        let repo_path = self.config.repos_base.join(&task.repo);
        let branch = provider.branch_name(&issue);

        log.info(
            "task started",
            Some(&json!({
                "repo": task.repo,
                "branch": branch,
                "workspace": task.workspace.display().to_string(),
            })),
        );

        // 3. Workspace creation is fatal on failure.
        workspace::create_worktree(&repo_path, &task.workspace, &branch)
            .await
            .map_err(|e| TaskError::Workspace(e.to_string()))?;

        // 4–5. Status + starting comment are best-effort.
        if let Err(e) = provider.update_status(&task.issue_id, Phase::InProgress).await {
            tracing::warn!(issue = %task.identifier, ?e, "failed to set in-progress status");
            log.warn("status update failed", Some(&json!({ "error": e.to_string() })));
        }
        let start_comment = format!(
            "🤖 Started working on this issue.\n\nBranch: `{branch}`\nLog: `{}`",
            log.path().display()
        );
        if let Err(e) = provider.add_comment(&task.issue_id, &start_comment).await {
            tracing::warn!(issue = %task.identifier, ?e, "failed to post start comment");
        }

        // 6–8. Run the agent under the wall-clock budget.
        let prompt = prompt::build_prompt(&issue, &task.repo, &branch);
        self.run_agent(task, &prompt, log).await?;

        // 9. Finalize.
        if !workspace::has_changes(&task.workspace).await {
            tracing::info!(issue = %task.identifier, "agent made no code changes");
            log.info("agent finished with no code changes", None);
            let comment = format!(
                "✅ Agent finished without making code changes on branch `{branch}`. \
                 The issue may need clarification or may already be resolved."
            );
            self.finalize(task, provider, &comment).await;
            return Ok(RunOutcome {
                has_changes: false,
                pr_url: None,
            });
        }

        workspace::commit_all(&task.workspace, &format!("feat: {}", task.title))
            .await
            .map_err(|e| TaskError::Push(e.to_string()))?;
        workspace::push_branch(&task.workspace, &branch)
            .await
            .map_err(|e| TaskError::Push(e.to_string()))?;

        // The task outcome is committed from here on; PR, comment, and
        // status failures only log.
        let pr_title = format!("{}: {}", task.identifier, task.title);
        let pr_body = pr_body(&issue);
        let pr_url =
            workspace::create_pull_request(&task.workspace, &pr_title, &pr_body, "main").await;

        let comment = match &pr_url {
            Some(url) => format!(
                "✅ Agent finished. Changes pushed to branch `{branch}`.\n\nPull request: {url}"
            ),
            None => format!(
                "✅ Agent finished. Changes pushed to branch `{branch}`. \
                 Pull request creation failed; open one manually from the branch."
            ),
        };
        self.finalize(task, provider, &comment).await;

        log.info(
            "task completed",
            Some(&json!({ "branch": branch, "prUrl": pr_url })),
        );
        Ok(RunOutcome {
            has_changes: true,
            pr_url,
        })
    }

    /// Post the completion comment and move the issue to review.
    /// Both are best-effort.
    async fn finalize(&self, task: &Task, provider: &Arc<dyn IssueProvider>, comment: &str) {
        if let Err(e) = provider.add_comment(&task.issue_id, comment).await {
            tracing::warn!(issue = %task.identifier, ?e, "failed to post completion comment");
        }
        if let Err(e) = provider.update_status(&task.issue_id, Phase::Review).await {
            tracing::warn!(issue = %task.identifier, ?e, "failed to set review status");
        }
    }

    /// Launch the coding agent and wait for it, enforcing the hard timeout.
    async fn run_agent(
        &self,
        task: &Task,
        prompt: &str,
        log: &IssueLog,
    ) -> Result<(), TaskError> {
        let budget = self.config.agent_timeout;
        tracing::info!(
            issue = %task.identifier,
            agent = %self.config.agent_binary,
            timeout_secs = budget.as_secs(),
            "launching agent"
        );

        let mut child = tokio::process::Command::new(&self.config.agent_binary)
            .arg("-p")
            .arg(prompt)
            .current_dir(&task.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn_with_context()?;

        // Drain both pipes concurrently so a chatty agent can't fill one
        // and deadlock against our wait.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let wait = timeout(budget, child.wait()).await;

        let timed_out = wait.is_err();
        if timed_out {
            tracing::error!(issue = %task.identifier, "agent hit the wall-clock budget");
            if let Err(e) = child.start_kill() {
                tracing::warn!(issue = %task.identifier, ?e, "failed to kill agent process");
            }
            let _ = child.wait().await;
        }

        // Readers complete once the pipes close, kill included.
        let stdout = String::from_utf8_lossy(&stdout_reader.await.unwrap_or_default()).to_string();
        let stderr = String::from_utf8_lossy(&stderr_reader.await.unwrap_or_default()).to_string();
        log.block("── agent stdout ──", &stdout);
        log.block("── agent stderr ──", &stderr);

        if timed_out {
            return Err(TaskError::Timeout(budget.as_secs() / 60));
        }

        let status = match wait {
            Ok(result) => result.map_err(|e| anyhow::anyhow!("waiting for agent process: {e}"))?,
            Err(_) => unreachable!("timeout handled above"),
        };
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            let source = if stderr.trim().is_empty() {
                &stdout
            } else {
                &stderr
            };
            return Err(TaskError::AgentFailed {
                code,
                detail: truncate(source.trim(), 2000),
            });
        }

        tracing::info!(issue = %task.identifier, "agent completed");
        Ok(())
    }
}

/// PR body linking back to the source issue.
fn pr_body(issue: &Issue) -> String {
    let link = match issue.metadata.get("url").and_then(|v| v.as_str()) {
        Some(url) => format!("[{}]({url})", issue.identifier),
        None => format!("**{}**", issue.identifier),
    };
    format!(
        "Automated change for {link}: {}.\n\nReview carefully before merging.",
        issue.title
    )
}

/// Head of a string, cut on a char boundary.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
