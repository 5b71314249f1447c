//! Environment configuration.
//!
//! Everything is read once at boot into an immutable [`Config`]. A provider
//! is configured iff both its API credential and its webhook secret are set;
//! startup fails unless at least one provider is fully configured and both
//! base paths are present.

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

/// Linear provider settings.
#[derive(Debug, Clone)]
pub struct LinearConfig {
    pub api_key: String,
    pub webhook_secret: String,
    /// Label whose addition admits an issue into the queue.
    pub trigger_label: String,
    /// Name of the custom field holding the repository path.
    pub repo_field: String,
    /// Workflow state names for the two logical phases.
    pub in_progress_state: String,
    pub review_state: String,
}

/// GitHub provider settings.
#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub token: String,
    pub webhook_secret: String,
    pub trigger_label: String,
    /// Reserved phase labels rewritten by status updates.
    pub in_progress_label: String,
    pub review_label: String,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub linear: Option<LinearConfig>,
    pub github: Option<GithubConfig>,
    /// Base directory containing the shared repositories.
    pub repos_base: PathBuf,
    /// Root under which per-task worktrees are created.
    pub worktrees: PathBuf,
    pub max_concurrent_agents: usize,
    /// Include issue comments when fetching and when building prompts.
    pub include_comments: bool,
    /// Hard wall-clock budget for one agent run.
    pub agent_timeout: Duration,
    pub port: u16,
    /// Remove orphan worktrees at startup instead of just listing them.
    pub auto_clean_orphans: bool,
    /// External coding-agent executable, invoked as `{binary} -p {prompt}`.
    pub agent_binary: String,
    /// Running-set snapshot path (`state.json` in the working directory).
    pub state_file: PathBuf,
    /// Directory for per-issue log files.
    pub logs_dir: PathBuf,
    pub log_level: String,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

/// Parse a boolean env value. Accepts `true/false`, `1/0`, `yes/no`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let linear = match (env_opt("LINEAR_API_KEY"), env_opt("LINEAR_WEBHOOK_SECRET")) {
            (Some(api_key), Some(webhook_secret)) => Some(LinearConfig {
                api_key,
                webhook_secret,
                trigger_label: env_or("LINEAR_TRIGGER_LABEL", "ai-attempt"),
                repo_field: env_or("REPO_CUSTOM_FIELD_NAME", "Repository"),
                in_progress_state: env_or("IN_PROGRESS_STATUS", "In Progress"),
                review_state: env_or("REVIEW_STATUS", "In Review"),
            }),
            _ => None,
        };

        let github = match (env_opt("GITHUB_TOKEN"), env_opt("GITHUB_WEBHOOK_SECRET")) {
            (Some(token), Some(webhook_secret)) => Some(GithubConfig {
                token,
                webhook_secret,
                trigger_label: env_or("GITHUB_TRIGGER_LABEL", "ai-attempt"),
                in_progress_label: env_or("GITHUB_IN_PROGRESS_LABEL", "in-progress"),
                review_label: env_or("GITHUB_REVIEW_LABEL", "review"),
            }),
            _ => None,
        };

        if linear.is_none() && github.is_none() {
            anyhow::bail!(
                "no provider configured — set LINEAR_API_KEY + LINEAR_WEBHOOK_SECRET \
                 and/or GITHUB_TOKEN + GITHUB_WEBHOOK_SECRET"
            );
        }

        let repos_base = PathBuf::from(
            env_opt("REPOS_BASE_PATH").context("REPOS_BASE_PATH is required")?,
        );
        let worktrees = PathBuf::from(
            env_opt("WORKTREES_PATH").context("WORKTREES_PATH is required")?,
        );

        let max_concurrent_agents = env_opt("MAX_CONCURRENT_AGENTS")
            .map(|v| v.parse::<usize>().context("MAX_CONCURRENT_AGENTS must be a number"))
            .transpose()?
            .unwrap_or(1)
            .max(1);

        let include_comments = env_opt("INCLUDE_COMMENTS")
            .map(|v| {
                parse_bool(&v).with_context(|| format!("INCLUDE_COMMENTS is not a boolean: {v}"))
            })
            .transpose()?
            .unwrap_or(true);

        let agent_timeout_ms = env_opt("AGENT_TIMEOUT")
            .map(|v| v.parse::<u64>().context("AGENT_TIMEOUT must be milliseconds"))
            .transpose()?
            .unwrap_or(1_800_000);

        let port = env_opt("PORT")
            .map(|v| v.parse::<u16>().context("PORT must be a port number"))
            .transpose()?
            .unwrap_or(3847);

        let auto_clean_orphans = env_opt("AUTO_CLEAN_ORPHANS")
            .map(|v| {
                parse_bool(&v)
                    .with_context(|| format!("AUTO_CLEAN_ORPHANS is not a boolean: {v}"))
            })
            .transpose()?
            .unwrap_or(false);

        Ok(Self {
            linear,
            github,
            repos_base,
            worktrees,
            max_concurrent_agents,
            include_comments,
            agent_timeout: Duration::from_millis(agent_timeout_ms),
            port,
            auto_clean_orphans,
            agent_binary: env_or("AGENT_BINARY", "claude"),
            state_file: PathBuf::from("state.json"),
            logs_dir: PathBuf::from("logs"),
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }

}
