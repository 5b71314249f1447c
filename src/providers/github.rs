//! GitHub adapter — REST v3 over a shared `reqwest` client.
//!
//! The opaque issue id is `owner/repo#number`, which doubles as the human
//! identifier and keeps ids unique across repositories sharing one service.
//! Status lives in the label set: the two reserved phase labels are
//! rewritten wholesale on every transition.

use super::{
    verify_hmac_sha256, Issue, IssueComment, IssueProvider, Label, Phase, ProviderKind,
    SignatureError, Trigger, WebhookEvent,
};
use crate::config::GithubConfig;
use anyhow::Context;
use axum::http::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const GITHUB_API: &str = "https://api.github.com";

pub struct GithubProvider {
    client: Client,
    cfg: GithubConfig,
    include_comments: bool,
}

/// `owner/repo#number`, the id shape this adapter mints and accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl IssueRef {
    /// Parse `owner/repo#number`. Returns `None` on any malformation.
    pub fn parse(id: &str) -> Option<Self> {
        let (full_name, number) = id.split_once('#')?;
        let (owner, repo) = full_name.split_once('/')?;
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number: number.parse().ok()?,
        })
    }

    pub fn identifier(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.number)
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

// ── REST response shapes ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    body: Option<String>,
    labels: Vec<GhLabel>,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    id: Option<u64>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhComment {
    id: u64,
    body: Option<String>,
    user: Option<GhUser>,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

impl GithubProvider {
    pub fn new(cfg: GithubConfig, include_comments: bool) -> Self {
        let client = Client::builder()
            .user_agent("issuepilot/0.1 (reqwest)")
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            cfg,
            include_comments,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{GITHUB_API}{path}"))
            .header("Authorization", format!("Bearer {}", self.cfg.token))
            .header("Accept", "application/vnd.github+json")
    }

    async fn check(resp: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("github api {what} failed ({status}): {body}");
    }

    async fn fetch_issue(&self, issue: &IssueRef) -> anyhow::Result<Option<GhIssue>> {
        let path = format!(
            "/repos/{}/{}/issues/{}",
            issue.owner, issue.repo, issue.number
        );
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .context("github api request failed")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check(resp, "get issue").await?;
        Ok(Some(resp.json().await.context("unexpected issue shape")?))
    }

    async fn fetch_comments(&self, issue: &IssueRef) -> anyhow::Result<Vec<GhComment>> {
        let path = format!(
            "/repos/{}/{}/issues/{}/comments?per_page=100",
            issue.owner, issue.repo, issue.number
        );
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .context("github api request failed")?;
        let resp = Self::check(resp, "list comments").await?;
        resp.json().await.context("unexpected comments shape")
    }
}

/// Compute the full label set after a phase transition: both reserved phase
/// labels are dropped, the requested one appended.
fn rewrite_phase_labels(
    current: &[String],
    in_progress: &str,
    review: &str,
    target: &str,
) -> Vec<String> {
    let mut labels: Vec<String> = current
        .iter()
        .filter(|name| {
            !name.eq_ignore_ascii_case(in_progress) && !name.eq_ignore_ascii_case(review)
        })
        .cloned()
        .collect();
    labels.push(target.to_string());
    labels
}

#[async_trait::async_trait]
impl IssueProvider for GithubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    async fn get_issue(&self, id: &str) -> anyhow::Result<Option<Issue>> {
        // An id that doesn't parse can't exist upstream either.
        let Some(issue_ref) = IssueRef::parse(id) else {
            return Ok(None);
        };
        let Some(raw) = self.fetch_issue(&issue_ref).await? else {
            return Ok(None);
        };

        let comments = if self.include_comments {
            self.fetch_comments(&issue_ref)
                .await?
                .into_iter()
                .map(|c| IssueComment {
                    id: c.id.to_string(),
                    body: c.body.unwrap_or_default(),
                    created_at: c.created_at,
                    author: c.user.map(|u| u.login),
                })
                .collect()
        } else {
            Vec::new()
        };

        let metadata = json!({
            "owner": issue_ref.owner,
            "repo": issue_ref.repo,
            "number": raw.number,
            "url": raw.html_url,
        });

        Ok(Some(Issue {
            id: issue_ref.identifier(),
            identifier: issue_ref.identifier(),
            title: raw.title,
            description: raw.body,
            labels: raw
                .labels
                .into_iter()
                .map(|l| Label {
                    id: l.id.map(|id| id.to_string()).unwrap_or_default(),
                    name: l.name,
                })
                .collect(),
            comments,
            parent: None,
            repository: Some(issue_ref.full_name()),
            metadata,
        }))
    }

    async fn update_status(&self, id: &str, phase: Phase) -> anyhow::Result<()> {
        let issue_ref = IssueRef::parse(id)
            .with_context(|| format!("invalid github issue id: {id}"))?;
        let raw = self
            .fetch_issue(&issue_ref)
            .await?
            .with_context(|| format!("issue {id} disappeared upstream"))?;

        let target = match phase {
            Phase::InProgress => &self.cfg.in_progress_label,
            Phase::Review => &self.cfg.review_label,
        };
        let current: Vec<String> = raw.labels.into_iter().map(|l| l.name).collect();
        let labels = rewrite_phase_labels(
            &current,
            &self.cfg.in_progress_label,
            &self.cfg.review_label,
            target,
        );

        // The PUT replaces the full set atomically; the GET→PUT window is
        // acceptable for a single-writer orchestrator.
        let path = format!(
            "/repos/{}/{}/issues/{}/labels",
            issue_ref.owner, issue_ref.repo, issue_ref.number
        );
        let resp = self
            .request(reqwest::Method::PUT, &path)
            .json(&json!({ "labels": labels }))
            .send()
            .await
            .context("github api request failed")?;
        Self::check(resp, "replace labels").await?;
        Ok(())
    }

    async fn add_comment(&self, id: &str, body: &str) -> anyhow::Result<()> {
        let issue_ref = IssueRef::parse(id)
            .with_context(|| format!("invalid github issue id: {id}"))?;
        let path = format!(
            "/repos/{}/{}/issues/{}/comments",
            issue_ref.owner, issue_ref.repo, issue_ref.number
        );
        let resp = self
            .request(reqwest::Method::POST, &path)
            .json(&json!({ "body": body }))
            .send()
            .await
            .context("github api request failed")?;
        Self::check(resp, "add comment").await?;
        Ok(())
    }

    fn repository(&self, issue: &Issue) -> Option<String> {
        issue.repository.clone()
    }

    fn branch_name(&self, issue: &Issue) -> String {
        // `owner-repo-number` avoids collisions between repositories that
        // share a worktrees root.
        match IssueRef::parse(&issue.id) {
            Some(r) => format!("{}-{}-{}", r.owner, r.repo, r.number),
            None => issue.id.replace(['/', '#'], "-"),
        }
    }

    fn verify_webhook(&self, body: &[u8], headers: &HeaderMap) -> Result<(), SignatureError> {
        let header = headers
            .get("x-hub-signature-256")
            .ok_or(SignatureError::Missing)?
            .to_str()
            .map_err(|_| SignatureError::Malformed)?;
        let digest = header
            .strip_prefix("sha256=")
            .ok_or(SignatureError::Malformed)?;
        verify_hmac_sha256(body, &self.cfg.webhook_secret, digest)
    }

    async fn should_trigger(&self, event: &WebhookEvent) -> anyhow::Result<Trigger> {
        if event.name.as_deref() != Some("issues") {
            return Ok(Trigger::Ignore);
        }
        let payload = &event.payload;
        if payload.get("action").and_then(Value::as_str) != Some("labeled") {
            return Ok(Trigger::Ignore);
        }
        let Some(label) = payload.pointer("/label/name").and_then(Value::as_str) else {
            return Ok(Trigger::Ignore);
        };
        if label.to_lowercase() != self.cfg.trigger_label.to_lowercase() {
            return Ok(Trigger::Ignore);
        }

        let full_name = payload
            .pointer("/repository/full_name")
            .and_then(Value::as_str)
            .context("labeled event has no repository.full_name")?;
        let number = payload
            .pointer("/issue/number")
            .and_then(Value::as_u64)
            .context("labeled event has no issue.number")?;

        Ok(Trigger::Admit {
            issue_id: format!("{full_name}#{number}"),
            label: label.to_string(),
        })
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let resp = self
            .request(reqwest::Method::GET, "/user")
            .send()
            .await
            .context("github api request failed")?;
        Self::check(resp, "auth probe").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GithubConfig;

    fn provider() -> GithubProvider {
        GithubProvider::new(
            GithubConfig {
                token: "ghp_test".into(),
                webhook_secret: "s".into(),
                trigger_label: "ai-attempt".into(),
                in_progress_label: "in-progress".into(),
                review_label: "review".into(),
            },
            true,
        )
    }

    fn labeled_event(label: &str) -> WebhookEvent {
        WebhookEvent {
            name: Some("issues".into()),
            payload: json!({
                "action": "labeled",
                "label": { "name": label },
                "issue": { "number": 42, "title": "T", "body": null, "labels": [] },
                "repository": {
                    "full_name": "acme/widgets",
                    "owner": { "login": "acme" },
                    "name": "widgets",
                },
            }),
        }
    }

    #[test]
    fn issue_ref_parses_well_formed_ids() {
        let r = IssueRef::parse("acme/widgets#42").unwrap();
        assert_eq!(r.owner, "acme");
        assert_eq!(r.repo, "widgets");
        assert_eq!(r.number, 42);
        assert_eq!(r.identifier(), "acme/widgets#42");
    }

    #[test]
    fn issue_ref_rejects_malformed_ids() {
        assert!(IssueRef::parse("acme/widgets").is_none());
        assert!(IssueRef::parse("widgets#42").is_none());
        assert!(IssueRef::parse("acme/widgets#notanumber").is_none());
        assert!(IssueRef::parse("/x#1").is_none());
    }

    #[test]
    fn branch_name_prevents_cross_repo_collisions() {
        let p = provider();
        let issue = Issue {
            id: "acme/widgets#42".into(),
            identifier: "acme/widgets#42".into(),
            title: "T".into(),
            description: None,
            labels: vec![],
            comments: vec![],
            parent: None,
            repository: Some("acme/widgets".into()),
            metadata: json!({}),
        };
        assert_eq!(p.branch_name(&issue), "acme-widgets-42");
    }

    #[test]
    fn rewrite_phase_labels_swaps_reserved_labels() {
        let current = vec![
            "bug".to_string(),
            "in-progress".to_string(),
            "priority".to_string(),
        ];
        let labels = rewrite_phase_labels(&current, "in-progress", "review", "review");
        assert_eq!(labels, vec!["bug", "priority", "review"]);
    }

    #[test]
    fn rewrite_phase_labels_is_idempotent() {
        let once = rewrite_phase_labels(&["review".to_string()], "in-progress", "review", "review");
        let twice = rewrite_phase_labels(&once, "in-progress", "review", "review");
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn should_trigger_admits_matching_label() {
        let p = provider();
        let trigger = p.should_trigger(&labeled_event("ai-attempt")).await.unwrap();
        assert_eq!(
            trigger,
            Trigger::Admit {
                issue_id: "acme/widgets#42".into(),
                label: "ai-attempt".into(),
            }
        );
    }

    #[tokio::test]
    async fn should_trigger_matches_case_insensitively() {
        let p = provider();
        let trigger = p.should_trigger(&labeled_event("AI-Attempt")).await.unwrap();
        assert!(matches!(trigger, Trigger::Admit { .. }));
    }

    #[tokio::test]
    async fn should_trigger_ignores_other_labels() {
        let p = provider();
        let trigger = p.should_trigger(&labeled_event("bug")).await.unwrap();
        assert_eq!(trigger, Trigger::Ignore);
    }

    #[tokio::test]
    async fn should_trigger_ignores_other_events() {
        let p = provider();
        let mut event = labeled_event("ai-attempt");
        event.name = Some("issue_comment".into());
        assert_eq!(p.should_trigger(&event).await.unwrap(), Trigger::Ignore);

        let mut event = labeled_event("ai-attempt");
        event.payload["action"] = json!("unlabeled");
        assert_eq!(p.should_trigger(&event).await.unwrap(), Trigger::Ignore);
    }

    #[test]
    fn verify_webhook_requires_sha256_prefix() {
        let p = provider();
        let body = b"{}";
        let digest = super::super::hmac_hex(body, "s");

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            format!("sha256={digest}").parse().unwrap(),
        );
        assert_eq!(p.verify_webhook(body, &headers), Ok(()));

        let mut bare = HeaderMap::new();
        bare.insert("x-hub-signature-256", digest.parse().unwrap());
        assert_eq!(
            p.verify_webhook(body, &bare),
            Err(SignatureError::Malformed)
        );
    }
}
