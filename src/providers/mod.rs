//! Issue-tracker abstraction — one trait, two adapters.
//!
//! The core never sees provider specifics beyond the [`ProviderKind`] tag
//! stored on the task. Signature formats, identifier shapes, status
//! representations, repository discovery, and branch naming all live behind
//! [`IssueProvider`].

pub mod github;
pub mod linear;

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

/// Which tracker a task or webhook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Linear,
    Github,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Github => "github",
        }
    }

    /// Parse a provider name from a URL path segment or query param.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "linear" => Some(Self::Linear),
            "github" => Some(Self::Github),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A label as seen by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

/// A comment on an issue, in creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: String,
    pub body: String,
    /// RFC 3339 creation timestamp as reported by the provider.
    pub created_at: String,
    pub author: Option<String>,
}

/// The parent issue, when the tracker models hierarchies. No comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentIssue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
}

/// Provider-independent view of an issue.
///
/// `id` is opaque and stable; `identifier` is the human-facing form
/// (`ENG-123`, `owner/repo#42`). `metadata` is a per-provider bag the
/// adapter fills at fetch time and reads back in `repository`/`branch_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    pub labels: Vec<Label>,
    pub comments: Vec<IssueComment>,
    pub parent: Option<ParentIssue>,
    /// Repository hint, when the provider carries one directly.
    pub repository: Option<String>,
    pub metadata: Value,
}

/// The two logical phases the core ever moves an issue into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InProgress,
    Review,
}

/// A verified webhook delivery: the provider's event name (from headers,
/// when the provider sends one) plus the parsed JSON payload.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub name: Option<String>,
    pub payload: Value,
}

/// Outcome of the provider-specific trigger filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The event should admit a task for this issue.
    Admit {
        issue_id: String,
        /// The matched trigger-label name, for logging.
        label: String,
    },
    Ignore,
}

/// Why a webhook signature was rejected. All variants map to 401.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature header malformed")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// Uniform tracker contract used by ingress and the agent runner.
#[async_trait::async_trait]
pub trait IssueProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Fetch the current issue state. `Ok(None)` means not found upstream.
    async fn get_issue(&self, id: &str) -> anyhow::Result<Option<Issue>>;

    /// Move the issue into the given logical phase.
    async fn update_status(&self, id: &str, phase: Phase) -> anyhow::Result<()>;

    /// Post a markdown comment. Duplicates are tolerated by the tracker.
    async fn add_comment(&self, id: &str, body: &str) -> anyhow::Result<()>;

    /// Extract the repository path. `None` is a configuration error the
    /// caller surfaces at admission time.
    fn repository(&self, issue: &Issue) -> Option<String>;

    /// Stable, file-system-safe name used for both the branch and the
    /// workspace directory.
    fn branch_name(&self, issue: &Issue) -> String;

    /// Verify the webhook signature over the raw body. Constant time.
    fn verify_webhook(&self, body: &[u8], headers: &HeaderMap) -> Result<(), SignatureError>;

    /// Decide whether a verified event should admit a task.
    async fn should_trigger(&self, event: &WebhookEvent) -> anyhow::Result<Trigger>;

    /// Boot-time credential probe. Failures are logged, not fatal.
    async fn health_check(&self) -> anyhow::Result<()>;
}

/// The configured providers, keyed by kind.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn IssueProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn IssueProvider>) {
        self.providers.push(provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn IssueProvider>> {
        self.providers.iter().find(|p| p.kind() == kind).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn IssueProvider>> {
        self.providers.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.kind().as_str()).collect()
    }
}

/// Constant-time HMAC-SHA256 check of a hex digest against a raw body.
///
/// `Mac::verify_slice` performs the timing-safe comparison; a digest that
/// does not decode to bytes is a format error, not a mismatch.
pub fn verify_hmac_sha256(
    body: &[u8],
    secret: &str,
    digest_hex: &str,
) -> Result<(), SignatureError> {
    let expected = hex::decode(digest_hex.trim()).map_err(|_| SignatureError::Malformed)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::Malformed)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
pub(crate) fn hmac_hex(body: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_known_names() {
        assert_eq!(ProviderKind::parse("linear"), Some(ProviderKind::Linear));
        assert_eq!(ProviderKind::parse("github"), Some(ProviderKind::Github));
        assert_eq!(ProviderKind::parse("jira"), None);
    }

    #[test]
    fn provider_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ProviderKind::Github).unwrap(),
            "\"github\""
        );
    }

    #[test]
    fn hmac_accepts_valid_digest() {
        let body = br#"{"action":"update"}"#;
        let digest = hmac_hex(body, "s3cret");
        assert_eq!(verify_hmac_sha256(body, "s3cret", &digest), Ok(()));
    }

    #[test]
    fn hmac_rejects_wrong_secret() {
        let body = b"payload";
        let digest = hmac_hex(body, "right");
        assert_eq!(
            verify_hmac_sha256(body, "wrong", &digest),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn hmac_rejects_tampered_body() {
        let digest = hmac_hex(b"original", "s");
        assert_eq!(
            verify_hmac_sha256(b"tampered", "s", &digest),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn hmac_rejects_non_hex_digest() {
        assert_eq!(
            verify_hmac_sha256(b"body", "s", "not-hex!"),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn hmac_rejects_truncated_digest() {
        let digest = hmac_hex(b"body", "s");
        assert_eq!(
            verify_hmac_sha256(b"body", "s", &digest[..32]),
            Err(SignatureError::Mismatch)
        );
    }
}
