//! Linear adapter — GraphQL over a shared `reqwest` client.
//!
//! All API calls go through one endpoint; auth is the raw API key in the
//! `Authorization` header. `issue(id:)` accepts both the UUID delivered in
//! webhooks and the human identifier (`ENG-123`) used by the retry endpoint,
//! so both admission paths share one fetch.

use super::{
    verify_hmac_sha256, Issue, IssueComment, IssueProvider, Label, ParentIssue, Phase,
    ProviderKind, SignatureError, Trigger, WebhookEvent,
};
use crate::config::LinearConfig;
use anyhow::Context;
use axum::http::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const LINEAR_API: &str = "https://api.linear.app/graphql";

pub struct LinearProvider {
    client: Client,
    cfg: LinearConfig,
    include_comments: bool,
}

// ── GraphQL response shapes ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinearIssue {
    id: String,
    identifier: String,
    title: String,
    description: Option<String>,
    url: Option<String>,
    team: Option<LinearTeam>,
    labels: Option<Nodes<LinearLabel>>,
    parent: Option<LinearParent>,
    comments: Option<Nodes<LinearComment>>,
    custom_field_values: Option<Nodes<LinearCustomFieldValue>>,
}

#[derive(Debug, Deserialize)]
struct LinearTeam {
    id: String,
    #[serde(default)]
    states: Option<Nodes<LinearState>>,
}

#[derive(Debug, Deserialize)]
struct LinearState {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct LinearLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinearParent {
    id: String,
    identifier: String,
    title: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinearComment {
    id: String,
    body: String,
    created_at: String,
    user: Option<LinearUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinearUser {
    display_name: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinearCustomFieldValue {
    custom_field: Option<LinearCustomField>,
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LinearCustomField {
    name: String,
}

impl LinearProvider {
    pub fn new(cfg: LinearConfig, include_comments: bool) -> Self {
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

    /// POST one GraphQL document and return the `data` object.
    async fn graphql(&self, query: &str, variables: Value) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post(LINEAR_API)
            .header("Authorization", &self.cfg.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("linear api request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("linear api returned non-JSON ({status})"))?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let messages: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect();
                anyhow::bail!("linear api errors: {}", messages.join("; "));
            }
        }
        if !status.is_success() {
            anyhow::bail!("linear api returned {status}");
        }

        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    fn issue_query(&self) -> String {
        let comments = if self.include_comments {
            "comments { nodes { id body createdAt user { displayName name } } }"
        } else {
            ""
        };
        format!(
            "query IssueById($id: String!) {{
              issue(id: $id) {{
                id identifier title description url
                team {{ id }}
                labels {{ nodes {{ id name }} }}
                parent {{ id identifier title description }}
                customFieldValues {{ nodes {{ customField {{ name }} value }} }}
                {comments}
              }}
            }}"
        )
    }

    /// Resolve a label id to its display name. `Ok(None)` when the label
    /// no longer exists.
    async fn label_name(&self, label_id: &str) -> anyhow::Result<Option<String>> {
        let data = self
            .graphql(
                "query LabelName($id: String!) { issueLabel(id: $id) { id name } }",
                json!({ "id": label_id }),
            )
            .await?;
        Ok(data
            .pointer("/issueLabel/name")
            .and_then(Value::as_str)
            .map(String::from))
    }

    fn map_issue(&self, raw: LinearIssue) -> Issue {
        let mut custom_fields = serde_json::Map::new();
        if let Some(values) = raw.custom_field_values {
            for entry in values.nodes {
                if let (Some(field), Some(value)) = (entry.custom_field, entry.value) {
                    custom_fields.insert(field.name, value);
                }
            }
        }

        let mut comments: Vec<IssueComment> = raw
            .comments
            .map(|c| c.nodes)
            .unwrap_or_default()
            .into_iter()
            .map(|c| IssueComment {
                id: c.id,
                body: c.body,
                created_at: c.created_at,
                author: c.user.and_then(|u| u.display_name.or(u.name)),
            })
            .collect();
        // RFC 3339 sorts lexicographically; keep creation order ascending.
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let metadata = json!({
            "teamId": raw.team.as_ref().map(|t| t.id.clone()),
            "url": raw.url,
            "customFields": Value::Object(custom_fields),
        });

        Issue {
            id: raw.id,
            identifier: raw.identifier,
            title: raw.title,
            description: raw.description,
            labels: raw
                .labels
                .map(|l| l.nodes)
                .unwrap_or_default()
                .into_iter()
                .map(|l| Label {
                    id: l.id,
                    name: l.name,
                })
                .collect(),
            comments,
            parent: raw.parent.map(|p| ParentIssue {
                id: p.id,
                identifier: p.identifier,
                title: p.title,
                description: p.description,
            }),
            repository: None,
            metadata,
        }
    }
}

#[async_trait::async_trait]
impl IssueProvider for LinearProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Linear
    }

    async fn get_issue(&self, id: &str) -> anyhow::Result<Option<Issue>> {
        let data = self.graphql(&self.issue_query(), json!({ "id": id })).await?;
        let raw = data.get("issue").cloned().unwrap_or(Value::Null);
        if raw.is_null() {
            return Ok(None);
        }
        let issue: LinearIssue =
            serde_json::from_value(raw).context("unexpected linear issue shape")?;
        Ok(Some(self.map_issue(issue)))
    }

    async fn update_status(&self, id: &str, phase: Phase) -> anyhow::Result<()> {
        let wanted = match phase {
            Phase::InProgress => &self.cfg.in_progress_state,
            Phase::Review => &self.cfg.review_state,
        };

        // Workflow states are team-scoped; look them up on the issue's team.
        let data = self
            .graphql(
                "query IssueStates($id: String!) {
                  issue(id: $id) { id team { id states { nodes { id name } } } }
                }",
                json!({ "id": id }),
            )
            .await?;
        let team: LinearTeam = serde_json::from_value(
            data.pointer("/issue/team")
                .cloned()
                .unwrap_or(Value::Null),
        )
        .context("issue has no team")?;

        let states = team.states.map(|s| s.nodes).unwrap_or_default();
        let state = states
            .iter()
            .find(|s| s.name.to_lowercase() == wanted.to_lowercase())
            .with_context(|| {
                let available: Vec<&str> = states.iter().map(|s| s.name.as_str()).collect();
                format!(
                    "workflow state '{wanted}' not found; available states: {}",
                    available.join(", ")
                )
            })?;

        let data = self
            .graphql(
                "mutation IssueSetState($id: String!, $stateId: String!) {
                  issueUpdate(id: $id, input: { stateId: $stateId }) { success }
                }",
                json!({ "id": id, "stateId": state.id }),
            )
            .await?;
        if data.pointer("/issueUpdate/success") != Some(&Value::Bool(true)) {
            anyhow::bail!("issueUpdate reported failure for issue {id}");
        }
        Ok(())
    }

    async fn add_comment(&self, id: &str, body: &str) -> anyhow::Result<()> {
        let data = self
            .graphql(
                "mutation CommentCreate($issueId: String!, $body: String!) {
                  commentCreate(input: { issueId: $issueId, body: $body }) { success }
                }",
                json!({ "issueId": id, "body": body }),
            )
            .await?;
        if data.pointer("/commentCreate/success") != Some(&Value::Bool(true)) {
            anyhow::bail!("commentCreate reported failure for issue {id}");
        }
        Ok(())
    }

    fn repository(&self, issue: &Issue) -> Option<String> {
        let fields = issue.metadata.get("customFields")?.as_object()?;
        let wanted = self.cfg.repo_field.to_lowercase();
        fields
            .iter()
            .find(|(name, _)| name.to_lowercase() == wanted)
            .and_then(|(_, value)| value.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn branch_name(&self, issue: &Issue) -> String {
        issue.identifier.clone()
    }

    fn verify_webhook(&self, body: &[u8], headers: &HeaderMap) -> Result<(), SignatureError> {
        // Linear sends a bare hex digest, no prefix.
        let digest = headers
            .get("linear-signature")
            .ok_or(SignatureError::Missing)?
            .to_str()
            .map_err(|_| SignatureError::Malformed)?;
        verify_hmac_sha256(body, &self.cfg.webhook_secret, digest)
    }

    async fn should_trigger(&self, event: &WebhookEvent) -> anyhow::Result<Trigger> {
        let payload = &event.payload;
        let resource = payload.get("type").and_then(Value::as_str);
        let action = payload.get("action").and_then(Value::as_str);
        if resource != Some("Issue") || action != Some("update") {
            return Ok(Trigger::Ignore);
        }

        let added = added_label_ids(payload);
        if added.is_empty() {
            return Ok(Trigger::Ignore);
        }

        let issue_id = payload
            .pointer("/data/id")
            .and_then(Value::as_str)
            .context("issue update event has no data.id")?;

        for label_id in &added {
            let Some(name) = self.label_name(label_id).await? else {
                continue;
            };
            if name.to_lowercase() == self.cfg.trigger_label.to_lowercase() {
                return Ok(Trigger::Admit {
                    issue_id: issue_id.to_string(),
                    label: name,
                });
            }
        }
        Ok(Trigger::Ignore)
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let data = self
            .graphql("query Viewer { viewer { id } }", json!({}))
            .await?;
        if data.pointer("/viewer/id").is_none() {
            anyhow::bail!("linear viewer query returned no identity");
        }
        Ok(())
    }
}

/// Label ids present on the issue now but absent from the previous state.
/// Events without a `labelIds` diff produce an empty set.
fn added_label_ids(payload: &Value) -> Vec<String> {
    let current = match payload.pointer("/data/labelIds").and_then(Value::as_array) {
        Some(ids) => ids,
        None => return Vec::new(),
    };
    let previous: Vec<&str> = payload
        .pointer("/updatedFrom/labelIds")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    // No recorded previous value means the labels did not change.
    if payload.pointer("/updatedFrom/labelIds").is_none() {
        return Vec::new();
    }

    current
        .iter()
        .filter_map(Value::as_str)
        .filter(|id| !previous.contains(id))
        .map(String::from)
        .collect()
}
