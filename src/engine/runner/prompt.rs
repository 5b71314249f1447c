//! Prompt construction.
//!
//! The section order and headings are a contract: downstream tooling keys
//! off them. Empty sections are omitted entirely rather than rendered as
//! bare headings.

use crate::providers::Issue;
use chrono::{DateTime, Local};

/// Fixed guidance appended to every prompt.
const REQUIREMENTS: &str = "## Requirements

- Implement the change described above.
- Follow the repository's existing code style and conventions.
- Run the project's tests and linters when they are available.
- Keep the change focused; do not refactor unrelated code.
- When you are done, leave the working tree in its final state. Your output \
will be committed and pushed for human review.";

/// Assemble the plain-text prompt for one agent run.
pub fn build_prompt(issue: &Issue, repo: &str, branch: &str) -> String {
    let mut prompt = format!("You are working on: {}\n\n", issue.title);

    prompt.push_str(&format!("Issue: {}\n", issue.identifier));
    prompt.push_str(&format!("Repository: {repo}\n"));
    prompt.push_str(&format!("Branch: {branch}\n"));

    if let Some(description) = issue
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
    {
        prompt.push_str(&format!("\n## Description\n\n{}\n", description.trim_end()));
    }

    if let Some(parent) = &issue.parent {
        prompt.push_str(&format!(
            "\n## Parent Issue Context\n\n**{}**: {}\n",
            parent.identifier, parent.title
        ));
        if let Some(description) = parent
            .description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
        {
            prompt.push_str(&format!("\n{}\n", description.trim_end()));
        }
    }

    if !issue.labels.is_empty() {
        prompt.push_str("\n## Labels\n\n");
        for label in &issue.labels {
            prompt.push_str(&format!("- {}\n", label.name));
        }
    }

    if !issue.comments.is_empty() {
        prompt.push_str("\n## Discussion\n\n");
        for comment in &issue.comments {
            let author = comment.author.as_deref().unwrap_or("unknown");
            let date = localize(&comment.created_at);
            prompt.push_str(&format!(
                "**{author}** ({date}):\n{}\n\n",
                comment.body.trim_end()
            ));
        }
    }

    prompt.push_str(&format!("\n{REQUIREMENTS}\n"));
    prompt
}

/// Render an RFC 3339 timestamp in local time, falling back to the raw
/// string when the provider sent something unexpected.
fn localize(timestamp: &str) -> String {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{IssueComment, Label, ParentIssue};
    use serde_json::json;

    fn bare_issue() -> Issue {
        Issue {
            id: "uuid-1".into(),
            identifier: "ENG-7".into(),
            title: "Fix crash".into(),
            description: None,
            labels: vec![],
            comments: vec![],
            parent: None,
            repository: None,
            metadata: json!({}),
        }
    }

    #[test]
    fn header_and_metadata_trio_always_present() {
        let prompt = build_prompt(&bare_issue(), "my-proj", "ENG-7");
        assert!(prompt.starts_with("You are working on: Fix crash\n"));
        assert!(prompt.contains("Issue: ENG-7\n"));
        assert!(prompt.contains("Repository: my-proj\n"));
        assert!(prompt.contains("Branch: ENG-7\n"));
        assert!(prompt.contains("## Requirements"));
        assert!(prompt.contains("committed and pushed"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let prompt = build_prompt(&bare_issue(), "my-proj", "ENG-7");
        assert!(!prompt.contains("## Description"));
        assert!(!prompt.contains("## Parent Issue Context"));
        assert!(!prompt.contains("## Labels"));
        assert!(!prompt.contains("## Discussion"));
    }

    #[test]
    fn sections_appear_in_contract_order() {
        let mut issue = bare_issue();
        issue.description = Some("It crashes on empty input.".into());
        issue.parent = Some(ParentIssue {
            id: "uuid-0".into(),
            identifier: "ENG-1".into(),
            title: "Stability epic".into(),
            description: Some("Crash-free January.".into()),
        });
        issue.labels = vec![
            Label {
                id: "l1".into(),
                name: "bug".into(),
            },
            Label {
                id: "l2".into(),
                name: "ai-attempt".into(),
            },
        ];
        issue.comments = vec![IssueComment {
            id: "c1".into(),
            body: "Stack trace attached.".into(),
            created_at: "2026-01-05T10:00:00+00:00".into(),
            author: Some("alice".into()),
        }];

        let prompt = build_prompt(&issue, "my-proj", "ENG-7");
        let description = prompt.find("## Description").unwrap();
        let parent = prompt.find("## Parent Issue Context").unwrap();
        let labels = prompt.find("## Labels").unwrap();
        let discussion = prompt.find("## Discussion").unwrap();
        let requirements = prompt.find("## Requirements").unwrap();
        assert!(description < parent);
        assert!(parent < labels);
        assert!(labels < discussion);
        assert!(discussion < requirements);

        assert!(prompt.contains("**ENG-1**: Stability epic"));
        assert!(prompt.contains("- bug\n- ai-attempt\n"));
        assert!(prompt.contains("**alice** ("));
        assert!(prompt.contains("Stack trace attached."));
    }

    #[test]
    fn whitespace_only_description_is_omitted() {
        let mut issue = bare_issue();
        issue.description = Some("   \n".into());
        let prompt = build_prompt(&issue, "my-proj", "ENG-7");
        assert!(!prompt.contains("## Description"));
    }

    #[test]
    fn unknown_comment_author_falls_back() {
        let mut issue = bare_issue();
        issue.comments = vec![IssueComment {
            id: "c1".into(),
            body: "drive-by note".into(),
            created_at: "not-a-date".into(),
            author: None,
        }];
        let prompt = build_prompt(&issue, "my-proj", "ENG-7");
        assert!(prompt.contains("**unknown** (not-a-date):"));
    }
}
