//! Event processing: correlation, mutation, and hook dispatch.
//!
//! Mutations are applied (and persisted under the task's file lock) before
//! the corresponding hook is awaited, so hooks always observe the
//! post-mutation record.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use store::{TaskStore, TaskUpdate};

use crate::events::{lookup, lookup_bool, lookup_str, lookup_u64, EventKind};
use crate::server::WebhookState;

/// A comment on a tracked PR.
#[derive(Debug, Clone)]
pub struct PrCommentEvent {
    pub pr_url: String,
    pub task_id: String,
    pub body: String,
    pub author: String,
}

/// One inline review comment.
#[derive(Debug, Clone)]
pub struct InlineComment {
    pub path: Option<String>,
    pub line: Option<u64>,
    pub body: String,
    pub author: String,
}

/// A review on a tracked PR by a recognized bot identity.
#[derive(Debug, Clone)]
pub struct BotReviewEvent {
    pub pr_url: String,
    pub task_id: String,
    pub reviewer: String,
    pub body: String,
    pub inline_comments: Vec<InlineComment>,
}

/// A failing or timed-out check on a tracked PR.
#[derive(Debug, Clone)]
pub struct CiFailureEvent {
    pub pr_url: String,
    pub task_id: String,
    pub check_name: String,
    pub logs: String,
}

/// Policy layer invoked after webhook mutations are persisted.
#[async_trait]
pub trait WebhookHooks: Send + Sync {
    async fn on_pr_comment(&self, _event: PrCommentEvent) {}
    async fn on_bot_review(&self, _event: BotReviewEvent) {}
    async fn on_ci_failure(&self, _event: CiFailureEvent) {}
}

/// Hooks that do nothing.
pub struct NoopHooks;

#[async_trait]
impl WebhookHooks for NoopHooks {}

/// Reconstruct the canonical PR URL for `(repo, number)` correlation.
#[must_use]
pub fn pr_url_for(repo: &str, number: u64) -> String {
    format!("https://github.com/{repo}/pull/{number}")
}

async fn find_task_by_pr_url(store: &TaskStore, pr_url: &str) -> Option<store::Task> {
    match store.list(None).await {
        Ok(tasks) => tasks.into_iter().find(|t| t.pr_url.as_deref() == Some(pr_url)),
        Err(e) => {
            warn!(error = %e, "could not list tasks for correlation");
            None
        }
    }
}

/// Process one validated event. The returned document becomes the 200 body.
pub async fn process_event(state: &WebhookState, kind: EventKind, body: &Value) -> Value {
    match kind {
        EventKind::PullRequest => handle_pull_request(state, body).await,
        EventKind::IssueComment => handle_issue_comment(state, body).await,
        EventKind::PullRequestReview => handle_review(state, body).await,
        EventKind::PullRequestReviewComment => handle_review_comment(state, body).await,
        EventKind::CheckRun => handle_check_run(state, body).await,
    }
}

async fn handle_pull_request(state: &WebhookState, body: &Value) -> Value {
    let action = lookup_str(body, "action").unwrap_or_default();
    if action != "closed" {
        return ignored("not_a_close_event");
    }
    let pr_url = lookup_str(body, "pull_request.html_url").unwrap_or_default();
    let Some(task) = find_task_by_pr_url(&state.store, pr_url).await else {
        return ignored("no_matching_task");
    };

    let merged = lookup_bool(body, "pull_request.merged").unwrap_or(false);
    let update = if merged {
        TaskUpdate {
            pr_merged: Some(true),
            pr_merged_at: Some(Utc::now()),
            ..TaskUpdate::default()
        }
    } else {
        TaskUpdate {
            pr_closed: Some(true),
            pr_closed_at: Some(Utc::now()),
            ..TaskUpdate::default()
        }
    };

    match state.store.update(&task.id, update).await {
        Ok(_) => {
            info!(task_id = %task.id, pr_url, merged, "recorded PR close");
            json!({ "status": "ok", "task_id": task.id, "merged": merged })
        }
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "could not record PR close");
            json!({ "status": "error", "task_id": task.id })
        }
    }
}

async fn handle_issue_comment(state: &WebhookState, body: &Value) -> Value {
    if lookup_str(body, "action").unwrap_or_default() != "created" {
        return ignored("not_a_new_comment");
    }
    // Only comments on PRs; plain issue comments have no pull_request key.
    if lookup(body, "issue.pull_request").is_none() {
        return ignored("not_a_pr_comment");
    }

    let pr_url = lookup_str(body, "issue.html_url").unwrap_or_default();
    let Some(task) = find_task_by_pr_url(&state.store, pr_url).await else {
        return ignored("no_matching_task");
    };

    let event = PrCommentEvent {
        pr_url: pr_url.to_string(),
        task_id: task.id.clone(),
        body: lookup_str(body, "comment.body").unwrap_or_default().to_string(),
        author: lookup_str(body, "comment.user.login")
            .unwrap_or_default()
            .to_string(),
    };
    state.hooks.on_pr_comment(event).await;
    json!({ "status": "ok", "task_id": task.id })
}

async fn handle_review(state: &WebhookState, body: &Value) -> Value {
    let action = lookup_str(body, "action").unwrap_or_default();
    if !matches!(action, "submitted" | "commented") {
        return ignored("not_a_submitted_review");
    }

    let reviewer = lookup_str(body, "review.user.login").unwrap_or_default();
    if !state.config.is_review_bot(reviewer) {
        debug!(reviewer, "review not from a recognized bot identity");
        return ignored("not_a_bot_review");
    }
    let review_state = lookup_str(body, "review.state")
        .unwrap_or_default()
        .to_lowercase();
    if !matches!(review_state.as_str(), "changes_requested" | "commented") {
        return ignored("review_state_not_actionable");
    }

    let pr_url = lookup_str(body, "pull_request.html_url").unwrap_or_default();
    let Some(task) = find_task_by_pr_url(&state.store, pr_url).await else {
        return ignored("no_matching_task");
    };

    let event = BotReviewEvent {
        pr_url: pr_url.to_string(),
        task_id: task.id.clone(),
        reviewer: reviewer.to_string(),
        body: lookup_str(body, "review.body").unwrap_or_default().to_string(),
        inline_comments: Vec::new(),
    };
    state.hooks.on_bot_review(event).await;
    json!({ "status": "ok", "task_id": task.id })
}

async fn handle_review_comment(state: &WebhookState, body: &Value) -> Value {
    if lookup_str(body, "action").unwrap_or_default() != "created" {
        return ignored("not_a_new_comment");
    }
    let author = lookup_str(body, "comment.user.login").unwrap_or_default();
    if !state.config.is_review_bot(author) {
        return ignored("not_a_bot_review");
    }

    let pr_url = lookup_str(body, "pull_request.html_url").unwrap_or_default();
    let Some(task) = find_task_by_pr_url(&state.store, pr_url).await else {
        return ignored("no_matching_task");
    };

    let comment_body = lookup_str(body, "comment.body").unwrap_or_default().to_string();
    let event = BotReviewEvent {
        pr_url: pr_url.to_string(),
        task_id: task.id.clone(),
        reviewer: author.to_string(),
        body: comment_body.clone(),
        inline_comments: vec![InlineComment {
            path: lookup_str(body, "comment.path").map(ToString::to_string),
            line: lookup_u64(body, "comment.line")
                .or_else(|| lookup_u64(body, "comment.original_line")),
            body: comment_body,
            author: author.to_string(),
        }],
    };
    state.hooks.on_bot_review(event).await;
    json!({ "status": "ok", "task_id": task.id })
}

async fn handle_check_run(state: &WebhookState, body: &Value) -> Value {
    if lookup_str(body, "action").unwrap_or_default() != "completed" {
        return ignored("check_not_completed");
    }
    let conclusion = lookup_str(body, "check_run.conclusion").unwrap_or_default();
    if !matches!(conclusion, "failure" | "timed_out") {
        return ignored("check_not_failed");
    }

    let check_name = lookup_str(body, "check_run.name").unwrap_or_default();
    let repo = lookup_str(body, "repository.full_name").unwrap_or_default();
    let summary = lookup_str(body, "check_run.output.summary").unwrap_or_default();
    let text = lookup_str(body, "check_run.output.text").unwrap_or_default();
    let logs = format!("{summary}\n\n{text}");

    let numbers: Vec<u64> = lookup(body, "check_run.pull_requests")
        .and_then(Value::as_array)
        .map(|prs| {
            prs.iter()
                .filter_map(|pr| pr.get("number").and_then(Value::as_u64))
                .collect()
        })
        .unwrap_or_default();

    let mut affected = Vec::new();
    for number in numbers {
        let pr_url = pr_url_for(repo, number);
        let Some(task) = find_task_by_pr_url(&state.store, &pr_url).await else {
            continue;
        };

        let update = TaskUpdate {
            ci_failed: Some(true),
            ci_failed_at: Some(Utc::now()),
            ci_failed_check: Some(check_name.to_string()),
            ..TaskUpdate::default()
        };
        if let Err(e) = state.store.update(&task.id, update).await {
            warn!(task_id = %task.id, error = %e, "could not record CI failure");
            continue;
        }

        info!(task_id = %task.id, check = check_name, "recorded CI failure");
        state
            .hooks
            .on_ci_failure(CiFailureEvent {
                pr_url,
                task_id: task.id.clone(),
                check_name: check_name.to_string(),
                logs: logs.clone(),
            })
            .await;
        affected.push(task.id);
    }

    if affected.is_empty() {
        ignored("no_matching_task")
    } else {
        json!({ "status": "ok", "tasks": affected, "check": check_name })
    }
}

fn ignored(reason: &str) -> Value {
    json!({ "status": "ignored", "reason": reason })
}
