//! Auto-fix follow-up policy.
//!
//! When CI fails on a tracked PR, or a review bot leaves feedback, a
//! derived task is synthesized on the same branch and dispatched through
//! the backend. Each parent carries at most one CI-fix child; review-fix
//! children are re-created only once the previous one has finished.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use backend::{start_task, DispatchOptions, WorkerBackend};
use store::{NewTask, Task, TaskStore, TaskUpdate};

use crate::handlers::{BotReviewEvent, CiFailureEvent, WebhookHooks};

/// Longest log excerpt embedded into a derived prompt.
const MAX_LOG_EXCERPT: usize = 3000;

pub struct AutoFixHooks {
    store: TaskStore,
    backend: Arc<dyn WorkerBackend>,
    dispatch: DispatchOptions,
}

impl AutoFixHooks {
    #[must_use]
    pub fn new(
        store: TaskStore,
        backend: Arc<dyn WorkerBackend>,
        dispatch: DispatchOptions,
    ) -> Self {
        Self {
            store,
            backend,
            dispatch,
        }
    }

    async fn parent(&self, task_id: &str) -> Option<Task> {
        match self.store.get(task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id, error = %e, "could not load parent task");
                None
            }
        }
    }

    /// Whether `child_id` is still in flight (pending or running).
    async fn child_in_flight(&self, child_id: &str) -> bool {
        match self.store.get(child_id).await {
            Ok(Some(child)) => !child.status.is_terminal(),
            _ => false,
        }
    }

    async fn dispatch_child(&self, child: &Task) {
        if let Err(e) = start_task(&self.store, self.backend.clone(), child, &self.dispatch).await
        {
            warn!(task_id = %child.id, error = %e, "auto-fix task failed to start");
        }
    }
}

#[async_trait]
impl WebhookHooks for AutoFixHooks {
    async fn on_ci_failure(&self, event: CiFailureEvent) {
        let Some(parent) = self.parent(&event.task_id).await else {
            return;
        };
        // One CI-fix child per task, ever.
        if let Some(existing) = &parent.ci_fix_task_id {
            debug!(
                task_id = %parent.id,
                ci_fix_task_id = %existing,
                "CI fix already dispatched, skipping"
            );
            return;
        }

        let excerpt: String = event.logs.chars().take(MAX_LOG_EXCERPT).collect();
        let prompt = format!(
            "The CI check '{check}' failed on pull request {pr_url}.\n\n\
             Failure output:\n{excerpt}\n\n\
             Investigate the failure and push a fix to the same branch.",
            check = event.check_name,
            pr_url = event.pr_url,
        );

        let child = match self
            .store
            .create(NewTask {
                repo: parent.repo.clone(),
                prompt,
                // Same branch: the fix amends the PR under test.
                branch: parent.branch.clone(),
                base_branch: parent.base_branch.clone(),
                parent_task_id: Some(parent.id.clone()),
            })
            .await
        {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %parent.id, error = %e, "could not create CI fix task");
                return;
            }
        };

        if let Err(e) = self
            .store
            .update(
                &parent.id,
                TaskUpdate {
                    ci_fix_task_id: Some(child.id.clone()),
                    ..TaskUpdate::default()
                },
            )
            .await
        {
            warn!(task_id = %parent.id, error = %e, "could not record CI fix child");
        }

        info!(
            parent = %parent.id,
            child = %child.id,
            check = %event.check_name,
            "dispatching CI fix task"
        );
        self.dispatch_child(&child).await;
    }

    async fn on_bot_review(&self, event: BotReviewEvent) {
        let Some(parent) = self.parent(&event.task_id).await else {
            return;
        };
        if let Some(existing) = &parent.review_fix_task_id {
            if self.child_in_flight(existing).await {
                debug!(
                    task_id = %parent.id,
                    review_fix_task_id = %existing,
                    "review fix still in flight, skipping"
                );
                return;
            }
        }

        let mut prompt = format!(
            "Address the code review feedback from {reviewer} on pull request {pr_url}.\n",
            reviewer = event.reviewer,
            pr_url = event.pr_url,
        );
        if !event.body.is_empty() {
            let _ = write!(prompt, "\nReview summary:\n{}\n", event.body);
        }
        if !event.inline_comments.is_empty() {
            prompt.push_str("\nInline comments:\n");
            for comment in &event.inline_comments {
                let location = match (&comment.path, comment.line) {
                    (Some(path), Some(line)) => format!("{path}:{line}"),
                    (Some(path), None) => path.clone(),
                    _ => "general".to_string(),
                };
                let _ = writeln!(prompt, "- [{location}] {}", comment.body);
            }
        }
        prompt.push_str("\nPush the fixes to the same branch.");

        let child = match self
            .store
            .create(NewTask {
                repo: parent.repo.clone(),
                prompt,
                branch: parent.branch.clone(),
                base_branch: parent.base_branch.clone(),
                parent_task_id: Some(parent.id.clone()),
            })
            .await
        {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %parent.id, error = %e, "could not create review fix task");
                return;
            }
        };

        if let Err(e) = self
            .store
            .update(
                &parent.id,
                TaskUpdate {
                    review_fix_task_id: Some(child.id.clone()),
                    review_fixed_at: Some(Utc::now()),
                    ..TaskUpdate::default()
                },
            )
            .await
        {
            warn!(task_id = %parent.id, error = %e, "could not record review fix child");
        }

        info!(
            parent = %parent.id,
            child = %child.id,
            reviewer = %event.reviewer,
            "dispatching review fix task"
        );
        self.dispatch_child(&child).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{webhook_router, WebhookConfig, WebhookState};
    use crate::verify::EVENT_HEADER;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use backend::testing::MockBackend;
    use backend::WorkerConfig;
    use serde_json::json;
    use store::TaskStatus;
    use tower::ServiceExt;

    fn dispatch_options() -> DispatchOptions {
        DispatchOptions {
            github_token: "ghp_test".to_string(),
            model: "opencode/glm-4.7-free".to_string(),
            image: "squire-worker:latest".to_string(),
            verbose: false,
            skills_dir: None,
            container_runtime: None,
            worker: WorkerConfig::default(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: TaskStore,
        backend: Arc<MockBackend>,
        router: axum::Router,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        let backend = Arc::new(MockBackend::new());
        let hooks = AutoFixHooks::new(store.clone(), backend.clone(), dispatch_options());
        let router = webhook_router(Arc::new(WebhookState {
            store: store.clone(),
            config: WebhookConfig {
                secret: None,
                require_secret: false,
                review_bot_users: vec!["review-bot".to_string()],
            },
            hooks: Arc::new(hooks),
        }));
        Fixture {
            _dir: dir,
            store,
            backend,
            router,
        }
    }

    async fn tracked_task(store: &TaskStore, pr_number: u64) -> Task {
        let task = store
            .create(NewTask {
                repo: "owner/r".to_string(),
                prompt: "Implement feature".to_string(),
                ..NewTask::default()
            })
            .await
            .unwrap();
        store
            .update(
                &task.id,
                TaskUpdate {
                    pr_url: Some(format!("https://github.com/owner/r/pull/{pr_number}")),
                    pr_number: Some(pr_number),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap()
            .unwrap()
    }

    fn check_run_event(pr_number: u64) -> String {
        serde_json::to_string(&json!({
            "action": "completed",
            "check_run": {
                "name": "tests",
                "conclusion": "failure",
                "output": { "summary": "2 tests failed", "text": "assertion details" },
                "pull_requests": [ { "number": pr_number } ],
            },
            "repository": { "full_name": "owner/r" },
        }))
        .unwrap()
    }

    async fn post(router: &axum::Router, event: &str, body: &str) -> StatusCode {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(EVENT_HEADER, event)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn ci_failure_dispatches_one_fix_task() {
        let fx = fixture();
        let parent = tracked_task(&fx.store, 7).await;

        let status = post(&fx.router, "check_run", &check_run_event(7)).await;
        assert_eq!(status, StatusCode::OK);

        let parent = fx.store.get(&parent.id).await.unwrap().unwrap();
        assert_eq!(parent.ci_failed, Some(true));
        assert_eq!(parent.ci_failed_check.as_deref(), Some("tests"));
        let child_id = parent.ci_fix_task_id.clone().expect("fix task recorded");

        let child = fx.store.get(&child_id).await.unwrap().unwrap();
        assert_eq!(child.parent_task_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.branch, parent.branch);
        assert_eq!(child.status, TaskStatus::Running);
        assert!(child.prompt.contains("tests"));
        assert!(child.prompt.contains("2 tests failed"));
        assert!(fx.backend.worker_for_task(&child_id).is_some());

        // A second identical event is suppressed.
        let status = post(&fx.router, "check_run", &check_run_event(7)).await;
        assert_eq!(status, StatusCode::OK);
        let parent_after = fx.store.get(&parent.id).await.unwrap().unwrap();
        assert_eq!(parent_after.ci_fix_task_id.as_deref(), Some(child_id.as_str()));
        assert_eq!(fx.store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bot_review_dispatches_fix_with_feedback_embedded() {
        let fx = fixture();
        let parent = tracked_task(&fx.store, 3).await;

        let body = serde_json::to_string(&json!({
            "action": "submitted",
            "pull_request": {
                "html_url": "https://github.com/owner/r/pull/3",
                "number": 3,
            },
            "review": {
                "user": { "login": "review-bot" },
                "state": "changes_requested",
                "body": "File: src/lib.rs\nLine: 42\nIssue: unwrap on user input",
            },
        }))
        .unwrap();
        let status = post(&fx.router, "pull_request_review", &body).await;
        assert_eq!(status, StatusCode::OK);

        let parent = fx.store.get(&parent.id).await.unwrap().unwrap();
        let child_id = parent.review_fix_task_id.clone().expect("fix task recorded");
        assert!(parent.review_fixed_at.is_some());

        let child = fx.store.get(&child_id).await.unwrap().unwrap();
        assert!(child.prompt.contains("review-bot"));
        assert!(child.prompt.contains("unwrap on user input"));
        assert_eq!(child.status, TaskStatus::Running);

        // While the child is in flight, further reviews are suppressed.
        let status = post(&fx.router, "pull_request_review", &body).await;
        assert_eq!(status, StatusCode::OK);
        let parent_after = fx.store.get(&parent.id).await.unwrap().unwrap();
        assert_eq!(
            parent_after.review_fix_task_id.as_deref(),
            Some(child_id.as_str())
        );
        assert_eq!(fx.store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reviews_from_unknown_users_are_ignored() {
        let fx = fixture();
        let parent = tracked_task(&fx.store, 4).await;

        let body = serde_json::to_string(&json!({
            "action": "submitted",
            "pull_request": {
                "html_url": "https://github.com/owner/r/pull/4",
                "number": 4,
            },
            "review": {
                "user": { "login": "human-reviewer" },
                "state": "changes_requested",
                "body": "please fix",
            },
        }))
        .unwrap();
        let status = post(&fx.router, "pull_request_review", &body).await;
        assert_eq!(status, StatusCode::OK);

        let parent = fx.store.get(&parent.id).await.unwrap().unwrap();
        assert!(parent.review_fix_task_id.is_none());
        assert_eq!(fx.store.list(None).await.unwrap().len(), 1);
    }
}
