//! The task record and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states. The only legal transitions are
/// `pending -> running` and `running -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One coding directive and everything observed about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// "owner/name" or a full repository URL.
    pub repo: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    // Populated asynchronously from webhook events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_merged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_merged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_closed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_closed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_failed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_failed_check: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_fix_task_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_fix_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_fixed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Human-readable failure reason; set only in `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
}

/// Inputs for [`Task::create`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub repo: String,
    pub prompt: String,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub parent_task_id: Option<String>,
}

impl Task {
    /// Build a fresh pending task. The branch is auto-synthesized as
    /// `squire/<id>` when absent; the base branch defaults to `main`.
    #[must_use]
    pub fn create(input: NewTask) -> Self {
        let id = Uuid::new_v4().to_string();
        let branch = input
            .branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| format!("squire/{id}"));
        let base_branch = input
            .base_branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "main".to_string());

        Self {
            id,
            repo: input.repo,
            prompt: input.prompt,
            branch: Some(branch),
            base_branch: Some(base_branch),
            status: TaskStatus::Pending,
            worker_id: None,
            pr_url: None,
            pr_number: None,
            pr_merged: None,
            pr_merged_at: None,
            pr_closed: None,
            pr_closed_at: None,
            ci_failed: None,
            ci_failed_at: None,
            ci_failed_check: None,
            ci_fix_task_id: None,
            review_fix_task_id: None,
            review_fixed_at: None,
            parent_task_id: input.parent_task_id,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_retry_at: None,
        }
    }

    /// Merge an update into this record, field-wise.
    ///
    /// Status changes are guarded by the state machine: once the task is
    /// terminal, a competing status write (and its `completed_at`/`error`
    /// companions) is dropped, so the first terminal writer wins and
    /// `completed_at` is set exactly once.
    pub fn apply(&mut self, update: &TaskUpdate) {
        let status_accepted = match update.status {
            Some(next) if next != self.status => {
                if self.status.can_transition_to(next) {
                    self.status = next;
                    true
                } else {
                    false
                }
            }
            Some(_) => true,
            None => true,
        };

        if let Some(worker_id) = &update.worker_id {
            // Worker ids are only assigned once; retries create new tasks.
            if self.worker_id.is_none() {
                self.worker_id = Some(worker_id.clone());
            }
        }
        if status_accepted {
            if let Some(started_at) = update.started_at {
                self.started_at.get_or_insert(started_at);
            }
            if let Some(completed_at) = update.completed_at {
                self.completed_at.get_or_insert(completed_at);
            }
            if let Some(error) = &update.error {
                if self.status == TaskStatus::Failed && self.error.is_none() {
                    self.error = Some(error.clone());
                }
            }
        }

        if let Some(v) = &update.pr_url {
            self.pr_url = Some(v.clone());
        }
        if let Some(v) = update.pr_number {
            self.pr_number = Some(v);
        }
        if let Some(v) = update.pr_merged {
            self.pr_merged = Some(v);
        }
        if let Some(v) = update.pr_merged_at {
            self.pr_merged_at = Some(v);
        }
        if let Some(v) = update.pr_closed {
            self.pr_closed = Some(v);
        }
        if let Some(v) = update.pr_closed_at {
            self.pr_closed_at = Some(v);
        }
        if let Some(v) = update.ci_failed {
            self.ci_failed = Some(v);
        }
        if let Some(v) = update.ci_failed_at {
            self.ci_failed_at = Some(v);
        }
        if let Some(v) = &update.ci_failed_check {
            self.ci_failed_check = Some(v.clone());
        }
        if let Some(v) = &update.ci_fix_task_id {
            self.ci_fix_task_id = Some(v.clone());
        }
        if let Some(v) = &update.review_fix_task_id {
            self.review_fix_task_id = Some(v.clone());
        }
        if let Some(v) = update.review_fixed_at {
            self.review_fixed_at = Some(v);
        }
        if let Some(v) = update.retry_count {
            self.retry_count = v;
        }
        if let Some(v) = update.last_retry_at {
            self.last_retry_at = Some(v);
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub pr_merged: Option<bool>,
    pub pr_merged_at: Option<DateTime<Utc>>,
    pub pr_closed: Option<bool>,
    pub pr_closed_at: Option<DateTime<Utc>>,
    pub ci_failed: Option<bool>,
    pub ci_failed_at: Option<DateTime<Utc>>,
    pub ci_failed_check: Option<String>,
    pub ci_fix_task_id: Option<String>,
    pub review_fix_task_id: Option<String>,
    pub review_fixed_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    /// Update that moves a pending task into `running`.
    #[must_use]
    pub fn started(worker_id: &str) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            worker_id: Some(worker_id.to_string()),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Update that completes a running task.
    #[must_use]
    pub fn completed() -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            completed_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Update that fails a task with a reason.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            completed_at: Some(Utc::now()),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}
