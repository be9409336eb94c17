//! Steward's task-history snapshot.
//!
//! A lightweight record of what Steward has dispatched and how it ended,
//! kept separate from the task store so the analyzer can see its own
//! recent history without scanning every Squire task.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StewardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskRecordStatus {
    Dispatched,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub repo: String,
    pub prompt: String,
    pub status: TaskRecordStatus,
    pub dispatched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StewardState {
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

impl StewardState {
    /// Load from disk; a missing or unreadable file yields a fresh state.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state file unparseable, starting fresh");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist atomically (temp file then rename).
    pub fn save(&self, path: &Path) -> Result<(), StewardError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp.as_file(), content.as_bytes())?;
        tmp.persist(path).map_err(|e| StewardError::Io(e.error))?;
        Ok(())
    }

    pub fn record_dispatched(&mut self, task_id: &str, repo: &str, prompt: &str) {
        self.tasks.push(TaskRecord {
            task_id: task_id.to_string(),
            repo: repo.to_string(),
            prompt: prompt.to_string(),
            status: TaskRecordStatus::Dispatched,
            dispatched_at: Utc::now(),
            completed_at: None,
            pr_url: None,
        });
    }

    /// Record a terminal outcome for a dispatched task.
    pub fn mark_terminal(&mut self, task_id: &str, status: TaskRecordStatus, pr_url: Option<&str>) {
        if status == TaskRecordStatus::Dispatched {
            return;
        }
        if let Some(record) = self.tasks.iter_mut().find(|r| r.task_id == task_id) {
            if record.status == TaskRecordStatus::Dispatched {
                record.status = status;
                record.completed_at = Some(Utc::now());
                record.pr_url = pr_url.map(ToString::to_string);
            }
        }
    }

    /// Tasks dispatched and not yet terminal.
    #[must_use]
    pub fn active(&self) -> Vec<&TaskRecord> {
        self.tasks
            .iter()
            .filter(|r| r.status == TaskRecordStatus::Dispatched)
            .collect()
    }

    /// Most recent records with the given terminal status, newest first.
    #[must_use]
    pub fn recent(&self, status: TaskRecordStatus, limit: usize) -> Vec<&TaskRecord> {
        let mut records: Vec<&TaskRecord> = self
            .tasks
            .iter()
            .filter(|r| r.status == status)
            .collect();
        records.sort_by(|a, b| b.dispatched_at.cmp(&a.dispatched_at));
        records.truncate(limit);
        records
    }

    /// Active task count per repository, for per-repo caps.
    #[must_use]
    pub fn active_by_repo(&self) -> std::collections::HashMap<String, usize> {
        let mut by_repo = std::collections::HashMap::new();
        for record in self.active() {
            *by_repo.entry(record.repo.clone()).or_insert(0) += 1;
        }
        by_repo
    }
}
