//! File-backed task store.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use telemetry::metrics;

use crate::error::StoreError;
use crate::lock::RecordLock;
use crate::task::{NewTask, Task, TaskStatus, TaskUpdate};
use crate::StoreResult;

/// Persistent store: one JSON record per task in a configurable directory.
///
/// The directory is the serialization boundary; there is no index file, so
/// `list` scans and parses every record.
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks_dir: PathBuf,
}

impl TaskStore {
    #[must_use]
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }

    #[must_use]
    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    /// Sibling directory where worker logs are preserved on failure.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.tasks_dir
            .parent()
            .map_or_else(|| self.tasks_dir.join("logs"), |p| p.join("logs"))
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{id}.json"))
    }

    /// Create and persist a new pending task.
    pub async fn create(&self, input: NewTask) -> StoreResult<Task> {
        fs::create_dir_all(&self.tasks_dir).await?;

        let task = Task::create(input);
        let path = self.record_path(&task.id);
        let _lock = RecordLock::acquire(&path).await?;
        self.write_record(&path, &task).await?;

        metrics().inc_counter("squire_tasks_created_total", &[]);
        debug!(task_id = %task.id, repo = %task.repo, "created task");
        Ok(task)
    }

    /// Fetch a task by id.
    pub async fn get(&self, id: &str) -> StoreResult<Option<Task>> {
        let path = self.record_path(id);
        match fs::read_to_string(&path).await {
            Ok(content) => {
                let task = serde_json::from_str(&content)
                    .map_err(|source| StoreError::InvalidRecord { path, source })?;
                Ok(Some(task))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::FileRead { path, source }),
        }
    }

    /// Merge an update into a task under its file lock.
    ///
    /// Returns the merged record, or `None` when the task does not exist.
    pub async fn update(&self, id: &str, update: TaskUpdate) -> StoreResult<Option<Task>> {
        let path = self.record_path(id);
        let _lock = RecordLock::acquire(&path).await?;

        let Some(mut task) = self.get(id).await? else {
            return Ok(None);
        };
        let before = task.status;
        task.apply(&update);
        self.write_record(&path, &task).await?;
        self.record_transition_metrics(before, &task);
        Ok(Some(task))
    }

    /// Delete a task. Returns whether a record was present.
    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        let path = self.record_path(id);
        let _lock = RecordLock::acquire(&path).await?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::FileWrite { path, source }),
        }
    }

    /// List tasks, newest first (ties broken by id). Unparseable records
    /// are logged and skipped.
    pub async fn list(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>> {
        let mut entries = match fs::read_dir(&self.tasks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::FileRead {
                    path: self.tasks_dir.clone(),
                    source,
                })
            }
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable task record");
                    continue;
                }
            };
            match serde_json::from_str::<Task>(&content) {
                Ok(task) => {
                    if status.is_none_or(|s| task.status == s) {
                        tasks.push(task);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable task record");
                }
            }
        }

        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    /// Atomic write: serialize to a temp file in the tasks directory, then
    /// rename over the record path.
    async fn write_record(&self, path: &Path, task: &Task) -> StoreResult<()> {
        fs::create_dir_all(&self.tasks_dir).await?;
        let content = serde_json::to_string_pretty(task)?;

        let tmp = tempfile::NamedTempFile::new_in(&self.tasks_dir)?;
        std::io::Write::write_all(&mut tmp.as_file(), content.as_bytes()).map_err(|source| {
            StoreError::FileWrite {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tmp.persist(path).map_err(|e| StoreError::FileWrite {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    fn record_transition_metrics(&self, before: TaskStatus, after: &Task) {
        if before == after.status {
            return;
        }
        match after.status {
            TaskStatus::Running => {
                metrics().add_gauge("squire_tasks_running", &[], 1.0);
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                if before == TaskStatus::Running {
                    metrics().add_gauge("squire_tasks_running", &[], -1.0);
                }
                if after.status == TaskStatus::Completed {
                    metrics().inc_counter("squire_tasks_completed_total", &[]);
                }
                if let (Some(started), Some(completed)) = (after.started_at, after.completed_at) {
                    let duration = (completed - started).num_milliseconds() as f64 / 1000.0;
                    if duration >= 0.0 {
                        metrics().observe_histogram("squire_task_duration_seconds", &[], duration);
                    }
                }
            }
            TaskStatus::Pending => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        (dir, store)
    }

    fn sample(repo: &str) -> NewTask {
        NewTask {
            repo: repo.to_string(),
            prompt: "Fix bug".to_string(),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (_dir, store) = new_store();
        let task = store.create(sample("owner/r")).await.unwrap();

        let loaded = store.get(&task.id).await.unwrap().expect("task exists");
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.branch.as_deref(), Some(&*format!("squire/{}", task.id)));
        assert_eq!(loaded.base_branch.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn update_merges_and_persists() {
        let (_dir, store) = new_store();
        let task = store.create(sample("owner/r")).await.unwrap();

        let updated = store
            .update(
                &task.id,
                TaskUpdate {
                    pr_url: Some("https://github.com/owner/r/pull/1".to_string()),
                    pr_number: Some(1),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap()
            .expect("task exists");
        assert_eq!(updated.pr_number, Some(1));

        let loaded = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.pr_url.as_deref(),
            Some("https://github.com/owner/r/pull/1")
        );
        assert_eq!(loaded.prompt, "Fix bug");
    }

    #[tokio::test]
    async fn update_missing_task_returns_none() {
        let (_dir, store) = new_store();
        let result = store
            .update("no-such-id", TaskUpdate::completed())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let (_dir, store) = new_store();
        let task = store.create(sample("owner/r")).await.unwrap();

        assert!(store.delete(&task.id).await.unwrap());
        assert!(!store.delete(&task.id).await.unwrap());
        assert!(store.get(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_filters() {
        let (_dir, store) = new_store();
        let first = store.create(sample("owner/a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.create(sample("owner/b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let third = store.create(sample("owner/c")).await.unwrap();

        store
            .update(&second.id, TaskUpdate::started("w-1"))
            .await
            .unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(
            all.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec![third.id.as_str(), second.id.as_str(), first.id.as_str()]
        );

        let running = store.list(Some(TaskStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, second.id);

        let pending = store.list(Some(TaskStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn list_skips_unparseable_records() {
        let (_dir, store) = new_store();
        let task = store.create(sample("owner/r")).await.unwrap();

        fs::write(store.tasks_dir().join("garbage.json"), b"{not json")
            .await
            .unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, task.id);
    }

    #[tokio::test]
    async fn concurrent_updates_keep_the_record_valid() {
        let (_dir, store) = new_store();
        let task = store.create(sample("owner/r")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let store = store.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        &id,
                        TaskUpdate {
                            pr_number: Some(i),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Valid record, and the winning value is one of the submitted ones.
        let loaded = store.get(&task.id).await.unwrap().unwrap();
        let n = loaded.pr_number.expect("pr_number set");
        assert!(n < 8);
    }

    #[tokio::test]
    async fn concurrent_distinct_fields_all_persist() {
        let (_dir, store) = new_store();
        let task = store.create(sample("owner/r")).await.unwrap();

        let merged = {
            let store = store.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                store
                    .update(
                        &id,
                        TaskUpdate {
                            pr_merged: Some(true),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
            })
        };
        let ci = {
            let store = store.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                store
                    .update(
                        &id,
                        TaskUpdate {
                            ci_failed: Some(true),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
            })
        };
        merged.await.unwrap().unwrap();
        ci.await.unwrap().unwrap();

        let loaded = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.pr_merged, Some(true));
        assert_eq!(loaded.ci_failed, Some(true));
    }

    #[tokio::test]
    async fn lifecycle_matches_state_machine() {
        let (_dir, store) = new_store();
        let task = store.create(sample("owner/r")).await.unwrap();

        let running = store
            .update(&task.id, TaskUpdate::started("worker-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());
        assert_eq!(running.worker_id.as_deref(), Some("worker-1"));

        let done = store
            .update(&task.id, TaskUpdate::completed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        let completed_at = done.completed_at.unwrap();

        // Late failure converges on the existing terminal state.
        let after = store
            .update(&task.id, TaskUpdate::failed("late"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, TaskStatus::Completed);
        assert_eq!(after.completed_at, Some(completed_at));
    }
}
