//! Task dispatch: start a worker for a pending task.
//!
//! Transient start failures retry with exponential backoff and jitter,
//! persisting the retry count before each attempt. A successful start
//! transitions the task to running and installs its supervisor.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use store::{Task, TaskStore, TaskUpdate};
use telemetry::metrics;

use crate::retry::backoff_delay;
use crate::supervisor::spawn_supervisor;
use crate::types::{BackendError, BackendResult, StartRequest, WorkerBackend, WorkerConfig};

/// Per-deployment dispatch parameters, resolved once from configuration.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub github_token: String,
    pub model: String,
    pub image: String,
    pub verbose: bool,
    pub skills_dir: Option<PathBuf>,
    pub container_runtime: Option<String>,
    pub worker: WorkerConfig,
}

impl DispatchOptions {
    fn request_for(&self, task: &Task) -> StartRequest {
        StartRequest {
            task: task.clone(),
            github_token: self.github_token.clone(),
            model: self.model.clone(),
            image: self.image.clone(),
            verbose: self.verbose,
            skills_dir: self.skills_dir.clone(),
            container_runtime: self.container_runtime.clone(),
            config: self.worker.clone(),
        }
    }
}

/// Start a worker for `task` and supervise it to completion.
///
/// Returns the running task on success. On a non-transient error, or when
/// the retry budget is exhausted, the task is marked failed and the error
/// returned.
pub async fn start_task(
    store: &TaskStore,
    backend: Arc<dyn WorkerBackend>,
    task: &Task,
    options: &DispatchOptions,
) -> BackendResult<Task> {
    let mut current = task.clone();
    let mut attempt: u32 = 0;

    loop {
        let request = options.request_for(&current);
        match backend.start(&request).await {
            Ok(worker_id) => {
                metrics().inc_counter("squire_container_starts_total", &[]);
                let updated = store
                    .update(&current.id, TaskUpdate::started(&worker_id))
                    .await
                    .map_err(store_error)?
                    .ok_or_else(|| {
                        BackendError::Other(format!("task {} vanished during start", current.id))
                    })?;

                info!(
                    task_id = %updated.id,
                    worker = %crate::types::worker_id_prefix(&worker_id),
                    backend = backend.name(),
                    "task running"
                );
                spawn_supervisor(
                    store.clone(),
                    backend.clone(),
                    updated.id.clone(),
                    worker_id,
                    options.worker.clone(),
                );
                return Ok(updated);
            }
            Err(e) if e.is_transient() && attempt < options.worker.max_retries => {
                attempt += 1;
                warn!(
                    task_id = %current.id,
                    attempt,
                    max_retries = options.worker.max_retries,
                    error = %e,
                    "transient start failure, retrying"
                );
                current = store
                    .update(
                        &current.id,
                        TaskUpdate {
                            retry_count: Some(attempt),
                            last_retry_at: Some(Utc::now()),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
                    .map_err(store_error)?
                    .ok_or_else(|| {
                        BackendError::Other(format!("task {} vanished during retry", current.id))
                    })?;
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(e) => {
                warn!(task_id = %current.id, error = %e, "worker start failed");
                let _ = store
                    .update(
                        &current.id,
                        TaskUpdate::failed(format!("failed to start worker: {e}")),
                    )
                    .await;
                return Err(e);
            }
        }
    }
}

fn store_error(e: store::StoreError) -> BackendError {
    BackendError::Other(format!("task store error: {e}"))
}
