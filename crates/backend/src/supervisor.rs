//! Per-worker supervision.
//!
//! Every successfully started worker gets one supervisor task that polls it
//! to a terminal state: normal exit, failure, or wall-clock timeout.
//! Supervisors share nothing with each other; cancellation is the task's
//! own timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use store::{TaskStore, TaskUpdate};

use crate::types::{worker_id_prefix, WorkerBackend, WorkerConfig};

/// Spawn the supervisor for one worker.
pub fn spawn_supervisor(
    store: TaskStore,
    backend: Arc<dyn WorkerBackend>,
    task_id: String,
    worker_id: String,
    config: WorkerConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        supervise(&store, backend.as_ref(), &task_id, &worker_id, &config).await;
    })
}

async fn supervise(
    store: &TaskStore,
    backend: &dyn WorkerBackend,
    task_id: &str,
    worker_id: &str,
    config: &WorkerConfig,
) {
    let interval = backend.poll_interval();
    let deadline = Instant::now() + Duration::from_secs(config.timeout_minutes * 60);

    loop {
        tokio::time::sleep(interval).await;

        if Instant::now() >= deadline {
            handle_timeout(store, backend, task_id, worker_id, config).await;
            return;
        }

        match backend.is_running(worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                handle_exit(store, backend, task_id, worker_id, config).await;
                return;
            }
            Err(e) => {
                error!(
                    task_id,
                    worker = worker_id_prefix(worker_id),
                    error = %e,
                    "supervisor could not poll worker"
                );
                let _ = store
                    .update(task_id, TaskUpdate::failed(format!("monitoring error: {e}")))
                    .await;
                return;
            }
        }
    }
}

async fn handle_exit(
    store: &TaskStore,
    backend: &dyn WorkerBackend,
    task_id: &str,
    worker_id: &str,
    config: &WorkerConfig,
) {
    let update = match backend.exit_code(worker_id).await {
        Ok(Some(0)) => {
            info!(task_id, worker = worker_id_prefix(worker_id), "worker completed");
            TaskUpdate::completed()
        }
        Ok(Some(code)) => {
            warn!(
                task_id,
                worker = worker_id_prefix(worker_id),
                exit_code = code,
                "worker failed"
            );
            TaskUpdate::failed(format!(
                "worker {} exited with code {code}",
                worker_id_prefix(worker_id)
            ))
        }
        Ok(None) => TaskUpdate::failed(format!(
            "worker {} stopped without an exit code",
            worker_id_prefix(worker_id)
        )),
        Err(e) => TaskUpdate::failed(format!("monitoring error: {e}")),
    };

    let failed = update.error.is_some();
    if failed && config.preserve_logs_on_failure {
        preserve_logs(store, backend, task_id, worker_id).await;
    }

    if let Err(e) = store.update(task_id, update).await {
        error!(task_id, error = %e, "could not persist worker outcome");
        return;
    }

    if config.auto_cleanup {
        if let Err(e) = backend.remove(worker_id).await {
            warn!(worker = worker_id_prefix(worker_id), error = %e, "worker cleanup failed");
        }
    }
}

async fn handle_timeout(
    store: &TaskStore,
    backend: &dyn WorkerBackend,
    task_id: &str,
    worker_id: &str,
    config: &WorkerConfig,
) {
    warn!(
        task_id,
        worker = worker_id_prefix(worker_id),
        timeout_minutes = config.timeout_minutes,
        "worker timed out"
    );

    if let Err(e) = backend.stop(worker_id).await {
        warn!(worker = worker_id_prefix(worker_id), error = %e, "could not stop timed-out worker");
    }

    if config.preserve_logs_on_failure {
        preserve_logs(store, backend, task_id, worker_id).await;
    }

    let _ = store
        .update(
            task_id,
            TaskUpdate::failed(format!(
                "Task timed out after {} minutes",
                config.timeout_minutes
            )),
        )
        .await;

    if config.auto_cleanup {
        if let Err(e) = backend.remove(worker_id).await {
            warn!(worker = worker_id_prefix(worker_id), error = %e, "worker cleanup failed");
        }
    }
}

/// Copy worker logs next to the task records before the worker goes away.
async fn preserve_logs(
    store: &TaskStore,
    backend: &dyn WorkerBackend,
    task_id: &str,
    worker_id: &str,
) {
    let logs = match backend.logs(worker_id, None).await {
        Ok(logs) => logs,
        Err(e) => {
            warn!(worker = worker_id_prefix(worker_id), error = %e, "could not capture worker logs");
            return;
        }
    };

    let dir = store.logs_dir();
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(dir = %dir.display(), error = %e, "could not create logs directory");
        return;
    }
    let path = dir.join(format!("{task_id}.log"));
    if let Err(e) = tokio::fs::write(&path, logs).await {
        warn!(path = %path.display(), error = %e, "could not preserve worker logs");
    } else {
        info!(task_id, path = %path.display(), "preserved worker logs");
    }
}
