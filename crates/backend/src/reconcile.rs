//! Reconciliation between the task store and live worker state.
//!
//! After a crash or restart, supervisors are gone but workers may still be
//! running (or may have finished, or vanished). A reconcile pass walks
//! every `running` task, resurrects lost outcomes, marks orphans failed,
//! and optionally removes workers whose task no longer exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use store::{TaskStatus, TaskStore, TaskUpdate};

use crate::types::{worker_id_prefix, BackendResult, WorkerBackend, WorkerTaskInfo};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Count actions without performing them.
    pub dry_run: bool,
    /// Remove live workers whose task record is missing.
    pub remove_orphaned_workers: bool,
}

#[derive(Debug, Default)]
pub struct ReconcileResult {
    /// Running tasks examined.
    pub tasks_reconciled: usize,
    pub tasks_marked_failed: usize,
    pub tasks_marked_completed: usize,
    pub orphaned_workers_removed: usize,
    /// Subsystem failures; other actions proceed past them.
    pub errors: Vec<String>,
}

static RECONCILED_THIS_PROCESS: AtomicBool = AtomicBool::new(false);

/// Converge the store with observed worker state.
pub async fn reconcile(
    store: &TaskStore,
    backend: &Arc<dyn WorkerBackend>,
    options: ReconcileOptions,
) -> ReconcileResult {
    let mut result = ReconcileResult::default();

    let workers = match backend.list().await {
        Ok(workers) => workers,
        Err(e) => {
            result.errors.push(format!("could not list workers: {e}"));
            return result;
        }
    };
    let by_task: HashMap<&str, &WorkerTaskInfo> =
        workers.iter().map(|w| (w.task_id.as_str(), w)).collect();

    let running_tasks = match store.list(Some(TaskStatus::Running)).await {
        Ok(tasks) => tasks,
        Err(e) => {
            result.errors.push(format!("could not list tasks: {e}"));
            return result;
        }
    };

    for task in &running_tasks {
        result.tasks_reconciled += 1;

        let update = match by_task.get(task.id.as_str()) {
            None => {
                warn!(task_id = %task.id, "running task has no worker, marking failed");
                result.tasks_marked_failed += 1;
                TaskUpdate::failed("worker not found during reconciliation")
            }
            Some(info) if info.running => continue,
            Some(info) => match info.exit_code {
                Some(0) => {
                    info!(task_id = %task.id, "resurrecting completed outcome");
                    result.tasks_marked_completed += 1;
                    TaskUpdate::completed()
                }
                Some(code) => {
                    result.tasks_marked_failed += 1;
                    TaskUpdate::failed(format!(
                        "worker {} exited with code {code}",
                        worker_id_prefix(&info.worker_id)
                    ))
                }
                None => {
                    result.tasks_marked_failed += 1;
                    TaskUpdate::failed(format!(
                        "worker {} stopped without an exit code",
                        worker_id_prefix(&info.worker_id)
                    ))
                }
            },
        };

        if options.dry_run {
            continue;
        }
        if let Err(e) = store.update(&task.id, update).await {
            result
                .errors
                .push(format!("could not update task {}: {e}", task.id));
        }
    }

    if options.remove_orphaned_workers {
        for worker in &workers {
            let orphaned = match store.get(&worker.task_id).await {
                Ok(record) => record.is_none(),
                Err(e) => {
                    result.errors.push(format!(
                        "could not read task {} for worker {}: {e}",
                        worker.task_id,
                        worker_id_prefix(&worker.worker_id)
                    ));
                    false
                }
            };
            if !orphaned {
                continue;
            }
            result.orphaned_workers_removed += 1;
            if options.dry_run {
                continue;
            }
            info!(
                worker = worker_id_prefix(&worker.worker_id),
                task_id = %worker.task_id,
                "removing orphaned worker"
            );
            if let Err(e) = backend.remove(&worker.worker_id).await {
                result.errors.push(format!(
                    "could not remove worker {}: {e}",
                    worker_id_prefix(&worker.worker_id)
                ));
            }
        }
    }

    info!(
        reconciled = result.tasks_reconciled,
        failed = result.tasks_marked_failed,
        completed = result.tasks_marked_completed,
        orphans_removed = result.orphaned_workers_removed,
        errors = result.errors.len(),
        "reconciliation finished"
    );
    result
}

/// Run [`reconcile`] at most once per process startup, regardless of how
/// many entry points ask for it.
pub async fn reconcile_once(
    store: &TaskStore,
    backend: &Arc<dyn WorkerBackend>,
    options: ReconcileOptions,
) -> Option<ReconcileResult> {
    if RECONCILED_THIS_PROCESS.swap(true, Ordering::SeqCst) {
        return None;
    }
    Some(reconcile(store, backend, options).await)
}

/// Test hook: allow [`reconcile_once`] to run again.
pub fn reset_reconcile_flag() {
    RECONCILED_THIS_PROCESS.store(false, Ordering::SeqCst);
}

/// Cheap read-only predicate: is there anything a reconcile pass would do?
pub async fn needs_reconciliation(
    store: &TaskStore,
    backend: &Arc<dyn WorkerBackend>,
) -> BackendResult<bool> {
    let running_tasks = store
        .list(Some(TaskStatus::Running))
        .await
        .map_err(|e| crate::types::BackendError::Other(format!("task store error: {e}")))?;
    if !running_tasks.is_empty() {
        return Ok(true);
    }

    let workers = backend.list().await?;
    for worker in workers {
        if store
            .get(&worker.task_id)
            .await
            .map(|t| t.is_none())
            .unwrap_or(true)
        {
            return Ok(true);
        }
    }
    Ok(false)
}
