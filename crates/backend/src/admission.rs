//! Concurrency admission control.
//!
//! Counts live workers against the configured cap and optionally waits for
//! a slot. Counting also opportunistically converges task records whose
//! worker has already stopped, so the count reflects reality rather than
//! stale store state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use store::{TaskStatus, TaskStore, TaskUpdate};

use crate::types::{BackendError, BackendResult, WorkerBackend, WorkerTaskInfo};

/// Default cadence for [`wait_for_slot`].
pub const DEFAULT_SLOT_POLL: Duration = Duration::from_secs(5);
/// Default give-up bound for [`wait_for_slot`].
pub const DEFAULT_SLOT_MAX_WAIT: Duration = Duration::from_secs(300);

/// Outcome of a [`can_start`] check.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionStatus {
    pub allowed: bool,
    pub running: usize,
    pub max: usize,
}

/// Count live workers, synchronizing task status from worker state.
///
/// A listed worker that has stopped while its task still says `running`
/// gets its terminal outcome applied on the spot.
pub async fn count_running(
    store: &TaskStore,
    backend: &Arc<dyn WorkerBackend>,
) -> BackendResult<usize> {
    let workers = backend.list().await?;
    let mut running = 0;

    for info in &workers {
        if info.running {
            running += 1;
            continue;
        }
        sync_stopped_worker(store, info).await;
    }
    Ok(running)
}

async fn sync_stopped_worker(store: &TaskStore, info: &WorkerTaskInfo) {
    let Ok(Some(task)) = store.get(&info.task_id).await else {
        return;
    };
    if task.status != TaskStatus::Running {
        return;
    }

    let update = match info.exit_code {
        Some(0) => TaskUpdate::completed(),
        Some(code) => TaskUpdate::failed(format!(
            "worker {} exited with code {code}",
            crate::types::worker_id_prefix(&info.worker_id)
        )),
        None => TaskUpdate::failed(format!(
            "worker {} stopped without an exit code",
            crate::types::worker_id_prefix(&info.worker_id)
        )),
    };
    debug!(task_id = %info.task_id, "synchronizing task from stopped worker");
    let _ = store.update(&info.task_id, update).await;
}

/// Whether another worker may start under `max_concurrent`.
pub async fn can_start(
    store: &TaskStore,
    backend: &Arc<dyn WorkerBackend>,
    max_concurrent: usize,
) -> BackendResult<AdmissionStatus> {
    let running = count_running(store, backend).await?;
    Ok(AdmissionStatus {
        allowed: running < max_concurrent,
        running,
        max: max_concurrent,
    })
}

/// Poll [`can_start`] until a slot frees up or `max_wait` elapses.
pub async fn wait_for_slot(
    store: &TaskStore,
    backend: &Arc<dyn WorkerBackend>,
    max_concurrent: usize,
    poll_interval: Duration,
    max_wait: Duration,
) -> BackendResult<AdmissionStatus> {
    let deadline = Instant::now() + max_wait;
    loop {
        let status = can_start(store, backend, max_concurrent).await?;
        if status.allowed {
            return Ok(status);
        }
        if Instant::now() + poll_interval > deadline {
            return Err(BackendError::SlotWaitTimeout(max_wait));
        }
        info!(
            running = status.running,
            max = status.max,
            "at capacity, waiting for a free slot"
        );
        tokio::time::sleep(poll_interval).await;
    }
}

/// Live running tasks per repository, for per-repo caps.
pub async fn running_by_repo(
    backend: &Arc<dyn WorkerBackend>,
) -> BackendResult<std::collections::HashMap<String, usize>> {
    let workers = backend.list().await?;
    let mut by_repo = std::collections::HashMap::new();
    for info in workers {
        if info.running && !info.repo.is_empty() {
            *by_repo.entry(info.repo).or_insert(0) += 1;
        }
    }
    Ok(by_repo)
}
