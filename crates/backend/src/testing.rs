//! In-memory backend for tests.
//!
//! Implements the full capability set against a `HashMap`, with hooks to
//! script start failures and worker outcomes. Used by this crate's
//! supervisor/admission/reconciler tests and by the webhook and steward
//! test suites, so it lives in the library rather than behind `cfg(test)`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::types::{
    BackendError, BackendResult, StartRequest, WorkerBackend, WorkerTaskInfo,
};

#[derive(Debug, Clone)]
pub struct MockWorker {
    pub task_id: String,
    pub repo: String,
    pub retry_count: u32,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub logs: String,
    pub stopped: bool,
}

#[derive(Default)]
struct MockState {
    workers: HashMap<String, MockWorker>,
    start_errors: VecDeque<BackendError>,
    removed: Vec<String>,
    next_id: u64,
}

/// Scriptable in-memory [`WorkerBackend`].
pub struct MockBackend {
    state: Mutex<MockState>,
    poll_interval: Duration,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Queue an error for the next `start` call; errors drain in order.
    pub fn push_start_error(&self, error: BackendError) {
        self.state.lock().unwrap().start_errors.push_back(error);
    }

    /// Pre-seed a worker that was not started through `start` (reconciler
    /// and admission fixtures).
    pub fn insert_worker(
        &self,
        task_id: &str,
        repo: &str,
        running: bool,
        exit_code: Option<i64>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let worker_id = format!("mock-{}", state.next_id);
        state.workers.insert(
            worker_id.clone(),
            MockWorker {
                task_id: task_id.to_string(),
                repo: repo.to_string(),
                retry_count: 0,
                running,
                exit_code,
                logs: String::new(),
                stopped: false,
            },
        );
        worker_id
    }

    /// Mark a running worker as exited.
    pub fn finish(&self, worker_id: &str, exit_code: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.running = false;
            worker.exit_code = Some(exit_code);
        }
    }

    pub fn set_logs(&self, worker_id: &str, logs: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.logs = logs.to_string();
        }
    }

    #[must_use]
    pub fn worker_for_task(&self, task_id: &str) -> Option<(String, MockWorker)> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .iter()
            .find(|(_, w)| w.task_id == task_id)
            .map(|(id, w)| (id.clone(), w.clone()))
    }

    #[must_use]
    pub fn removed_workers(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    #[must_use]
    pub fn was_stopped(&self, worker_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .workers
            .get(worker_id)
            .is_some_and(|w| w.stopped)
    }
}

#[async_trait]
impl WorkerBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn start(&self, request: &StartRequest) -> BackendResult<String> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.start_errors.pop_front() {
            return Err(error);
        }
        state.next_id += 1;
        let worker_id = format!("mock-{}", state.next_id);
        state.workers.insert(
            worker_id.clone(),
            MockWorker {
                task_id: request.task.id.clone(),
                repo: request.task.repo.clone(),
                retry_count: request.task.retry_count,
                running: true,
                exit_code: None,
                logs: String::new(),
                stopped: false,
            },
        );
        Ok(worker_id)
    }

    async fn logs(&self, worker_id: &str, _tail: Option<usize>) -> BackendResult<String> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .get(worker_id)
            .map(|w| w.logs.clone())
            .ok_or_else(|| BackendError::NotFound(worker_id.to_string()))
    }

    async fn is_running(&self, worker_id: &str) -> BackendResult<bool> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .get(worker_id)
            .map(|w| w.running)
            .ok_or_else(|| BackendError::NotFound(worker_id.to_string()))
    }

    async fn exit_code(&self, worker_id: &str) -> BackendResult<Option<i64>> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .get(worker_id)
            .map(|w| if w.running { None } else { w.exit_code })
            .ok_or_else(|| BackendError::NotFound(worker_id.to_string()))
    }

    async fn stop(&self, worker_id: &str) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.stopped = true;
            if worker.running {
                worker.running = false;
                // SIGKILL-style exit for a worker that had to be stopped.
                worker.exit_code.get_or_insert(137);
            }
        }
        Ok(())
    }

    async fn remove(&self, worker_id: &str) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.workers.remove(worker_id);
        state.removed.push(worker_id.to_string());
        Ok(())
    }

    async fn list(&self) -> BackendResult<Vec<WorkerTaskInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workers
            .iter()
            .map(|(id, w)| WorkerTaskInfo {
                task_id: w.task_id.clone(),
                worker_id: id.clone(),
                running: w.running,
                exit_code: if w.running { None } else { w.exit_code },
                repo: w.repo.clone(),
                retry_count: w.retry_count,
                created_at: Some(Utc::now()),
            })
            .collect())
    }
}
