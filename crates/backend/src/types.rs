//! The backend seam: capability set, start request, and error type.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use store::Task;

/// Label keys stamped on every managed worker.
pub const LABEL_TASK_ID: &str = "squire.dev/task-id";
pub const LABEL_RETRY_COUNT: &str = "squire.dev/retry-count";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "squire";
/// The repository lives in an annotation on the cluster backend (label
/// values cannot contain `/`); the Docker backend uses the same key as a
/// plain label.
pub const ANNOTATION_REPO: &str = "squire.dev/repo";

/// Per-worker resource and lifecycle limits.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hard upper bound on worker lifetime.
    pub timeout_minutes: u64,
    /// Transient-failure retry budget for `start` itself.
    pub max_retries: u32,
    /// Worker CPU cap, in cores.
    pub cpu_limit: f64,
    /// Worker memory cap.
    pub memory_limit_mb: u64,
    /// Copy worker logs to the logs directory on failure/timeout.
    pub preserve_logs_on_failure: bool,
    /// Remove the worker once its outcome (and logs) are captured.
    pub auto_cleanup: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            max_retries: 3,
            cpu_limit: 2.0,
            memory_limit_mb: 4096,
            preserve_logs_on_failure: true,
            auto_cleanup: true,
        }
    }
}

/// Everything a backend needs to start one worker.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Read-only task snapshot.
    pub task: Task,
    /// Repo-host token, injected as both `GITHUB_TOKEN` and `GH_TOKEN`.
    pub github_token: String,
    /// LLM model id handed to the coding agent.
    pub model: String,
    /// Worker image identifier.
    pub image: String,
    pub verbose: bool,
    /// Host directory mounted read-only at `/skills` when present.
    pub skills_dir: Option<PathBuf>,
    /// Container runtime override (e.g. `runsc` for gVisor sandboxing).
    pub container_runtime: Option<String>,
    pub config: WorkerConfig,
}

/// Ephemeral view of one managed worker from a backend listing.
#[derive(Debug, Clone)]
pub struct WorkerTaskInfo {
    pub task_id: String,
    pub worker_id: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub repo: String,
    pub retry_count: u32,
    pub created_at: Option<DateTime<Utc>>,
}

/// Errors surfaced by worker backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("worker not found: {0}")]
    NotFound(String),

    #[error("no worker backend installed")]
    NotInstalled,

    #[error("backend configuration error: {0}")]
    Config(String),

    #[error("timed out waiting for a free slot after {0:?}")]
    SlotWaitTimeout(Duration),

    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Phrases that mark a `start` failure as transient and worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "econnrefused",
    "no such host",
    "name resolution",
    "timed out",
    "timeout",
    "socket hang up",
    "network error",
    "no such container",
    "is restarting",
    "oom",
];

impl BackendError {
    /// Whether retrying `start` may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        let message = self.to_string().to_lowercase();
        TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
    }
}

/// Abstract worker lifecycle operations. One concrete implementation is
/// installed process-wide at startup; this is the only dynamic-dispatch
/// seam in the system.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Supervisor poll cadence for workers of this backend.
    fn poll_interval(&self) -> Duration;

    /// Schedule a worker; returns the backend-assigned worker id.
    async fn start(&self, request: &StartRequest) -> BackendResult<String>;

    /// Combined stdout/stderr of the worker as one string.
    async fn logs(&self, worker_id: &str, tail: Option<usize>) -> BackendResult<String>;

    async fn is_running(&self, worker_id: &str) -> BackendResult<bool>;

    /// Exit code once the worker has stopped; `None` while running or when
    /// the code cannot be determined.
    async fn exit_code(&self, worker_id: &str) -> BackendResult<Option<i64>>;

    async fn stop(&self, worker_id: &str) -> BackendResult<()>;

    async fn remove(&self, worker_id: &str) -> BackendResult<()>;

    /// All live or recently-exited workers carrying the managed-by marker.
    async fn list(&self) -> BackendResult<Vec<WorkerTaskInfo>>;
}

/// Short prefix of a worker id for log messages.
#[must_use]
pub fn worker_id_prefix(worker_id: &str) -> &str {
    &worker_id[..worker_id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_markers_match_case_insensitively() {
        for message in [
            "connect ECONNREFUSED 127.0.0.1:2375",
            "Connection refused",
            "lookup registry: no such host",
            "request timed out",
            "socket hang up",
            "network error during pull",
            "No such container: abc123",
            "container abc is restarting",
            "worker OOM killed",
        ] {
            let err = BackendError::Other(message.to_string());
            assert!(err.is_transient(), "expected transient: {message}");
        }
    }

    #[test]
    fn permanent_errors_are_not_transient() {
        for message in [
            "image not found in registry",
            "invalid reference format",
            "unauthorized: bad credentials",
        ] {
            let err = BackendError::Other(message.to_string());
            assert!(!err.is_transient(), "expected permanent: {message}");
        }
    }

    #[test]
    fn worker_id_prefix_truncates() {
        assert_eq!(worker_id_prefix("0123456789abcdef"), "0123456789ab");
        assert_eq!(worker_id_prefix("short"), "short");
    }
}
