//! Worker backends for the Squire platform.
//!
//! A worker is an ephemeral execution context (Docker container or
//! Kubernetes batch Job) running the coding agent for exactly one task.
//! This crate provides the backend seam and both concrete implementations,
//! plus everything that sits on top of it: dispatch with transient-error
//! retry, per-worker supervision, admission control, and reconciliation
//! between the task store and live worker state.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod admission;
pub mod cluster;
pub mod dispatch;
pub mod docker;
pub mod naming;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod supervisor;
pub mod testing;
pub mod types;

pub use admission::{can_start, count_running, running_by_repo, wait_for_slot, AdmissionStatus};
pub use cluster::ClusterBackend;
pub use dispatch::{start_task, DispatchOptions};
pub use docker::DockerBackend;
pub use reconcile::{
    needs_reconciliation, reconcile, reconcile_once, reset_reconcile_flag, ReconcileOptions,
    ReconcileResult,
};
pub use registry::{backend, install_backend, reset_backend, set_backend, BackendKind};
pub use supervisor::spawn_supervisor;
pub use types::{
    BackendError, BackendResult, StartRequest, WorkerBackend, WorkerConfig, WorkerTaskInfo,
};
