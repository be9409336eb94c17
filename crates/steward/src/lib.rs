//! Steward: the companion orchestrator for Squire.
//!
//! A pipeline cycle collects external signals (open PRs, failed CI runs,
//! open issues, bot reviews, file drops), optionally auto-merges
//! high-confidence approvals, asks an LLM to synthesize new coding
//! directives against the configured goals, dispatches them through the
//! task store and worker backend, and reports the outcomes.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod analyzer;
pub mod automerge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod review;
pub mod schedule;
pub mod signals;
pub mod state;

pub use analyzer::{Analyzer, Priority, ProposedTask};
pub use config::StewardConfig;
pub use error::StewardError;
pub use pipeline::{CycleReport, Pipeline};
pub use signals::{Signal, SignalSource};
pub use state::{StewardState, TaskRecord, TaskRecordStatus};
