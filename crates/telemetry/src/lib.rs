//! Observability for the Squire platform.
//!
//! This crate provides:
//! - Logger initialization over `tracing-subscriber` with quiet/verbose modes
//! - Secret redaction for structured log metadata
//! - Trace-context propagation across async boundaries
//! - Audit records for security-sensitive events
//! - An in-process metrics registry with Prometheus text exposition

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod logger;
pub mod metrics;
pub mod redact;
pub mod trace;

pub use logger::{audit, init_logging, LogOptions};
pub use metrics::{metrics, MetricsRegistry, DURATION_BUCKETS};
pub use redact::{fingerprint, redact_metadata};
pub use trace::{current_trace_id, new_trace_id, with_trace_id};
