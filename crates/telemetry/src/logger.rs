//! Logger initialization and structured record helpers.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use crate::redact::redacted;
use crate::trace::current_trace_id;

static QUIET: AtomicBool = AtomicBool::new(false);

/// Options controlling subscriber installation.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Force `debug` for all squire components.
    pub verbose: bool,
    /// Silence all output. Takes precedence over `verbose`.
    pub quiet: bool,
    /// Emit single-line JSON records instead of the human format.
    pub json: bool,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` still wins when set, so operators can target individual
/// components the usual way. Safe to call more than once; later calls are
/// no-ops (the first subscriber stays installed).
pub fn init_logging(options: &LogOptions) {
    QUIET.store(options.quiet, Ordering::Relaxed);

    let default_directive = if options.quiet {
        "off"
    } else if options.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    let result = if options.json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
    // A second init (tests, embedded use) keeps the existing subscriber.
    drop(result);
}

/// Whether quiet mode is active.
#[must_use]
pub fn is_quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

/// Emit a structured record with redacted metadata.
///
/// The metadata document is redacted before serialization, and the current
/// trace id (when an activity has established one) is stamped on the record.
pub fn log_with_meta(level: Level, component: &str, message: &str, metadata: &Value) {
    if is_quiet() {
        return;
    }
    let meta = redacted(metadata).to_string();
    let trace_id = current_trace_id().unwrap_or_default();
    match level {
        Level::ERROR => {
            tracing::error!(component, trace_id = %trace_id, meta = %meta, "{message}");
        }
        Level::WARN => {
            tracing::warn!(component, trace_id = %trace_id, meta = %meta, "{message}");
        }
        Level::DEBUG => {
            tracing::debug!(component, trace_id = %trace_id, meta = %meta, "{message}");
        }
        Level::TRACE => {
            tracing::trace!(component, trace_id = %trace_id, meta = %meta, "{message}");
        }
        _ => {
            tracing::info!(component, trace_id = %trace_id, meta = %meta, "{message}");
        }
    }
}

/// Emit an audit record for a security-sensitive event.
///
/// Audit records are info-level with `audit: true` and the operation name
/// merged into the (redacted) metadata, so they can be filtered out of the
/// stream as a single class.
pub fn audit(component: &str, operation: &str, metadata: &Value) {
    if is_quiet() {
        return;
    }
    let mut meta = redacted(metadata);
    if let Value::Object(map) = &mut meta {
        map.insert("audit".to_string(), Value::Bool(true));
        map.insert(
            "operation".to_string(),
            Value::String(operation.to_string()),
        );
    }
    let trace_id = current_trace_id().unwrap_or_default();
    info!(
        component,
        audit = true,
        operation,
        trace_id = %trace_id,
        meta = %meta.to_string(),
        "audit: {operation}"
    );
}
