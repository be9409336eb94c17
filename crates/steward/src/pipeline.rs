//! The five-stage Steward cycle:
//! collect → auto-merge → analyze → dispatch → monitor & report.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use backend::{DispatchOptions, WorkerBackend};
use store::TaskStore;
use telemetry::{new_trace_id, with_trace_id};

use crate::analyzer::Analyzer;
use crate::automerge::{auto_merge, MergeOutcome};
use crate::config::StewardConfig;
use crate::dispatch::{dispatch_tasks, DispatchedTask, SkippedTask};
use crate::error::StewardError;
use crate::monitor::{monitor_dispatched, MonitorReport};
use crate::signals::SignalCollector;
use crate::state::StewardState;

/// Everything one cycle produced.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub signals: usize,
    pub merges: Vec<MergeOutcome>,
    pub proposed: usize,
    pub dispatched: Vec<DispatchedTask>,
    pub skipped: Vec<SkippedTask>,
    pub monitor: MonitorReport,
}

pub struct Pipeline {
    config: StewardConfig,
    store: TaskStore,
    backend: Arc<dyn WorkerBackend>,
    collector: SignalCollector,
    analyzer: Analyzer,
    dispatch_options: DispatchOptions,
    state_path: PathBuf,
}

impl Pipeline {
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        config: StewardConfig,
        store: TaskStore,
        backend: Arc<dyn WorkerBackend>,
        collector: SignalCollector,
        analyzer: Analyzer,
        dispatch_options: DispatchOptions,
        state_path: PathBuf,
    ) -> Self {
        Self {
            config,
            store,
            backend,
            collector,
            analyzer,
            dispatch_options,
            state_path,
        }
    }

    /// Run one full cycle under a fresh trace context.
    pub async fn run_cycle(&self, dry_run: bool) -> Result<CycleReport, StewardError> {
        with_trace_id(new_trace_id(), self.cycle(dry_run)).await
    }

    async fn cycle(&self, dry_run: bool) -> Result<CycleReport, StewardError> {
        let mut report = CycleReport::default();
        info!(dry_run, "starting steward cycle");

        // Stage 1: collect.
        let signals = self.collector.collect(&self.config.signals).await;
        report.signals = signals.len();

        // Stage 2: auto-merge (optional, safety-gated).
        report.merges = auto_merge(&signals, &self.config.auto_merge, dry_run).await;

        // Stage 3: analyze. An analyzer failure degrades to no proposals;
        // monitoring of previously dispatched work still matters.
        let goals = self.config.goals_text();
        let store_tasks = self.store.list(None).await?;
        let mut state = StewardState::load(&self.state_path);
        let proposed = match self
            .analyzer
            .analyze(&goals, &signals, &state, &store_tasks)
            .await
        {
            Ok(proposed) => proposed,
            Err(e) => {
                warn!(error = %e, "analyzer failed, proposing nothing this cycle");
                Vec::new()
            }
        };
        report.proposed = proposed.len();

        // Stage 4: dispatch.
        let dispatch_report = dispatch_tasks(
            &self.store,
            self.backend.clone(),
            &mut state,
            proposed,
            &self.config,
            &self.dispatch_options,
            dry_run,
        )
        .await?;
        report.dispatched = dispatch_report.dispatched;
        report.skipped = dispatch_report.skipped;

        // Stage 5: monitor & report.
        report.monitor = monitor_dispatched(&self.store, &mut state, &report.dispatched).await;

        state.last_run = Some(Utc::now());
        if !dry_run {
            state.save(&self.state_path)?;
        }

        print_report(&report);
        Ok(report)
    }
}

/// Grouped console report for the cycle.
fn print_report(report: &CycleReport) {
    println!("steward cycle summary");
    println!("  signals collected: {}", report.signals);
    if !report.merges.is_empty() {
        let merged = report.merges.iter().filter(|m| m.merged).count();
        println!("  auto-merge: {merged}/{} merged", report.merges.len());
        for outcome in &report.merges {
            let mark = if outcome.merged { "merged" } else { "failed" };
            println!("    {} {}#{}", mark, outcome.repo, outcome.pr_number);
        }
    }
    println!("  proposed: {}", report.proposed);
    println!("  dispatched: {}", report.dispatched.len());
    for task in &report.dispatched {
        println!("    [{}] {} ({})", task.repo, task.prompt, task.task_id);
    }
    if !report.skipped.is_empty() {
        println!("  skipped: {}", report.skipped.len());
        for task in &report.skipped {
            println!("    {} ({})", task.prompt, task.reason);
        }
    }
    let monitor = &report.monitor;
    println!(
        "  status: {} running, {} completed, {} failed, {} unknown",
        monitor.running.len(),
        monitor.completed.len(),
        monitor.failed.len(),
        monitor.unknown.len()
    );
}
