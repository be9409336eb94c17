//! Steward entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use backend::{
    install_backend, reconcile_once, BackendKind, ClusterBackend, DispatchOptions, DockerBackend,
    ReconcileOptions, WorkerBackend, WorkerConfig,
};
use steward::analyzer::Analyzer;
use steward::config::StewardConfig;
use steward::pipeline::Pipeline;
use steward::schedule::run_watch;
use steward::signals::SignalCollector;
use store::TaskStore;
use telemetry::{init_logging, LogOptions};

#[derive(Debug, Parser)]
#[command(name = "steward", about = "Signal-driven task orchestrator for Squire")]
struct Cli {
    /// Config file (default: STEWARD_CONFIG_PATH, ./steward.yaml, /config/steward.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single cycle and exit instead of watching.
    #[arg(long)]
    once: bool,

    /// Log every decision without dispatching or merging anything.
    #[arg(long)]
    dry_run: bool,

    /// Steward state file (default: ~/.squire/steward-state.json).
    #[arg(long)]
    state_file: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&LogOptions {
        verbose: cli.verbose,
        quiet: cli.quiet,
        json: false,
    });

    let config = match &cli.config {
        Some(path) => StewardConfig::from_file(path)?,
        None => StewardConfig::load()?,
    };

    let github_token = resolve_github_token().await;
    let squire_home = squire_home();
    let store = TaskStore::new(
        std::env::var("SQUIRE_TASKS_DIR")
            .map_or_else(|_| squire_home.join("tasks"), PathBuf::from),
    );
    let state_path = cli
        .state_file
        .clone()
        .unwrap_or_else(|| squire_home.join("steward-state.json"));

    let backend = connect_backend(&config).await?;
    install_backend(backend.clone());

    // Converge store and workers once before the first cycle; guarded so a
    // co-located server that already ran it is not repeated.
    if let Some(result) = reconcile_once(&store, &backend, ReconcileOptions::default()).await {
        info!(
            reconciled = result.tasks_reconciled,
            failed = result.tasks_marked_failed,
            "startup reconciliation done"
        );
    }

    let exec = &config.execution.squire;
    let dispatch_options = DispatchOptions {
        github_token: github_token.clone().unwrap_or_default(),
        model: exec
            .model
            .clone()
            .or_else(|| std::env::var("SQUIRE_MODEL").ok())
            .unwrap_or_else(|| "opencode/glm-4.7-free".to_string()),
        image: std::env::var("SQUIRE_WORKER_IMAGE")
            .unwrap_or_else(|_| "squire-worker:latest".to_string()),
        verbose: cli.verbose,
        skills_dir: std::env::var("SQUIRE_SKILLS_DIR").ok().map(PathBuf::from),
        container_runtime: std::env::var("SQUIRE_CONTAINER_RUNTIME").ok(),
        worker: WorkerConfig::default(),
    };

    let llm = &config.llm;
    let analyzer = Analyzer::new(
        &llm.model,
        &llm.base_url,
        std::env::var(&llm.api_key_env).ok(),
    );
    let collector = SignalCollector::new(github_token);

    let schedule = config.schedule.clone();
    let pipeline = Pipeline::new(
        config,
        store,
        backend,
        collector,
        analyzer,
        dispatch_options,
        state_path,
    );

    if cli.once {
        pipeline.run_cycle(cli.dry_run).await?;
    } else {
        run_watch(&pipeline, &schedule, cli.dry_run).await;
    }
    Ok(())
}

fn squire_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".squire")
}

async fn connect_backend(config: &StewardConfig) -> anyhow::Result<Arc<dyn WorkerBackend>> {
    let kind: BackendKind = config
        .execution
        .backend
        .clone()
        .or_else(|| std::env::var("SQUIRE_BACKEND").ok())
        .unwrap_or_else(|| "container".to_string())
        .parse()
        .context("invalid backend kind")?;

    Ok(match kind {
        BackendKind::Container => Arc::new(
            DockerBackend::connect()
                .await
                .context("could not connect to the container daemon")?,
        ),
        BackendKind::Cluster => Arc::new(
            ClusterBackend::connect(std::env::var("SQUIRE_NAMESPACE").ok())
                .await
                .context("could not connect to the cluster")?,
        ),
    })
}

/// Token from the environment, else from the host CLI when present.
async fn resolve_github_token() -> Option<String> {
    if let Ok(token) = std::env::var("GITHUB_TOKEN") {
        return Some(token);
    }
    if let Ok(token) = std::env::var("GH_TOKEN") {
        return Some(token);
    }
    let output = tokio::process::Command::new("gh")
        .args(["auth", "token"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!token.is_empty()).then_some(token)
}
