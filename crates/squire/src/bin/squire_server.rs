//! Squire server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use backend::{
    install_backend, reconcile_once, BackendKind, ClusterBackend, DockerBackend, ReconcileOptions,
    WorkerBackend,
};
use squire::{app_router, SquireConfig};
use store::TaskStore;
use telemetry::{init_logging, LogOptions};
use webhook::{AutoFixHooks, WebhookState};

#[derive(Debug, Parser)]
#[command(name = "squire-server", about = "Webhook and metrics server for Squire")]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Skip the startup reconciliation pass.
    #[arg(long)]
    no_reconcile: bool,

    /// Remove workers whose task record is gone during reconciliation.
    #[arg(long)]
    remove_orphans: bool,

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

    let config = SquireConfig::resolve().await;
    let webhook_config = config.webhook_config();
    webhook_config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("refusing to start")?;

    let store = TaskStore::new(config.tasks_dir.clone());
    let backend = connect_backend(&config).await?;
    install_backend(backend.clone());
    info!(
        backend = backend.name(),
        tasks_dir = %store.tasks_dir().display(),
        "squire server starting"
    );

    if !cli.no_reconcile {
        // Converge persisted state with live workers before taking traffic.
        let store = store.clone();
        let backend = backend.clone();
        let options = ReconcileOptions {
            dry_run: false,
            remove_orphaned_workers: cli.remove_orphans,
        };
        tokio::spawn(async move {
            if let Some(result) = reconcile_once(&store, &backend, options).await {
                info!(
                    reconciled = result.tasks_reconciled,
                    completed = result.tasks_marked_completed,
                    failed = result.tasks_marked_failed,
                    orphans_removed = result.orphaned_workers_removed,
                    "startup reconciliation done"
                );
            }
        });
    }

    let hooks = AutoFixHooks::new(
        store.clone(),
        backend.clone(),
        config.dispatch_options(cli.verbose),
    );
    let state = Arc::new(WebhookState {
        store,
        config: webhook_config,
        hooks: Arc::new(hooks),
    });

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("could not bind {}", cli.listen))?;
    info!(listen = %cli.listen, "serving /webhook, /metrics, /health");
    axum::serve(listener, app_router(state))
        .await
        .context("server error")?;
    Ok(())
}

async fn connect_backend(config: &SquireConfig) -> anyhow::Result<Arc<dyn WorkerBackend>> {
    Ok(match config.backend {
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
