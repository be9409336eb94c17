//! Squire configuration.
//!
//! Resolution order: environment variables first, then the first of the
//! candidate config files that exists (`./squire.json`, `~/.squire.json`,
//! `~/.config/squire/config.json`); file values override env values. The
//! repo-host token additionally falls back to the host CLI when neither
//! source provides one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use backend::{BackendKind, DispatchOptions, WorkerConfig};
use webhook::WebhookConfig;

/// Defaults supplied in one place.
pub const DEFAULT_MODEL: &str = "opencode/glm-4.7-free";
pub const DEFAULT_WORKER_IMAGE: &str = "squire-worker:latest";
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Raw shape of a config file; every key optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    github_token: Option<String>,
    model: Option<String>,
    tasks_dir: Option<PathBuf>,
    worker_image: Option<String>,
    skills_dir: Option<PathBuf>,
    max_concurrent: Option<usize>,
    auto_cleanup: Option<bool>,
    container_runtime: Option<String>,
    backend: Option<String>,
    webhook_secret: Option<String>,
    require_webhook_secret: Option<bool>,
    review_bot_users: Option<Vec<String>>,

    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct SquireConfig {
    pub github_token: Option<String>,
    pub model: String,
    pub tasks_dir: PathBuf,
    pub worker_image: String,
    /// Mounted read-only at `/skills` in workers when set.
    pub skills_dir: Option<PathBuf>,
    pub max_concurrent: usize,
    pub auto_cleanup: bool,
    /// Container runtime for sandboxing (e.g. `runsc`).
    pub container_runtime: Option<String>,
    pub backend: BackendKind,
    pub webhook_secret: Option<String>,
    pub require_webhook_secret: bool,
    pub review_bot_users: Vec<String>,
}

impl SquireConfig {
    /// Resolve from env and the first existing config file.
    pub async fn resolve() -> Self {
        let mut config = Self::from_env();
        if let Some(path) = first_existing_candidate() {
            match load_file(&path) {
                Ok(file) => config.apply_file(file, &path),
                Err(e) => warn!(path = %path.display(), error = %e, "could not load config file"),
            }
        }
        if config.github_token.is_none() {
            config.github_token = token_from_host_cli().await;
        }
        config
    }

    fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        Self {
            github_token: env("GITHUB_TOKEN").or_else(|| env("GH_TOKEN")),
            model: env("SQUIRE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            tasks_dir: env("SQUIRE_TASKS_DIR")
                .map_or_else(default_tasks_dir, PathBuf::from),
            worker_image: env("SQUIRE_WORKER_IMAGE")
                .unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string()),
            skills_dir: env("SQUIRE_SKILLS_DIR").map(PathBuf::from),
            max_concurrent: env("SQUIRE_MAX_CONCURRENT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            auto_cleanup: env("SQUIRE_AUTO_CLEANUP")
                .map_or(true, |v| v != "false" && v != "0"),
            container_runtime: env("SQUIRE_CONTAINER_RUNTIME"),
            backend: env("SQUIRE_BACKEND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(BackendKind::Container),
            webhook_secret: env("SQUIRE_WEBHOOK_SECRET"),
            require_webhook_secret: env("SQUIRE_REQUIRE_WEBHOOK_SECRET")
                .is_some_and(|v| v == "true" || v == "1"),
            review_bot_users: env("SQUIRE_REVIEW_BOTS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        }
    }

    fn apply_file(&mut self, file: ConfigFile, path: &Path) {
        for key in file.unknown.keys() {
            warn!(key, file = %path.display(), "ignoring unrecognized config key");
        }
        info!(file = %path.display(), "loaded squire config");

        if let Some(v) = file.github_token {
            self.github_token = Some(v);
        }
        if let Some(v) = file.model {
            self.model = v;
        }
        if let Some(v) = file.tasks_dir {
            self.tasks_dir = v;
        }
        if let Some(v) = file.worker_image {
            self.worker_image = v;
        }
        if let Some(v) = file.skills_dir {
            self.skills_dir = Some(v);
        }
        if let Some(v) = file.max_concurrent {
            self.max_concurrent = v;
        }
        if let Some(v) = file.auto_cleanup {
            self.auto_cleanup = v;
        }
        if let Some(v) = file.container_runtime {
            self.container_runtime = Some(v);
        }
        if let Some(v) = file.backend {
            match v.parse() {
                Ok(kind) => self.backend = kind,
                Err(e) => warn!(error = %e, "invalid backend in config file"),
            }
        }
        if let Some(v) = file.webhook_secret {
            self.webhook_secret = Some(v);
        }
        if let Some(v) = file.require_webhook_secret {
            self.require_webhook_secret = v;
        }
        if let Some(v) = file.review_bot_users {
            self.review_bot_users = v;
        }
    }

    /// Dispatch parameters for starting workers.
    #[must_use]
    pub fn dispatch_options(&self, verbose: bool) -> DispatchOptions {
        DispatchOptions {
            github_token: self.github_token.clone().unwrap_or_default(),
            model: self.model.clone(),
            image: self.worker_image.clone(),
            verbose,
            skills_dir: self.skills_dir.clone(),
            container_runtime: self.container_runtime.clone(),
            worker: WorkerConfig {
                auto_cleanup: self.auto_cleanup,
                ..WorkerConfig::default()
            },
        }
    }

    /// Ingress configuration for the webhook endpoint.
    #[must_use]
    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            secret: self.webhook_secret.clone(),
            require_secret: self.require_webhook_secret,
            review_bot_users: self.review_bot_users.clone(),
        }
    }
}

fn default_tasks_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".squire/tasks")
}

/// Candidate config files, in resolution order.
fn candidates() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("./squire.json")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".squire.json"));
        paths.push(home.join(".config/squire/config.json"));
    }
    paths
}

fn first_existing_candidate() -> Option<PathBuf> {
    candidates().into_iter().find(|p| p.exists())
}

fn load_file(path: &Path) -> anyhow::Result<ConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// `gh auth token`, when the host CLI is installed and logged in.
async fn token_from_host_cli() -> Option<String> {
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
