//! Steward configuration.
//!
//! Resolved from `STEWARD_CONFIG_PATH`, else `./steward.yaml`, else
//! `/config/steward.yaml`. Unrecognized keys are ignored but logged so a
//! typo in the file does not silently disable a feature.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;
use tracing::{info, warn};

use crate::error::StewardError;

/// Fallback config locations, in resolution order.
const CONFIG_CANDIDATES: &[&str] = &["./steward.yaml", "/config/steward.yaml"];

/// One goal source: inline text or a file to read.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GoalSource {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Which signal classes to watch per repository.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub pull_requests: bool,
    pub ci_failures: bool,
    pub issues: bool,
    pub reviews: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            pull_requests: true,
            ci_failures: true,
            issues: true,
            reviews: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GithubSignals {
    pub repos: Vec<String>,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SignalsConfig {
    pub github: GithubSignals,
    /// JSON files dropped by other systems; each holds a signal array.
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SquireExecution {
    pub default_repo: Option<String>,
    pub repos: Vec<String>,
    pub model: Option<String>,
    pub max_concurrent: usize,
    pub max_per_repo: Option<usize>,
}

impl Default for SquireExecution {
    fn default() -> Self {
        Self {
            default_repo: None,
            repos: Vec::new(),
            model: None,
            max_concurrent: 5,
            max_per_repo: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker backend kind (`container` or `cluster`).
    pub backend: Option<String>,
    pub squire: SquireExecution,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoMergeConfig {
    pub enabled: bool,
    /// Minimum normalized review confidence (0–5).
    pub min_confidence: u8,
}

impl Default for AutoMergeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    /// OpenAI-compatible chat-completions endpoint.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "opencode/glm-4.7-free".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cycle interval, e.g. `30m`, `1h`, or plain seconds.
    pub interval: Option<String>,
    /// `HH:MM-HH:MM` window during which no cycles run.
    pub quiet_hours: Option<String>,
    /// IANA timezone name for the quiet-hours window.
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StewardConfig {
    pub goals: Vec<GoalSource>,
    pub signals: SignalsConfig,
    pub execution: ExecutionConfig,
    pub auto_merge: AutoMergeConfig,
    pub llm: LlmConfig,
    pub schedule: ScheduleConfig,

    /// Anything we do not recognize; logged at load time.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

impl StewardConfig {
    /// Load from the standard candidate locations.
    pub fn load() -> Result<Self, StewardError> {
        if let Ok(path) = std::env::var("STEWARD_CONFIG_PATH") {
            return Self::from_file(Path::new(&path));
        }
        for candidate in CONFIG_CANDIDATES {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::from_file(path);
            }
        }
        info!("no steward config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, StewardError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StewardError::Config(format!("could not read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&content)?;
        for key in config.unknown.keys() {
            warn!(key, file = %path.display(), "ignoring unrecognized config key");
        }
        info!(file = %path.display(), "loaded steward config");
        Ok(config)
    }

    /// Concatenate all goal sources into one text block.
    pub fn goals_text(&self) -> String {
        let mut out = String::new();
        for goal in &self.goals {
            if let Some(text) = &goal.text {
                out.push_str(text);
                out.push('\n');
            }
            if let Some(path) = &goal.path {
                match std::fs::read_to_string(path) {
                    Ok(content) => {
                        out.push_str(&content);
                        out.push('\n');
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "could not read goals file");
                    }
                }
            }
        }
        out
    }

    /// Repositories a proposed task may target: default repo, configured
    /// repos, and watched repos.
    #[must_use]
    pub fn allowed_repos(&self) -> Vec<String> {
        let mut repos = Vec::new();
        if let Some(default) = &self.execution.squire.default_repo {
            repos.push(default.clone());
        }
        for repo in &self.execution.squire.repos {
            if !repos.contains(repo) {
                repos.push(repo.clone());
            }
        }
        for repo in &self.signals.github.repos {
            if !repos.contains(repo) {
                repos.push(repo.clone());
            }
        }
        repos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_round_trips() {
        let yaml = r#"
goals:
  - text: "Keep CI green"
  - path: /etc/steward/goals.md
signals:
  github:
    repos: ["owner/a", "owner/b"]
    watch:
      pull_requests: true
      ci_failures: true
      issues: false
      reviews: true
execution:
  backend: container
  squire:
    default_repo: owner/a
    repos: ["owner/c"]
    model: opencode/glm-4.7-free
    max_concurrent: 3
    max_per_repo: 2
auto_merge:
  enabled: true
  min_confidence: 4
llm:
  model: opencode/glm-4.7-free
schedule:
  interval: 30m
  quiet_hours: "22:00-06:00"
  timezone: America/New_York
"#;
        let config: StewardConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.signals.github.repos.len(), 2);
        assert!(!config.signals.github.watch.issues);
        assert_eq!(config.execution.squire.max_concurrent, 3);
        assert_eq!(config.execution.squire.max_per_repo, Some(2));
        assert!(config.auto_merge.enabled);
        assert_eq!(config.auto_merge.min_confidence, 4);
        assert_eq!(config.schedule.interval.as_deref(), Some("30m"));
        assert!(config.unknown.is_empty());
    }

    #[test]
    fn unknown_keys_are_collected_not_fatal() {
        let yaml = r"
goals: []
surprises:
  nested: true
";
        let config: StewardConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.unknown.contains_key("surprises"));
    }

    #[test]
    fn defaults_are_sane() {
        let config = StewardConfig::default();
        assert_eq!(config.execution.squire.max_concurrent, 5);
        assert_eq!(config.auto_merge.min_confidence, 5);
        assert!(!config.auto_merge.enabled);
        assert_eq!(config.llm.model, "opencode/glm-4.7-free");
        assert!(config.signals.github.watch.pull_requests);
    }

    #[test]
    fn allowed_repos_union_without_duplicates() {
        let yaml = r#"
signals:
  github:
    repos: ["owner/a", "owner/b"]
execution:
  squire:
    default_repo: owner/a
    repos: ["owner/c"]
"#;
        let config: StewardConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.allowed_repos(),
            vec!["owner/a", "owner/c", "owner/b"]
        );
    }
}
