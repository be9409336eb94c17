//! LLM-guided task synthesis.
//!
//! One prompt per cycle: goals, one-line signal summaries, and snapshots
//! of recent task history. The model answers with a JSON array of proposed
//! tasks; fenced code blocks and a `{"tasks": [...]}` envelope are
//! tolerated, and an unparseable response degrades to an empty proposal
//! list rather than failing the cycle.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StewardError;
use crate::signals::Signal;
use crate::state::{StewardState, TaskRecordStatus};

/// Prompt length bounds for a proposed task.
const MIN_PROMPT_LEN: usize = 10;
const MAX_PROMPT_LEN: usize = 2000;
/// History shown to the model.
const RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// One task proposed by the analyzer.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposedTask {
    pub prompt: String,
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Target repository; validated against the allow-list at dispatch.
    #[serde(default)]
    pub repo: Option<String>,
}

pub struct Analyzer {
    http: reqwest::Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
}

impl Analyzer {
    #[must_use]
    pub fn new(model: &str, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Ask the model for new tasks. Transport failures propagate; a
    /// response we cannot parse yields an empty list.
    pub async fn analyze(
        &self,
        goals: &str,
        signals: &[Signal],
        state: &StewardState,
        store_tasks: &[store::Task],
    ) -> Result<Vec<ProposedTask>, StewardError> {
        let prompt = build_prompt(goals, signals, state, store_tasks);
        let content = self.chat(&prompt).await?;
        Ok(parse_tasks(&content))
    }

    async fn chat(&self, prompt: &str) -> Result<String, StewardError> {
        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [
                    {
                        "role": "system",
                        "content": "You are a software delivery planner. Respond with a JSON \
                                    array of tasks: [{\"prompt\": string, \"priority\": \
                                    \"high\"|\"medium\"|\"low\", \"depends_on\": [string], \
                                    \"repo\": string?}]. No prose.",
                    },
                    { "role": "user", "content": prompt },
                ],
            }));
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StewardError::Config(format!("LLM returned {status}")));
        }
        let body: Value = response.json().await?;
        Ok(body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

fn build_prompt(
    goals: &str,
    signals: &[Signal],
    state: &StewardState,
    store_tasks: &[store::Task],
) -> String {
    use std::fmt::Write as _;

    let mut prompt = String::new();
    let _ = writeln!(prompt, "## Goals\n{goals}");

    prompt.push_str("\n## Current signals\n");
    if signals.is_empty() {
        prompt.push_str("(none)\n");
    }
    for signal in signals {
        let _ = writeln!(prompt, "- {}", signal.summary());
    }

    prompt.push_str("\n## Active tasks\n");
    for record in state.active() {
        let _ = writeln!(prompt, "- [{}] {}", record.repo, record.prompt);
    }
    for task in store_tasks
        .iter()
        .filter(|t| matches!(t.status, store::TaskStatus::Pending | store::TaskStatus::Running))
    {
        let _ = writeln!(prompt, "- [{}] {}", task.repo, task.prompt);
    }

    prompt.push_str("\n## Recently completed\n");
    for record in state.recent(TaskRecordStatus::Completed, RECENT_LIMIT) {
        let _ = writeln!(prompt, "- [{}] {}", record.repo, record.prompt);
    }

    prompt.push_str("\n## Recently failed\n");
    for record in state.recent(TaskRecordStatus::Failed, RECENT_LIMIT) {
        let _ = writeln!(prompt, "- [{}] {}", record.repo, record.prompt);
    }

    prompt.push_str(
        "\nPropose the next coding tasks that advance the goals without \
         duplicating active or recently completed work. Respond with the \
         JSON array only.",
    );
    prompt
}

/// Parse the model's reply into validated proposals.
///
/// Tolerates ```json fences and a `{"tasks": [...]}` envelope. Elements
/// failing validation are dropped individually.
#[must_use]
pub fn parse_tasks(content: &str) -> Vec<ProposedTask> {
    let stripped = strip_fences(content);
    let Ok(value) = serde_json::from_str::<Value>(stripped) else {
        warn!("LLM response is not JSON, proposing nothing");
        return Vec::new();
    };

    let items = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("tasks").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => {
                warn!("LLM response object has no tasks array");
                return Vec::new();
            }
        },
        _ => {
            warn!("LLM response is neither array nor object");
            return Vec::new();
        }
    };

    let mut tasks = Vec::new();
    for item in items {
        match serde_json::from_value::<ProposedTask>(item) {
            Ok(task) => {
                let len = task.prompt.chars().count();
                if (MIN_PROMPT_LEN..=MAX_PROMPT_LEN).contains(&len) {
                    tasks.push(task);
                } else {
                    warn!(len, "dropping proposed task with out-of-bounds prompt");
                }
            }
            Err(e) => {
                debug!(error = %e, "dropping malformed proposed task");
            }
        }
    }
    tasks
}

/// Strip a Markdown code fence (with optional language tag) if present.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}
