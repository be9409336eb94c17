//! Signal collection.
//!
//! Signals are external observations the analyzer reasons over: open PRs,
//! failed CI runs, open issues, bot reviews (all from the repo host's REST
//! API), and JSON files dropped by other systems.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::SignalsConfig;
use crate::error::StewardError;
use crate::review::parse_confidence;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "squire-steward/0.3";
/// Per-repo fetch bound; a cycle reasons over recent activity, not history.
const PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Github,
    Analytics,
    File,
}

/// One external observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub source: SignalSource,
    #[serde(rename = "type")]
    pub signal_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// Normalized 0–5, present on review signals that carried a score.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_confidence: Option<u8>,
}

impl Signal {
    fn github(signal_type: &str, data: Value) -> Self {
        Self {
            source: SignalSource::Github,
            signal_type: signal_type.to_string(),
            data,
            timestamp: Utc::now(),
            review_confidence: None,
        }
    }

    /// One line for the analyzer prompt.
    #[must_use]
    pub fn summary(&self) -> String {
        let repo = self.data.get("repo").and_then(Value::as_str).unwrap_or("?");
        match self.signal_type.as_str() {
            "open_pr" => format!(
                "open PR {}#{}: {}",
                repo,
                self.data.get("number").and_then(Value::as_u64).unwrap_or(0),
                self.data.get("title").and_then(Value::as_str).unwrap_or("")
            ),
            "ci_failure" => format!(
                "failed CI run in {}: {} on {}",
                repo,
                self.data.get("name").and_then(Value::as_str).unwrap_or("?"),
                self.data.get("branch").and_then(Value::as_str).unwrap_or("?")
            ),
            "open_issue" => format!(
                "open issue {}#{}: {}",
                repo,
                self.data.get("number").and_then(Value::as_u64).unwrap_or(0),
                self.data.get("title").and_then(Value::as_str).unwrap_or("")
            ),
            "bot_review" => format!(
                "bot review on {}#{} by {} (confidence {})",
                repo,
                self.data.get("pr_number").and_then(Value::as_u64).unwrap_or(0),
                self.data.get("reviewer").and_then(Value::as_str).unwrap_or("?"),
                self.review_confidence
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string()),
            ),
            other => format!("{other} signal from {:?}", self.source),
        }
    }
}

/// Collects signals from the repo host and from file drops.
pub struct SignalCollector {
    http: reqwest::Client,
    token: Option<String>,
    base_url: String,
}

impl SignalCollector {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            base_url: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Point at a different API host (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Run the configured collection pass. Individual fetch failures are
    /// logged and skipped; a cycle proceeds on whatever arrived.
    pub async fn collect(&self, config: &SignalsConfig) -> Vec<Signal> {
        let mut signals = Vec::new();
        let watch = &config.github.watch;

        for repo in &config.github.repos {
            if watch.pull_requests || watch.reviews {
                let prs = self.fetch_open_prs(repo).await.unwrap_or_else(|e| {
                    warn!(repo, error = %e, "could not fetch open PRs");
                    Vec::new()
                });
                for pr in &prs {
                    if watch.pull_requests {
                        signals.push(Signal::github("open_pr", pr.clone()));
                    }
                    if watch.reviews {
                        if let Some(number) = pr.get("number").and_then(Value::as_u64) {
                            signals.extend(self.fetch_bot_reviews(repo, number).await);
                        }
                    }
                }
            }
            if watch.ci_failures {
                match self.fetch_failed_runs(repo).await {
                    Ok(mut runs) => signals.append(&mut runs),
                    Err(e) => warn!(repo, error = %e, "could not fetch failed CI runs"),
                }
            }
            if watch.issues {
                match self.fetch_open_issues(repo).await {
                    Ok(mut issues) => signals.append(&mut issues),
                    Err(e) => warn!(repo, error = %e, "could not fetch open issues"),
                }
            }
        }

        for path in &config.files {
            match read_file_signals(path) {
                Ok(mut file_signals) => signals.append(&mut file_signals),
                Err(e) => warn!(path = %path.display(), error = %e, "could not read signal file"),
            }
        }

        debug!(count = signals.len(), "collected signals");
        signals
    }

    async fn get(&self, path: &str) -> Result<Value, StewardError> {
        let mut request = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", USER_AGENT);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StewardError::Config(format!(
                "repo host returned {status} for {path}"
            )));
        }
        Ok(response.json().await?)
    }

    async fn fetch_open_prs(&self, repo: &str) -> Result<Vec<Value>, StewardError> {
        let body = self
            .get(&format!("/repos/{repo}/pulls?state=open&per_page={PAGE_SIZE}"))
            .await?;
        let prs = body.as_array().cloned().unwrap_or_default();
        Ok(prs
            .iter()
            .map(|pr| {
                json!({
                    "repo": repo,
                    "number": pr.get("number"),
                    "title": pr.get("title"),
                    "url": pr.get("html_url"),
                    "branch": pr.pointer("/head/ref"),
                    "draft": pr.get("draft"),
                })
            })
            .collect())
    }

    async fn fetch_failed_runs(&self, repo: &str) -> Result<Vec<Signal>, StewardError> {
        let body = self
            .get(&format!(
                "/repos/{repo}/actions/runs?status=failure&per_page={PAGE_SIZE}"
            ))
            .await?;
        let runs = body
            .get("workflow_runs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(runs
            .iter()
            .map(|run| {
                Signal::github(
                    "ci_failure",
                    json!({
                        "repo": repo,
                        "name": run.get("name"),
                        "branch": run.get("head_branch"),
                        "url": run.get("html_url"),
                        "run_id": run.get("id"),
                    }),
                )
            })
            .collect())
    }

    async fn fetch_open_issues(&self, repo: &str) -> Result<Vec<Signal>, StewardError> {
        let body = self
            .get(&format!("/repos/{repo}/issues?state=open&per_page={PAGE_SIZE}"))
            .await?;
        let issues = body.as_array().cloned().unwrap_or_default();
        Ok(issues
            .iter()
            // The issues endpoint also returns PRs; skip those.
            .filter(|issue| issue.get("pull_request").is_none())
            .map(|issue| {
                Signal::github(
                    "open_issue",
                    json!({
                        "repo": repo,
                        "number": issue.get("number"),
                        "title": issue.get("title"),
                        "url": issue.get("html_url"),
                        "labels": issue.pointer("/labels"),
                    }),
                )
            })
            .collect())
    }

    async fn fetch_bot_reviews(&self, repo: &str, pr_number: u64) -> Vec<Signal> {
        let body = match self
            .get(&format!("/repos/{repo}/pulls/{pr_number}/reviews"))
            .await
        {
            Ok(body) => body,
            Err(e) => {
                warn!(repo, pr_number, error = %e, "could not fetch reviews");
                return Vec::new();
            }
        };
        let reviews = body.as_array().cloned().unwrap_or_default();
        reviews
            .iter()
            .filter_map(|review| {
                let review_body = review.get("body").and_then(Value::as_str)?;
                let reviewer = review.pointer("/user/login").and_then(Value::as_str)?;
                // Bot reviews are recognizable by their [bot] suffix or by
                // carrying a structured confidence score.
                let confidence = parse_confidence(review_body);
                if !reviewer.ends_with("[bot]") && confidence.is_none() {
                    return None;
                }
                let mut signal = Signal::github(
                    "bot_review",
                    json!({
                        "repo": repo,
                        "pr_number": pr_number,
                        "reviewer": reviewer,
                        "state": review.get("state"),
                        "body": review_body,
                    }),
                );
                signal.review_confidence = confidence;
                Some(signal)
            })
            .collect()
    }
}

/// Read a JSON file holding an array of signal-shaped documents.
fn read_file_signals(path: &Path) -> Result<Vec<Signal>, StewardError> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)?;
    let items = value.as_array().cloned().unwrap_or_else(|| vec![value]);
    Ok(items
        .into_iter()
        .map(|data| Signal {
            source: SignalSource::File,
            signal_type: data
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("file")
                .to_string(),
            data,
            timestamp: Utc::now(),
            review_confidence: None,
        })
        .collect())
}
