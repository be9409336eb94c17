//! Confidence-gated auto-merge.
//!
//! Review signals at or above the configured confidence threshold get
//! their PR merged through the host CLI. Same-PR signals are deduplicated
//! so one PR is only attempted once per cycle.

use std::collections::BTreeSet;

use serde_json::Value;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::AutoMergeConfig;
use crate::signals::Signal;

/// Result of one merge attempt.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub repo: String,
    pub pr_number: u64,
    pub merged: bool,
    pub detail: String,
}

/// Candidate PRs: unique `(repo, pr_number)` with confidence ≥ threshold.
#[must_use]
pub fn merge_candidates(signals: &[Signal], min_confidence: u8) -> Vec<(String, u64)> {
    let mut seen = BTreeSet::new();
    let mut candidates = Vec::new();
    for signal in signals {
        let Some(confidence) = signal.review_confidence else {
            continue;
        };
        if confidence < min_confidence {
            continue;
        }
        let Some(repo) = signal.data.get("repo").and_then(Value::as_str) else {
            continue;
        };
        let Some(pr_number) = signal.data.get("pr_number").and_then(Value::as_u64) else {
            continue;
        };
        if seen.insert((repo.to_string(), pr_number)) {
            candidates.push((repo.to_string(), pr_number));
        }
    }
    candidates
}

/// Attempt to merge every candidate via the `gh` CLI.
pub async fn auto_merge(
    signals: &[Signal],
    config: &AutoMergeConfig,
    dry_run: bool,
) -> Vec<MergeOutcome> {
    if !config.enabled {
        return Vec::new();
    }

    let mut outcomes = Vec::new();
    for (repo, pr_number) in merge_candidates(signals, config.min_confidence) {
        if dry_run {
            info!(repo, pr_number, "dry run: would merge PR");
            outcomes.push(MergeOutcome {
                repo,
                pr_number,
                merged: false,
                detail: "dry run".to_string(),
            });
            continue;
        }
        outcomes.push(merge_pr(&repo, pr_number).await);
    }
    outcomes
}

async fn merge_pr(repo: &str, pr_number: u64) -> MergeOutcome {
    let output = Command::new("gh")
        .args([
            "pr",
            "merge",
            &pr_number.to_string(),
            "--repo",
            repo,
            "--squash",
        ])
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            info!(repo, pr_number, "merged PR");
            MergeOutcome {
                repo: repo.to_string(),
                pr_number,
                merged: true,
                detail: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(repo, pr_number, error = %stderr, "merge failed");
            MergeOutcome {
                repo: repo.to_string(),
                pr_number,
                merged: false,
                detail: stderr,
            }
        }
        Err(e) => {
            warn!(repo, pr_number, error = %e, "could not run gh");
            MergeOutcome {
                repo: repo.to_string(),
                pr_number,
                merged: false,
                detail: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalSource;
    use chrono::Utc;
    use serde_json::json;

    fn review_signal(repo: &str, pr_number: u64, confidence: Option<u8>) -> Signal {
        Signal {
            source: SignalSource::Github,
            signal_type: "bot_review".to_string(),
            data: json!({ "repo": repo, "pr_number": pr_number }),
            timestamp: Utc::now(),
            review_confidence: confidence,
        }
    }

    #[test]
    fn candidates_filter_on_confidence() {
        let signals = vec![
            review_signal("owner/r", 1, Some(5)),
            review_signal("owner/r", 2, Some(4)),
            review_signal("owner/r", 3, None),
        ];
        let candidates = merge_candidates(&signals, 5);
        assert_eq!(candidates, vec![("owner/r".to_string(), 1)]);

        let relaxed = merge_candidates(&signals, 4);
        assert_eq!(relaxed.len(), 2);
    }

    #[test]
    fn same_pr_signals_are_deduplicated() {
        let signals = vec![
            review_signal("owner/r", 1, Some(5)),
            review_signal("owner/r", 1, Some(5)),
            review_signal("owner/other", 1, Some(5)),
        ];
        let candidates = merge_candidates(&signals, 5);
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn disabled_config_merges_nothing() {
        let signals = vec![review_signal("owner/r", 1, Some(5))];
        let outcomes = auto_merge(
            &signals,
            &AutoMergeConfig {
                enabled: false,
                min_confidence: 5,
            },
            false,
        )
        .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn dry_run_records_without_merging() {
        let signals = vec![review_signal("owner/r", 1, Some(5))];
        let outcomes = auto_merge(
            &signals,
            &AutoMergeConfig {
                enabled: true,
                min_confidence: 5,
            },
            true,
        )
        .await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].merged);
        assert_eq!(outcomes[0].detail, "dry run");
    }
}
