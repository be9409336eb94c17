//! Proposal dispatch with global and per-repo caps.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use backend::{count_running, running_by_repo, DispatchOptions, WorkerBackend};
use store::{NewTask, TaskStore};

use crate::analyzer::ProposedTask;
use crate::config::StewardConfig;
use crate::error::StewardError;
use crate::state::StewardState;

/// One task actually sent to Squire this cycle.
#[derive(Debug, Clone)]
pub struct DispatchedTask {
    pub task_id: String,
    pub repo: String,
    pub prompt: String,
}

/// One proposal we declined, and why.
#[derive(Debug, Clone)]
pub struct SkippedTask {
    pub prompt: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub dispatched: Vec<DispatchedTask>,
    pub skipped: Vec<SkippedTask>,
}

/// Walk proposals in order and dispatch what fits under the caps.
///
/// Available global slots are `max_concurrent` minus the larger of
/// Steward's own active count and the backend's live worker count (the two
/// views can disagree right after a crash; the conservative one wins).
pub async fn dispatch_tasks(
    store: &TaskStore,
    backend_handle: Arc<dyn WorkerBackend>,
    state: &mut StewardState,
    proposed: Vec<ProposedTask>,
    config: &StewardConfig,
    options: &DispatchOptions,
    dry_run: bool,
) -> Result<DispatchReport, StewardError> {
    let mut report = DispatchReport::default();
    if proposed.is_empty() {
        return Ok(report);
    }

    let exec = &config.execution.squire;
    let backend_running = count_running(store, &backend_handle).await?;
    let active = state.active().len().max(backend_running);
    let mut slots = exec.max_concurrent.saturating_sub(active);
    info!(
        proposed = proposed.len(),
        active,
        slots,
        "dispatching proposed tasks"
    );

    let allowed = config.allowed_repos();
    let mut per_repo: HashMap<String, usize> = running_by_repo(&backend_handle).await?;
    for (repo, count) in state.active_by_repo() {
        let entry = per_repo.entry(repo).or_insert(0);
        *entry = (*entry).max(count);
    }

    for task in proposed {
        if slots == 0 {
            report.skipped.push(SkippedTask {
                prompt: task.prompt,
                reason: "no available slots".to_string(),
            });
            continue;
        }

        let repo = match resolve_repo(task.repo.as_deref(), &allowed, exec.default_repo.as_deref())
        {
            Some(repo) => repo,
            None => {
                report.skipped.push(SkippedTask {
                    prompt: task.prompt,
                    reason: "no repository to dispatch to".to_string(),
                });
                continue;
            }
        };

        if let Some(cap) = exec.max_per_repo {
            let current = per_repo.get(&repo).copied().unwrap_or(0);
            if current >= cap {
                report.skipped.push(SkippedTask {
                    prompt: task.prompt,
                    reason: format!("per-repo cap reached for {repo}"),
                });
                continue;
            }
        }

        if dry_run {
            info!(repo, prompt = %task.prompt, "dry run: would dispatch task");
            slots -= 1;
            *per_repo.entry(repo.clone()).or_insert(0) += 1;
            continue;
        }

        let created = store
            .create(NewTask {
                repo: repo.clone(),
                prompt: task.prompt.clone(),
                ..NewTask::default()
            })
            .await?;

        state.record_dispatched(&created.id, &repo, &task.prompt);
        if let Err(e) =
            backend::start_task(store, backend_handle.clone(), &created, options).await
        {
            warn!(task_id = %created.id, error = %e, "dispatched task failed to start");
        }

        slots -= 1;
        *per_repo.entry(repo.clone()).or_insert(0) += 1;
        report.dispatched.push(DispatchedTask {
            task_id: created.id,
            repo,
            prompt: task.prompt,
        });
    }

    Ok(report)
}

/// Validate a proposal's repo against the allow-list, falling back to the
/// default repo with a warning.
fn resolve_repo(
    proposed: Option<&str>,
    allowed: &[String],
    default_repo: Option<&str>,
) -> Option<String> {
    match proposed {
        Some(repo) if allowed.iter().any(|a| a == repo) => Some(repo.to_string()),
        Some(repo) => {
            warn!(
                repo,
                "proposed repo not in allow-list, falling back to default"
            );
            default_repo.map(ToString::to_string)
        }
        None => default_repo.map(ToString::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Priority;
    use backend::testing::MockBackend;
    use backend::WorkerConfig;
    use store::TaskStatus;

    fn proposal(prompt: &str, repo: Option<&str>) -> ProposedTask {
        ProposedTask {
            prompt: prompt.to_string(),
            priority: Priority::Medium,
            depends_on: Vec::new(),
            repo: repo.map(ToString::to_string),
        }
    }

    fn options() -> DispatchOptions {
        DispatchOptions {
            github_token: "ghp_test".to_string(),
            model: "opencode/glm-4.7-free".to_string(),
            image: "squire-worker:latest".to_string(),
            verbose: false,
            skills_dir: None,
            container_runtime: None,
            worker: WorkerConfig::default(),
        }
    }

    fn config_yaml(max_concurrent: usize, max_per_repo: Option<usize>) -> StewardConfig {
        let mut config: StewardConfig = serde_yaml::from_str(
            r#"
execution:
  squire:
    default_repo: owner/main
    repos: ["owner/extra"]
"#,
        )
        .unwrap();
        config.execution.squire.max_concurrent = max_concurrent;
        config.execution.squire.max_per_repo = max_per_repo;
        config
    }

    fn new_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join("tasks"));
        (dir, store)
    }

    #[tokio::test]
    async fn dispatches_into_store_and_state() {
        let (_dir, store) = new_store();
        let backend: Arc<dyn WorkerBackend> = Arc::new(MockBackend::new());
        let mut state = StewardState::default();

        let report = dispatch_tasks(
            &store,
            backend,
            &mut state,
            vec![proposal("Fix the flaky auth test", None)],
            &config_yaml(5, None),
            &options(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.dispatched[0].repo, "owner/main");
        assert_eq!(state.active().len(), 1);

        let task = store
            .get(&report.dispatched[0].task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn global_slots_bound_the_cycle() {
        let (_dir, store) = new_store();
        let backend: Arc<dyn WorkerBackend> = Arc::new(MockBackend::new());
        let mut state = StewardState::default();

        let report = dispatch_tasks(
            &store,
            backend,
            &mut state,
            vec![
                proposal("First proposed task", None),
                proposal("Second proposed task", None),
                proposal("Third proposed task", None),
            ],
            &config_yaml(2, None),
            &options(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.dispatched.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, "no available slots");
    }

    #[tokio::test]
    async fn per_repo_cap_skips_excess_tasks() {
        let (_dir, store) = new_store();
        let backend: Arc<dyn WorkerBackend> = Arc::new(MockBackend::new());
        let mut state = StewardState::default();

        let report = dispatch_tasks(
            &store,
            backend,
            &mut state,
            vec![
                proposal("Task one for the main repo", None),
                proposal("Task two for the main repo", None),
            ],
            &config_yaml(5, Some(1)),
            &options(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.dispatched.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("per-repo cap"));
    }

    #[tokio::test]
    async fn unknown_repo_falls_back_to_default() {
        let (_dir, store) = new_store();
        let backend: Arc<dyn WorkerBackend> = Arc::new(MockBackend::new());
        let mut state = StewardState::default();

        let report = dispatch_tasks(
            &store,
            backend,
            &mut state,
            vec![
                proposal("Use the extra repo please", Some("owner/extra")),
                proposal("Use a rogue repo please", Some("evil/repo")),
            ],
            &config_yaml(5, None),
            &options(),
            false,
        )
        .await
        .unwrap();

        assert_eq!(report.dispatched.len(), 2);
        assert_eq!(report.dispatched[0].repo, "owner/extra");
        assert_eq!(report.dispatched[1].repo, "owner/main");
    }

    #[tokio::test]
    async fn dry_run_creates_nothing() {
        let (_dir, store) = new_store();
        let backend: Arc<dyn WorkerBackend> = Arc::new(MockBackend::new());
        let mut state = StewardState::default();

        let report = dispatch_tasks(
            &store,
            backend,
            &mut state,
            vec![proposal("Would be dispatched", None)],
            &config_yaml(5, None),
            &options(),
            true,
        )
        .await
        .unwrap();

        assert!(report.dispatched.is_empty());
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(state.active().is_empty());
    }
}
