//! Docker container backend.
//!
//! Workers run as labeled containers against the host container daemon.
//! Containers are not auto-removed on exit, so `logs` stays readable until
//! an explicit `remove`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::naming::container_name;
use crate::types::{
    BackendError, BackendResult, StartRequest, WorkerBackend, WorkerTaskInfo, ANNOTATION_REPO,
    LABEL_MANAGED_BY, LABEL_RETRY_COUNT, LABEL_TASK_ID, MANAGED_BY_VALUE,
};

/// Supervisor poll cadence for container workers.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period handed to `docker stop`.
const STOP_TIMEOUT_SECS: i64 = 10;
/// Connection timeout for socket candidates.
const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect to the first reachable daemon socket.
    ///
    /// `DOCKER_HOST` wins when set; otherwise the usual socket locations
    /// are probed in order (system docker, rootless docker, Docker
    /// Desktop, colima, podman).
    pub async fn connect() -> BackendResult<Self> {
        if std::env::var_os("DOCKER_HOST").is_some() {
            let docker = Docker::connect_with_defaults()?;
            docker.ping().await?;
            debug!("connected to container daemon via DOCKER_HOST");
            return Ok(Self { docker });
        }

        let mut last_error: Option<bollard::errors::Error> = None;
        for candidate in socket_candidates() {
            if !candidate.exists() {
                continue;
            }
            let address = format!("unix://{}", candidate.display());
            match Docker::connect_with_unix(&address, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION) {
                Ok(docker) => match docker.ping().await {
                    Ok(_) => {
                        info!(socket = %candidate.display(), "connected to container daemon");
                        return Ok(Self { docker });
                    }
                    Err(e) => {
                        debug!(socket = %candidate.display(), error = %e, "daemon not responding");
                        last_error = Some(e);
                    }
                },
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.map_or_else(
            || BackendError::Config("no container daemon socket found".to_string()),
            BackendError::Docker,
        ))
    }

    #[must_use]
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn worker_labels(request: &StartRequest) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_TASK_ID.to_string(), request.task.id.clone()),
            (ANNOTATION_REPO.to_string(), request.task.repo.clone()),
            (
                LABEL_RETRY_COUNT.to_string(),
                request.task.retry_count.to_string(),
            ),
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    fn worker_env(request: &StartRequest) -> Vec<String> {
        let task = &request.task;
        let mut env = vec![
            format!("SQUIRE_TASK_ID={}", task.id),
            format!("SQUIRE_REPO={}", task.repo),
            format!("SQUIRE_PROMPT={}", task.prompt),
            format!("SQUIRE_MODEL={}", request.model),
            // The worker accepts either convention.
            format!("GITHUB_TOKEN={}", request.github_token),
            format!("GH_TOKEN={}", request.github_token),
        ];
        if let Some(branch) = &task.branch {
            env.push(format!("SQUIRE_BRANCH={branch}"));
        }
        if let Some(base) = &task.base_branch {
            env.push(format!("SQUIRE_BASE_BRANCH={base}"));
        }
        if request.verbose {
            env.push("SQUIRE_VERBOSE=1".to_string());
        }
        env
    }

    fn host_config(request: &StartRequest) -> HostConfig {
        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (request.config.cpu_limit * 1e9) as i64;
        #[allow(clippy::cast_possible_wrap)]
        let memory = (request.config.memory_limit_mb * 1024 * 1024) as i64;

        let binds = request
            .skills_dir
            .as_ref()
            .map(|dir| vec![format!("{}:/skills:ro", dir.display())]);

        HostConfig {
            memory: Some(memory),
            nano_cpus: Some(nano_cpus),
            runtime: request.container_runtime.clone(),
            binds,
            ..Default::default()
        }
    }
}

#[async_trait]
impl WorkerBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn poll_interval(&self) -> Duration {
        POLL_INTERVAL
    }

    async fn start(&self, request: &StartRequest) -> BackendResult<String> {
        let name = container_name(&request.task.id, request.task.retry_count);
        let config = Config {
            image: Some(request.image.clone()),
            env: Some(Self::worker_env(request)),
            labels: Some(Self::worker_labels(request)),
            host_config: Some(Self::host_config(request)),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // A container that never started is useless; clean it up so a
            // retry can reuse the name.
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(e.into());
        }

        info!(
            task_id = %request.task.id,
            container = %crate::types::worker_id_prefix(&created.id),
            image = %request.image,
            "started worker container"
        );
        Ok(created.id)
    }

    async fn logs(&self, worker_id: &str, tail: Option<usize>) -> BackendResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.logs(worker_id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk?.to_string());
        }
        Ok(output)
    }

    async fn is_running(&self, worker_id: &str) -> BackendResult<bool> {
        let inspect = self.docker.inspect_container(worker_id, None).await?;
        Ok(inspect.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn exit_code(&self, worker_id: &str) -> BackendResult<Option<i64>> {
        let inspect = self.docker.inspect_container(worker_id, None).await?;
        let Some(state) = inspect.state else {
            return Ok(None);
        };
        if state.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(state.exit_code)
    }

    async fn stop(&self, worker_id: &str) -> BackendResult<()> {
        match self
            .docker
            .stop_container(worker_id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped is success for our purposes.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, worker_id: &str) -> BackendResult<()> {
        match self
            .docker
            .remove_container(
                worker_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> BackendResult<Vec<WorkerTaskInfo>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}")],
        )]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut infos = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(worker_id) = summary.id else {
                continue;
            };
            let labels = summary.labels.unwrap_or_default();
            let Some(task_id) = labels.get(LABEL_TASK_ID).cloned() else {
                warn!(
                    container = %crate::types::worker_id_prefix(&worker_id),
                    "managed container missing task-id label"
                );
                continue;
            };

            let running = summary.state.as_deref() == Some("running");
            let exit_code = if running {
                None
            } else {
                self.exit_code(&worker_id).await.unwrap_or(None)
            };

            infos.push(WorkerTaskInfo {
                task_id,
                worker_id,
                running,
                exit_code,
                repo: labels.get(ANNOTATION_REPO).cloned().unwrap_or_default(),
                retry_count: labels
                    .get(LABEL_RETRY_COUNT)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                created_at: summary.created.and_then(|secs| {
                    DateTime::<Utc>::from_timestamp(secs, 0)
                }),
            });
        }
        Ok(infos)
    }
}

fn socket_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        candidates.push(PathBuf::from(&runtime_dir).join("docker.sock"));
        candidates.push(PathBuf::from(&runtime_dir).join("podman/podman.sock"));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(&home).join(".docker/run/docker.sock"));
        candidates.push(PathBuf::from(&home).join(".colima/default/docker.sock"));
    }
    candidates.push(PathBuf::from("/var/run/docker.sock"));
    candidates.push(PathBuf::from("/run/podman/podman.sock"));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::{NewTask, Task};

    fn request() -> StartRequest {
        StartRequest {
            task: Task::create(NewTask {
                repo: "owner/r".to_string(),
                prompt: "Fix bug".to_string(),
                ..NewTask::default()
            }),
            github_token: "ghp_test".to_string(),
            model: "opencode/glm-4.7-free".to_string(),
            image: "squire-worker:latest".to_string(),
            verbose: false,
            skills_dir: Some(PathBuf::from("/opt/skills")),
            container_runtime: Some("runsc".to_string()),
            config: crate::types::WorkerConfig::default(),
        }
    }

    #[test]
    fn env_carries_both_token_names() {
        let env = DockerBackend::worker_env(&request());
        assert!(env.iter().any(|e| e == "GITHUB_TOKEN=ghp_test"));
        assert!(env.iter().any(|e| e == "GH_TOKEN=ghp_test"));
        assert!(env.iter().any(|e| e.starts_with("SQUIRE_BRANCH=squire/")));
        assert!(env.iter().any(|e| e == "SQUIRE_BASE_BRANCH=main"));
    }

    #[test]
    fn labels_mark_managed_workers() {
        let req = request();
        let labels = DockerBackend::worker_labels(&req);
        assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some("squire"));
        assert_eq!(labels.get(LABEL_TASK_ID), Some(&req.task.id));
        assert_eq!(labels.get(ANNOTATION_REPO).map(String::as_str), Some("owner/r"));
        assert_eq!(labels.get(LABEL_RETRY_COUNT).map(String::as_str), Some("0"));
    }

    #[test]
    fn host_config_applies_resource_limits() {
        let hc = DockerBackend::host_config(&request());
        assert_eq!(hc.memory, Some(4096 * 1024 * 1024));
        assert_eq!(hc.nano_cpus, Some(2_000_000_000));
        assert_eq!(hc.runtime.as_deref(), Some("runsc"));
        assert_eq!(
            hc.binds,
            Some(vec!["/opt/skills:/skills:ro".to_string()])
        );
    }
}
