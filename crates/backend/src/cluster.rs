//! Kubernetes batch-Job backend.
//!
//! Workers run as Jobs with `backoffLimit: 0` and a TTL so the scheduler
//! garbage-collects terminal jobs; `remove` therefore delegates to `stop`.
//! The repo-host token is never embedded in the Job spec — both token
//! variables reference a pre-provisioned secret.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::naming::cluster_job_name;
use crate::types::{
    BackendError, BackendResult, StartRequest, WorkerBackend, WorkerTaskInfo, ANNOTATION_REPO,
    LABEL_MANAGED_BY, LABEL_RETRY_COUNT, LABEL_TASK_ID, MANAGED_BY_VALUE,
};

/// Supervisor poll cadence for cluster workers.
const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Terminal jobs are garbage-collected by the scheduler after this long.
const TTL_SECONDS_AFTER_FINISHED: i64 = 3600;
/// Pre-provisioned secret holding the repo-host token.
const TOKEN_SECRET_NAME: &str = "squire-github-token";
const TOKEN_SECRET_KEY: &str = "token";
/// Name of the agent container inside the worker pod.
const WORKER_CONTAINER: &str = "worker";

pub struct ClusterBackend {
    jobs: Api<Job>,
    pods: Api<Pod>,
}

impl ClusterBackend {
    /// Connect using the ambient kubeconfig / in-cluster credentials.
    pub async fn connect(namespace: Option<String>) -> BackendResult<Self> {
        let client = Client::try_default().await?;
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        info!(namespace = %namespace, "using cluster backend");
        Ok(Self::from_client(client, &namespace))
    }

    #[must_use]
    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self {
            jobs: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
        }
    }

    fn build_job(request: &StartRequest, job_name: &str) -> BackendResult<Job> {
        let task = &request.task;
        let labels = json!({
            LABEL_TASK_ID: task.id,
            LABEL_RETRY_COUNT: task.retry_count.to_string(),
            LABEL_MANAGED_BY: MANAGED_BY_VALUE,
        });

        let mut env = vec![
            json!({ "name": "SQUIRE_TASK_ID", "value": task.id }),
            json!({ "name": "SQUIRE_REPO", "value": task.repo }),
            json!({ "name": "SQUIRE_PROMPT", "value": task.prompt }),
            json!({ "name": "SQUIRE_MODEL", "value": request.model }),
        ];
        if let Some(branch) = &task.branch {
            env.push(json!({ "name": "SQUIRE_BRANCH", "value": branch }));
        }
        if let Some(base) = &task.base_branch {
            env.push(json!({ "name": "SQUIRE_BASE_BRANCH", "value": base }));
        }
        if request.verbose {
            env.push(json!({ "name": "SQUIRE_VERBOSE", "value": "1" }));
        }
        // Token comes from the pre-provisioned secret, under both names the
        // worker understands.
        for name in ["GITHUB_TOKEN", "GH_TOKEN"] {
            env.push(json!({
                "name": name,
                "valueFrom": {
                    "secretKeyRef": {
                        "name": TOKEN_SECRET_NAME,
                        "key": TOKEN_SECRET_KEY,
                    }
                }
            }));
        }

        let limit_cpu = format_cpu(request.config.cpu_limit);
        let request_cpu = format_cpu(request.config.cpu_limit / 4.0);
        let limit_memory = format!("{}Mi", request.config.memory_limit_mb);
        let request_memory = format!("{}Mi", request.config.memory_limit_mb / 4);

        let mut container = json!({
            "name": WORKER_CONTAINER,
            "image": request.image,
            "env": env,
            "resources": {
                "limits": { "cpu": limit_cpu, "memory": limit_memory },
                "requests": { "cpu": request_cpu, "memory": request_memory },
            },
        });
        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "containers": [],
        });
        if let Some(skills) = &request.skills_dir {
            container["volumeMounts"] = json!([
                { "name": "skills", "mountPath": "/skills", "readOnly": true }
            ]);
            pod_spec["volumes"] = json!([
                { "name": "skills", "hostPath": { "path": skills.display().to_string() } }
            ]);
        }
        if let Some(runtime_class) = &request.container_runtime {
            pod_spec["runtimeClassName"] = json!(runtime_class);
        }
        pod_spec["containers"] = json!([container]);

        #[allow(clippy::cast_possible_wrap)]
        let active_deadline = (request.config.timeout_minutes * 60) as i64;
        let job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job_name,
                "labels": labels.clone(),
                "annotations": { ANNOTATION_REPO: task.repo },
            },
            "spec": {
                "backoffLimit": 0,
                "activeDeadlineSeconds": active_deadline,
                "ttlSecondsAfterFinished": TTL_SECONDS_AFTER_FINISHED,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": pod_spec,
                },
            },
        });

        serde_json::from_value(job)
            .map_err(|e| BackendError::Other(format!("invalid job spec: {e}")))
    }

    /// `(active, succeeded, failed)` counters for a job.
    async fn job_counters(&self, job_name: &str) -> BackendResult<(i32, i32, i32)> {
        let job = self.jobs.get(job_name).await.map_err(not_found(job_name))?;
        Ok(counters_of(&job))
    }

    /// Best-effort exit code of the terminated worker container.
    async fn terminated_exit_code(&self, job_name: &str) -> Option<i64> {
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        let pods = self.pods.list(&params).await.ok()?;
        for pod in pods {
            let Some(statuses) = pod.status.and_then(|s| s.container_statuses) else {
                continue;
            };
            for status in statuses {
                if status.name != WORKER_CONTAINER {
                    continue;
                }
                if let Some(terminated) = status.state.and_then(|s| s.terminated) {
                    return Some(i64::from(terminated.exit_code));
                }
            }
        }
        None
    }
}

#[async_trait]
impl WorkerBackend for ClusterBackend {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn poll_interval(&self) -> Duration {
        POLL_INTERVAL
    }

    async fn start(&self, request: &StartRequest) -> BackendResult<String> {
        let job_name = cluster_job_name(&request.task.id);
        let job = Self::build_job(request, &job_name)?;

        match self.jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(task_id = %request.task.id, job = %job_name, "created worker job");
                Ok(job_name)
            }
            // Already created by a previous attempt; adopt it.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(job = %job_name, "worker job already exists, adopting");
                Ok(job_name)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn logs(&self, worker_id: &str, tail: Option<usize>) -> BackendResult<String> {
        let params = ListParams::default().labels(&format!("job-name={worker_id}"));
        let pods = self.pods.list(&params).await?;

        let mut output = String::new();
        for pod in pods {
            let Some(pod_name) = pod.metadata.name else {
                continue;
            };
            let log_params = LogParams {
                container: Some(WORKER_CONTAINER.to_string()),
                tail_lines: tail.map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
                ..Default::default()
            };
            match self.pods.logs(&pod_name, &log_params).await {
                Ok(text) => output.push_str(&text),
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "could not read worker pod logs");
                }
            }
        }
        Ok(output)
    }

    async fn is_running(&self, worker_id: &str) -> BackendResult<bool> {
        let (active, succeeded, failed) = self.job_counters(worker_id).await?;
        Ok(active > 0 && succeeded == 0 && failed == 0)
    }

    async fn exit_code(&self, worker_id: &str) -> BackendResult<Option<i64>> {
        let (_active, succeeded, failed) = self.job_counters(worker_id).await?;
        if succeeded > 0 {
            return Ok(Some(0));
        }
        if failed > 0 {
            return Ok(Some(self.terminated_exit_code(worker_id).await.unwrap_or(1)));
        }
        // Still active, or no counters yet (just created): no exit code.
        Ok(None)
    }

    async fn stop(&self, worker_id: &str) -> BackendResult<()> {
        match self
            .jobs
            .delete(worker_id, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, worker_id: &str) -> BackendResult<()> {
        // The scheduler's TTL garbage-collects terminal jobs; explicit
        // removal is the same delete as stop.
        self.stop(worker_id).await
    }

    async fn list(&self) -> BackendResult<Vec<WorkerTaskInfo>> {
        let params =
            ListParams::default().labels(&format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}"));
        let jobs = self.jobs.list(&params).await?;

        let mut infos = Vec::new();
        for job in jobs {
            let Some(job_name) = job.metadata.name.clone() else {
                continue;
            };
            let labels = job.metadata.labels.clone().unwrap_or_default();
            let Some(task_id) = labels.get(LABEL_TASK_ID).cloned() else {
                warn!(job = %job_name, "managed job missing task-id label");
                continue;
            };

            let (active, succeeded, failed) = counters_of(&job);
            let running = active > 0 && succeeded == 0 && failed == 0;
            let exit_code = if succeeded > 0 {
                Some(0)
            } else if failed > 0 {
                Some(self.terminated_exit_code(&job_name).await.unwrap_or(1))
            } else {
                None
            };

            infos.push(WorkerTaskInfo {
                task_id,
                worker_id: job_name,
                running,
                exit_code,
                repo: job
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_REPO))
                    .cloned()
                    .unwrap_or_default(),
                retry_count: labels
                    .get(LABEL_RETRY_COUNT)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                created_at: job.metadata.creation_timestamp.map(|t| t.0),
            });
        }
        Ok(infos)
    }
}

fn counters_of(job: &Job) -> (i32, i32, i32) {
    job.status.as_ref().map_or((0, 0, 0), |status| {
        (
            status.active.unwrap_or(0),
            status.succeeded.unwrap_or(0),
            status.failed.unwrap_or(0),
        )
    })
}

fn not_found(job_name: &str) -> impl FnOnce(kube::Error) -> BackendError + '_ {
    move |e| match e {
        kube::Error::Api(ae) if ae.code == 404 => BackendError::NotFound(job_name.to_string()),
        other => other.into(),
    }
}

/// Format a core count as a Kubernetes CPU quantity.
fn format_cpu(cores: f64) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = (cores * 1000.0).round() as u64;
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{millis}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use store::{NewTask, Task};

    fn request() -> StartRequest {
        StartRequest {
            task: Task::create(NewTask {
                repo: "owner/r".to_string(),
                prompt: "Fix bug".to_string(),
                ..NewTask::default()
            }),
            github_token: "ghp_secret".to_string(),
            model: "opencode/glm-4.7-free".to_string(),
            image: "squire-worker:latest".to_string(),
            verbose: true,
            skills_dir: Some(PathBuf::from("/opt/skills")),
            container_runtime: None,
            config: crate::types::WorkerConfig::default(),
        }
    }

    #[test]
    fn job_spec_never_embeds_the_token() {
        let req = request();
        let job = ClusterBackend::build_job(&req, "squire-worker-x").unwrap();
        let rendered = serde_json::to_string(&job).unwrap();
        assert!(!rendered.contains("ghp_secret"));
        assert!(rendered.contains(TOKEN_SECRET_NAME));
        // Both token names reference the secret.
        assert!(rendered.contains("GITHUB_TOKEN"));
        assert!(rendered.contains("GH_TOKEN"));
    }

    #[test]
    fn job_spec_sets_limits_and_quarter_requests() {
        let req = request();
        let job = ClusterBackend::build_job(&req, "squire-worker-x").unwrap();
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(1800));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));

        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        let resources = container.resources.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(limits["cpu"].0, "2");
        assert_eq!(limits["memory"].0, "4096Mi");
        assert_eq!(requests["cpu"].0, "500m");
        assert_eq!(requests["memory"].0, "1024Mi");
    }

    #[test]
    fn job_counters_read_the_status_block() {
        let job: Job = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "squire-worker-x" },
            "status": { "active": 1 },
        }))
        .unwrap();
        assert_eq!(counters_of(&job), (1, 0, 0));

        let done: Job = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "squire-worker-x" },
            "status": { "succeeded": 1 },
        }))
        .unwrap();
        assert_eq!(counters_of(&done), (0, 1, 0));
    }

    #[test]
    fn cpu_quantities_render_like_kubectl() {
        assert_eq!(format_cpu(2.0), "2");
        assert_eq!(format_cpu(0.5), "500m");
        assert_eq!(format_cpu(1.5), "1500m");
    }
}
