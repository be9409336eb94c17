//! End-to-end worker lifecycle against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use backend::testing::MockBackend;
use backend::{start_task, DispatchOptions, WorkerConfig};
use serial_test::serial;
use store::{NewTask, TaskStatus, TaskStore};
use telemetry::metrics;

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

#[tokio::test]
#[serial]
async fn happy_path_counts_one_created_and_one_completed() {
    metrics().reset();
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::new(dir.path().join("tasks"));
    let backend = Arc::new(MockBackend::new());

    let task = store
        .create(NewTask {
            repo: "owner/r".to_string(),
            prompt: "Fix bug".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.branch.as_deref(), Some(&*format!("squire/{}", task.id)));
    assert_eq!(task.base_branch.as_deref(), Some("main"));

    let running = start_task(&store, backend.clone(), &task, &options())
        .await
        .unwrap();
    assert_eq!(running.status, TaskStatus::Running);
    let worker_id = running.worker_id.clone().unwrap();

    backend.finish(&worker_id, 0);
    // Wait for the supervisor to observe the exit.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = store.get(&task.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            break;
        }
    }

    let task = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.is_some());

    assert_eq!(metrics().counter_value("squire_tasks_created_total", &[]), 1);
    assert_eq!(
        metrics().counter_value("squire_tasks_completed_total", &[]),
        1
    );
    assert_eq!(
        metrics().counter_value("squire_container_starts_total", &[]),
        1
    );
    assert_eq!(metrics().gauge_value("squire_tasks_running", &[]), 0.0);

    let export = metrics().export();
    assert!(export.contains("squire_tasks_created_total 1"));
    assert!(export.contains("squire_tasks_completed_total 1"));
}

#[tokio::test]
#[serial]
async fn crash_recovery_reconciles_the_store() {
    metrics().reset();
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::new(dir.path().join("tasks"));

    // Simulate a crash: the store says running, the backend knows nothing.
    let task = store
        .create(NewTask {
            repo: "owner/r".to_string(),
            prompt: "Interrupted work".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();
    store
        .update(&task.id, store::TaskUpdate::started("worker-lost"))
        .await
        .unwrap();

    let backend: Arc<dyn backend::WorkerBackend> = Arc::new(MockBackend::new());
    let result = backend::reconcile(&store, &backend, backend::ReconcileOptions::default()).await;
    assert_eq!(result.tasks_reconciled, 1);
    assert_eq!(result.tasks_marked_failed, 1);

    let task = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .error
        .as_deref()
        .unwrap()
        .contains("worker not found during reconciliation"));
}
