//! Concurrency properties of the task store.
//!
//! Many writers against one record must never corrupt it: the final value
//! of each field equals one of the submitted values, and non-overlapping
//! fields written concurrently all survive.

use store::{NewTask, TaskStatus, TaskStore, TaskUpdate};

fn new_store() -> (tempfile::TempDir, TaskStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskStore::new(dir.path().join("tasks"));
    (dir, store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_writers_one_field_record_stays_valid() {
    let (_dir, store) = new_store();
    let task = store
        .create(NewTask {
            repo: "owner/r".to_string(),
            prompt: "Fix bug".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let store = store.clone();
        let id = task.id.clone();
        handles.push(tokio::spawn(async move {
            store
                .update(
                    &id,
                    TaskUpdate {
                        pr_number: Some(i),
                        ..TaskUpdate::default()
                    },
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let task = store.get(&task.id).await.unwrap().unwrap();
    let winner = task.pr_number.expect("some writer won");
    assert!(winner < 16);
    // The record parsed cleanly and untouched fields are intact.
    assert_eq!(task.prompt, "Fix bug");
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_fields_from_concurrent_writers_all_persist() {
    let (_dir, store) = new_store();
    let task = store
        .create(NewTask {
            repo: "owner/r".to_string(),
            prompt: "Fix bug".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let writers: Vec<tokio::task::JoinHandle<()>> = vec![
        {
            let store = store.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                store
                    .update(
                        &id,
                        TaskUpdate {
                            pr_merged: Some(true),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
                    .unwrap();
            })
        },
        {
            let store = store.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                store
                    .update(
                        &id,
                        TaskUpdate {
                            ci_failed: Some(true),
                            ci_failed_check: Some("tests".to_string()),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
                    .unwrap();
            })
        },
        {
            let store = store.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                store
                    .update(
                        &id,
                        TaskUpdate {
                            pr_url: Some("https://github.com/owner/r/pull/9".to_string()),
                            pr_number: Some(9),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
                    .unwrap();
            })
        },
    ];
    for writer in writers {
        writer.await.unwrap();
    }

    let task = store.get(&task.id).await.unwrap().unwrap();
    assert_eq!(task.pr_merged, Some(true));
    assert_eq!(task.ci_failed, Some(true));
    assert_eq!(task.ci_failed_check.as_deref(), Some("tests"));
    assert_eq!(task.pr_number, Some(9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn update_racing_delete_leaves_no_partial_record() {
    let (_dir, store) = new_store();

    for _ in 0..8 {
        let task = store
            .create(NewTask {
                repo: "owner/r".to_string(),
                prompt: "Fix bug".to_string(),
                ..NewTask::default()
            })
            .await
            .unwrap();

        let updater = {
            let store = store.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                let _ = store
                    .update(
                        &id,
                        TaskUpdate {
                            pr_merged: Some(true),
                            ..TaskUpdate::default()
                        },
                    )
                    .await;
            })
        };
        let deleter = {
            let store = store.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                let _ = store.delete(&id).await;
            })
        };
        updater.await.unwrap();
        deleter.await.unwrap();

        // Either fully gone or fully parseable.
        match store.get(&task.id).await.unwrap() {
            None => {}
            Some(record) => assert_eq!(record.prompt, "Fix bug"),
        }
    }
}

#[tokio::test]
async fn list_round_trip_after_mixed_lifecycle() {
    let (_dir, store) = new_store();

    let mut ids = Vec::new();
    for i in 0..5 {
        let task = store
            .create(NewTask {
                repo: format!("owner/repo-{i}"),
                prompt: format!("Task number {i}"),
                ..NewTask::default()
            })
            .await
            .unwrap();
        ids.push(task.id);
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
    }

    store.update(&ids[0], TaskUpdate::started("w-0")).await.unwrap();
    store.update(&ids[0], TaskUpdate::completed()).await.unwrap();
    store.update(&ids[1], TaskUpdate::started("w-1")).await.unwrap();
    store
        .update(&ids[2], TaskUpdate::failed("start failed"))
        .await
        .unwrap();

    let all = store.list(None).await.unwrap();
    assert_eq!(all.len(), 5);
    // Newest first.
    assert_eq!(all[0].id, ids[4]);
    assert_eq!(all[4].id, ids[0]);

    assert_eq!(store.list(Some(TaskStatus::Pending)).await.unwrap().len(), 2);
    assert_eq!(store.list(Some(TaskStatus::Running)).await.unwrap().len(), 1);
    assert_eq!(
        store.list(Some(TaskStatus::Completed)).await.unwrap().len(),
        1
    );
    assert_eq!(store.list(Some(TaskStatus::Failed)).await.unwrap().len(), 1);
}
