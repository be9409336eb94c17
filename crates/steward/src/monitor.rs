//! Monitor just-dispatched tasks and fold outcomes into Steward state.

use store::{TaskStatus, TaskStore};
use tracing::warn;

use crate::dispatch::DispatchedTask;
use crate::state::{StewardState, TaskRecordStatus};

/// Dispatched tasks grouped by their observed status.
#[derive(Debug, Default)]
pub struct MonitorReport {
    pub running: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub unknown: Vec<String>,
}

/// Read back each dispatched task and record terminal outcomes.
pub async fn monitor_dispatched(
    store: &TaskStore,
    state: &mut StewardState,
    dispatched: &[DispatchedTask],
) -> MonitorReport {
    let mut report = MonitorReport::default();

    for task in dispatched {
        match store.get(&task.task_id).await {
            Ok(Some(record)) => match record.status {
                TaskStatus::Pending | TaskStatus::Running => {
                    report.running.push(task.task_id.clone());
                }
                TaskStatus::Completed => {
                    state.mark_terminal(
                        &task.task_id,
                        TaskRecordStatus::Completed,
                        record.pr_url.as_deref(),
                    );
                    report.completed.push(task.task_id.clone());
                }
                TaskStatus::Failed => {
                    state.mark_terminal(&task.task_id, TaskRecordStatus::Failed, None);
                    report.failed.push(task.task_id.clone());
                }
            },
            Ok(None) => {
                warn!(task_id = %task.task_id, "dispatched task has no store record");
                report.unknown.push(task.task_id.clone());
            }
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "could not read dispatched task");
                report.unknown.push(task.task_id.clone());
            }
        }
    }
    report
}
