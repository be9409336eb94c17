//! Worker naming.

/// Maximum length of a Kubernetes resource name.
const MAX_NAME_LENGTH: usize = 63;

/// Prefix for all managed workers.
pub const WORKER_NAME_PREFIX: &str = "squire-worker-";

/// Derive a cluster Job name from a task id.
///
/// Lowercases, replaces anything outside `[a-z0-9-]` with `-`, prefixes
/// `squire-worker-`, and truncates to 63 characters (trimming a dangling
/// hyphen so the result stays a valid DNS label).
#[must_use]
pub fn cluster_job_name(task_id: &str) -> String {
    let sanitized: String = task_id
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let full = format!("{WORKER_NAME_PREFIX}{sanitized}");
    let truncated: String = full.chars().take(MAX_NAME_LENGTH).collect();
    truncated.trim_end_matches('-').to_string()
}

/// Container name for the Docker backend; uniqueness comes from the retry
/// suffix so a retried start never collides with a dead predecessor.
#[must_use]
pub fn container_name(task_id: &str, retry_count: u32) -> String {
    if retry_count == 0 {
        format!("{WORKER_NAME_PREFIX}{task_id}")
    } else {
        format!("{WORKER_NAME_PREFIX}{task_id}-r{retry_count}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_sanitizes_and_prefixes() {
        assert_eq!(
            cluster_job_name("3F9C2a7e-81d0-4b5c"),
            "squire-worker-3f9c2a7e-81d0-4b5c"
        );
        assert_eq!(cluster_job_name("Task_01!"), "squire-worker-task-01");
    }

    #[test]
    fn job_name_is_truncated_to_63() {
        let long = "a".repeat(100);
        let name = cluster_job_name(&long);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with(WORKER_NAME_PREFIX));
    }

    #[test]
    fn truncation_never_leaves_a_trailing_hyphen() {
        // 49 a's puts the 63-char cut right after a '-'.
        let id = format!("{}-{}", "a".repeat(48), "b".repeat(20));
        let name = cluster_job_name(&id);
        assert!(!name.ends_with('-'));
        assert!(name.len() <= 63);
    }

    #[test]
    fn container_names_differ_per_retry() {
        assert_eq!(container_name("t1", 0), "squire-worker-t1");
        assert_eq!(container_name("t1", 2), "squire-worker-t1-r2");
    }
}
