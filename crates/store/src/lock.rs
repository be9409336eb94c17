//! Exclusive per-record file locks.
//!
//! A sibling `<record>.lock` file is taken with an OS advisory lock for the
//! duration of every read-modify-write. Contended acquisition retries on a
//! bounded-random cadence until the timeout; a lock file that has not been
//! touched within the stale window is forcibly reclaimed (its holder is
//! presumed dead).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use rand::Rng;
use tracing::warn;

use crate::error::StoreError;

/// How long acquisition keeps retrying before failing with a lock error.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// Age after which a lingering lock file is reclaimed.
pub const STALE_AFTER: Duration = Duration::from_secs(30);
/// Retry cadence bounds for contention.
const RETRY_MIN_MS: u64 = 100;
const RETRY_MAX_MS: u64 = 200;

/// RAII guard; dropping releases the lock and removes the lock file.
#[derive(Debug)]
pub struct RecordLock {
    file: File,
    path: PathBuf,
}

impl RecordLock {
    /// Lock the record at `record_path` within [`ACQUIRE_TIMEOUT`].
    pub async fn acquire(record_path: &Path) -> Result<Self, StoreError> {
        Self::acquire_with_timeout(record_path, ACQUIRE_TIMEOUT).await
    }

    pub async fn acquire_with_timeout(
        record_path: &Path,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let lock_path = lock_path_for(record_path);
        let deadline = Instant::now() + timeout;

        loop {
            // The open/flock syscalls block; keep them off the async
            // executor threads.
            let attempt = {
                let lock_path = lock_path.clone();
                tokio::task::spawn_blocking(move || try_acquire(&lock_path))
                    .await
                    .map_err(|e| StoreError::Lock {
                        path: record_path.to_path_buf(),
                        reason: format!("lock task failed: {e}"),
                    })??
            };

            match attempt {
                LockAttempt::Acquired(file) => {
                    return Ok(Self {
                        file,
                        path: lock_path,
                    });
                }
                // Stale holder evicted; retry immediately.
                LockAttempt::Reclaimed => {}
                LockAttempt::Contended => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Lock {
                            path: record_path.to_path_buf(),
                            reason: format!("timed out after {}ms", timeout.as_millis()),
                        });
                    }
                    let pause = rand::thread_rng().gen_range(RETRY_MIN_MS..=RETRY_MAX_MS);
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
            }
        }
    }
}

enum LockAttempt {
    Acquired(File),
    Contended,
    Reclaimed,
}

/// One synchronous acquisition attempt; runs on the blocking pool.
fn try_acquire(lock_path: &Path) -> Result<LockAttempt, StoreError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|source| StoreError::FileWrite {
            path: lock_path.to_path_buf(),
            source,
        })?;

    if file.try_lock_exclusive().is_ok() {
        // Refresh mtime so other waiters see a live holder.
        let _ = file.set_len(0);
        return Ok(LockAttempt::Acquired(file));
    }
    drop(file);

    if lock_file_age(lock_path).is_some_and(|age| age > STALE_AFTER) {
        warn!(lock = %lock_path.display(), "reclaiming stale lock file");
        let _ = std::fs::remove_file(lock_path);
        return Ok(LockAttempt::Reclaimed);
    }
    Ok(LockAttempt::Contended)
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path_for(record_path: &Path) -> PathBuf {
    let mut name = record_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".lock");
    record_path.with_file_name(name)
}

fn lock_file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified.elapsed().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("task.json");

        let guard = RecordLock::acquire(&record).await.unwrap();
        let contender =
            RecordLock::acquire_with_timeout(&record, Duration::from_millis(300)).await;
        assert!(matches!(contender, Err(StoreError::Lock { .. })));

        drop(guard);
        let reacquired = RecordLock::acquire_with_timeout(&record, Duration::from_millis(300))
            .await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn lock_failure_names_the_record_path() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("task.json");

        let _guard = RecordLock::acquire(&record).await.unwrap();
        let err = RecordLock::acquire_with_timeout(&record, Duration::from_millis(200))
            .await
            .unwrap_err();
        let StoreError::Lock { path, .. } = err else {
            panic!("expected lock error");
        };
        assert_eq!(path, record);
    }
}
