//! Process-wide backend handle.
//!
//! One concrete backend is installed at startup and treated as read-only
//! afterwards; the setter/resetter exist to support tests.

use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};

use crate::types::{BackendError, BackendResult, WorkerBackend};

/// Which concrete backend to run workers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Container,
    Cluster,
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "container" | "docker" => Ok(Self::Container),
            "cluster" | "kubernetes" => Ok(Self::Cluster),
            other => Err(BackendError::Config(format!(
                "unknown backend type: {other} (expected container or cluster)"
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => f.write_str("container"),
            Self::Cluster => f.write_str("cluster"),
        }
    }
}

fn handle() -> &'static RwLock<Option<Arc<dyn WorkerBackend>>> {
    static HANDLE: OnceLock<RwLock<Option<Arc<dyn WorkerBackend>>>> = OnceLock::new();
    HANDLE.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide backend at startup.
pub fn install_backend(backend: Arc<dyn WorkerBackend>) {
    *handle().write().expect("backend handle poisoned") = Some(backend);
}

/// Test hook: replace the installed backend.
pub fn set_backend(backend: Arc<dyn WorkerBackend>) {
    install_backend(backend);
}

/// Test hook: clear the installed backend.
pub fn reset_backend() {
    *handle().write().expect("backend handle poisoned") = None;
}

/// The installed backend.
pub fn backend() -> BackendResult<Arc<dyn WorkerBackend>> {
    handle()
        .read()
        .expect("backend handle poisoned")
        .clone()
        .ok_or(BackendError::NotInstalled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use serial_test::serial;

    #[test]
    #[serial]
    fn backend_requires_install() {
        reset_backend();
        assert!(matches!(backend(), Err(BackendError::NotInstalled)));

        set_backend(Arc::new(MockBackend::new()));
        assert_eq!(backend().unwrap().name(), "mock");

        reset_backend();
        assert!(backend().is_err());
    }

    #[test]
    fn backend_kind_parses_both_spellings() {
        assert_eq!("container".parse::<BackendKind>().unwrap(), BackendKind::Container);
        assert_eq!("docker".parse::<BackendKind>().unwrap(), BackendKind::Container);
        assert_eq!("cluster".parse::<BackendKind>().unwrap(), BackendKind::Cluster);
        assert_eq!("Kubernetes".parse::<BackendKind>().unwrap(), BackendKind::Cluster);
        assert!("vm".parse::<BackendKind>().is_err());
    }
}
