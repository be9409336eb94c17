//! Task persistence for the Squire platform.
//!
//! Each task is one self-describing JSON record in the tasks directory.
//! Every mutation acquires an exclusive file lock on the record before the
//! read-modify-write, so concurrent writers serialize per task and a
//! partially-written record is never observable.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod error;
mod lock;
pub mod store;
pub mod task;

pub use error::StoreError;
pub use store::TaskStore;
pub use task::{NewTask, Task, TaskStatus, TaskUpdate};

/// Result alias used across the crate.
pub type StoreResult<T> = Result<T, StoreError>;
