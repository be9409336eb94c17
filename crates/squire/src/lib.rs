//! Squire server library: configuration resolution and the HTTP surface.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod router;

pub use config::SquireConfig;
pub use router::app_router;
