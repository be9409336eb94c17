//! Webhook ingress for the Squire platform.
//!
//! A single HMAC-verified `POST /webhook` endpoint receives PR, comment,
//! review, and check events from the repo host, correlates them to stored
//! tasks, applies the corresponding mutations, and fires hooks. The hook
//! layer encodes follow-up policy: auto-fix tasks for failing CI and for
//! bot review feedback.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod autofix;
pub mod events;
pub mod handlers;
pub mod server;
pub mod verify;

pub use autofix::AutoFixHooks;
pub use events::{EventKind, ValidationError};
pub use handlers::{
    BotReviewEvent, CiFailureEvent, InlineComment, NoopHooks, PrCommentEvent, WebhookHooks,
};
pub use server::{webhook_router, WebhookConfig, WebhookState};
pub use verify::verify_signature;
