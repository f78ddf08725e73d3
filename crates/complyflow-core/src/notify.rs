//! Notification channel port.
//!
//! After an execution reaches a terminal status the coordinator may publish
//! a small message to the topic named in the workflow definition. Publishing
//! is fire-and-forget: a failed publish is logged and never affects the
//! execution.

use futures_util::future::BoxFuture;
use serde_json::Value;

/// Error returned by a notification channel.
#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound notification sink.
pub trait NotificationChannel: Send + Sync {
    fn publish<'a>(&'a self, topic: &'a str, message: Value) -> BoxFuture<'a, Result<(), NotifyError>>;
}
