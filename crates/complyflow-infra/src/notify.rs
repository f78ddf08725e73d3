//! Notification channel implementations.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use complyflow_core::notify::{NotificationChannel, NotifyError};

/// Writes every notification to the tracing log.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationChannel;

impl NotificationChannel for LogNotificationChannel {
    fn publish<'a>(&'a self, topic: &'a str, message: Value) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            tracing::info!(topic, message = %message, "workflow notification");
            Ok(())
        })
    }
}

/// POSTs `{topic, message}` to a webhook URL.
pub struct WebhookNotificationChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotificationChannel {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl NotificationChannel for WebhookNotificationChannel {
    fn publish<'a>(&'a self, topic: &'a str, message: Value) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(&json!({ "topic": topic, "message": message }))
                .send()
                .await
                .map_err(|e| NotifyError(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(NotifyError(format!("webhook returned HTTP {status}")));
            }
            tracing::debug!(topic, url = self.url.as_str(), "notification delivered");
            Ok(())
        })
    }
}
