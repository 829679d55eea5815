//! Notification sinks
//!
//! Where recovery emails and seller alerts go. Sink failures are transient:
//! the step that hit one is retried.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use storefront_durable::StepError;
use tracing::info;

/// A message for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Delivery channel, e.g. `email`
    pub channel: String,
    pub recipient: String,
    pub message: String,
}

impl Notification {
    pub fn email(recipient: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: "email".to_string(),
            recipient: recipient.into(),
            message: message.into(),
        }
    }
}

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),

    #[error("notification rejected with status {status}")]
    Rejected { status: u16 },
}

impl From<NotifyError> for StepError {
    fn from(err: NotifyError) -> Self {
        StepError::retryable(err.to_string()).with_type("NOTIFICATION")
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            channel = %notification.channel,
            recipient = %notification.recipient,
            message = %notification.message,
            "Sending notification"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook
pub struct WebhookNotificationSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Collects notifications for assertions
#[derive(Default)]
pub struct InMemoryNotificationSink {
    sent: Mutex<Vec<Notification>>,
    failures: Mutex<u32>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Fail the next `count` sends
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(NotifyError::Transport("injected failure".into()));
            }
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_sink_records_and_fails_on_demand() {
        let sink = InMemoryNotificationSink::new();
        sink.fail_next(1);
        let notification = Notification::email("seller@example.com", "Product p1 is out of stock");

        assert!(sink.notify(&notification).await.is_err());
        sink.notify(&notification).await.unwrap();

        assert_eq!(sink.sent(), vec![notification]);
    }

    #[test]
    fn test_notify_error_is_retryable() {
        let err: StepError = NotifyError::Rejected { status: 503 }.into();
        assert!(err.retryable);
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_notification_json_shape() {
        let json = serde_json::to_value(Notification::email("a@example.com", "hi")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "channel": "email", "recipient": "a@example.com", "message": "hi" })
        );
    }
}
