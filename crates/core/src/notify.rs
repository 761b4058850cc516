//! Notifier trait — fire-and-forget outbound alerts.
//!
//! Safety emergencies notify a configured list of recipients. Delivery is
//! attempted per recipient; a failing recipient never aborts the batch and
//! never fails the turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub recipient: String,
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Human-readable notifier name (e.g., "webhook", "log").
    fn name(&self) -> &str;

    /// Deliver one notification to one recipient.
    async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Notify every recipient concurrently; failures are logged and reported.
pub async fn notify_all(
    notifier: &dyn Notifier,
    recipients: &[String],
    subject: &str,
    body: &str,
) -> Vec<DeliveryReport> {
    let attempts = recipients.iter().map(|recipient| async move {
        match notifier.notify(recipient, subject, body).await {
            Ok(()) => DeliveryReport {
                recipient: recipient.clone(),
                delivered: true,
                error: None,
            },
            Err(e) => {
                tracing::warn!(notifier = notifier.name(), recipient = %recipient, error = %e, "Notification failed");
                DeliveryReport {
                    recipient: recipient.clone(),
                    delivered: false,
                    error: Some(e.to_string()),
                }
            }
        }
    });
    futures::future::join_all(attempts).await
}
