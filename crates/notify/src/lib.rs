//! Outbound notifiers for Dialoguard safety escalations.

pub mod log;
pub mod webhook;

use std::sync::Arc;

use dialoguard_config::NotificationsConfig;
use dialoguard_core::Notifier;
use dialoguard_core::error::NotifyError;

pub use log::TracingNotifier;
pub use webhook::{SIGNATURE_HEADER, WebhookNotifier, sign_payload, verify_signature};

/// The webhook notifier when a URL is configured, otherwise log-only.
pub fn from_config(config: &NotificationsConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    match config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url, config.secret.clone())?)),
        None => Ok(Arc::new(TracingNotifier)),
    }
}
