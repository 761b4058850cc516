//! Log-only notifier, used when no webhook is configured.

use async_trait::async_trait;
use dialoguard_core::Notifier;
use dialoguard_core::error::NotifyError;
use tracing::warn;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        warn!(recipient, subject, body_len = body.len(), "NOTIFY");
        Ok(())
    }
}
