//! Webhook notifier.
//!
//! POSTs `{recipient, subject, body, sent_at}` as JSON to a configured URL.
//! When a secret is set the raw body is signed with HMAC-SHA256 and sent as
//! `X-Dialoguard-Signature: sha256=<hex>`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dialoguard_core::Notifier;
use dialoguard_core::error::NotifyError;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Dialoguard-Signature";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
    sent_at: String,
}

pub struct WebhookNotifier {
    url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self, NotifyError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(NotifyError::NotConfigured("webhook URL is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::NotConfigured(format!("HTTP client: {e}")))?;
        Ok(Self {
            url,
            secret: secret.filter(|s| !s.is_empty()),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// `sha256=<hex>` HMAC of `payload` under `secret`.
pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String, NotifyError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NotifyError::NotConfigured(format!("invalid signing secret: {e}")))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a signature produced by [`sign_payload`]; the `sha256=` prefix is optional.
///
/// Uses constant-time comparison.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let sig_hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(provided) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let failed = |reason: String| NotifyError::DeliveryFailed {
            recipient: recipient.to_string(),
            reason,
        };

        let payload = WebhookPayload {
            recipient,
            subject,
            body,
            sent_at: Utc::now().to_rfc3339(),
        };
        let bytes = serde_json::to_vec(&payload).map_err(|e| failed(format!("serialization: {e}")))?;

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &bytes)?);
        }

        let response = request
            .body(bytes)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status.as_u16())));
        }

        debug!(recipient, status = status.as_u16(), "Webhook notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use std::sync::{Arc, Mutex};

    type Received = Arc<Mutex<Vec<(Option<String>, serde_json::Value, Vec<u8>)>>>;

    async fn serve(status: StatusCode) -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State((received, status)): State<(Received, StatusCode)>, headers: HeaderMap, body: Bytes| async move {
                        let signature = headers
                            .get(SIGNATURE_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                        received.lock().unwrap().push((signature, json, body.to_vec()));
                        status
                    },
                ),
            )
            .with_state((received.clone(), status));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), received)
    }

    #[test]
    fn signature_round_trip() {
        let sig = sign_payload("s3cret", b"{\"a\":1}").unwrap();
        assert!(sig.starts_with("sha256="));
        assert!(verify_signature("s3cret", b"{\"a\":1}", &sig));
        assert!(!verify_signature("other", b"{\"a\":1}", &sig));
        assert!(!verify_signature("s3cret", b"{\"a\":2}", &sig));
        assert!(!verify_signature("s3cret", b"x", "sha256=not-hex"));
    }

    #[test]
    fn empty_url_is_rejected() {
        assert!(matches!(
            WebhookNotifier::new("  ", None),
            Err(NotifyError::NotConfigured(_))
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let notifier = WebhookNotifier::new("http://localhost/hook", Some("s3cret".into())).unwrap();
        let debug = format!("{notifier:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("REDACTED"));
    }

    #[tokio::test]
    async fn posts_signed_json() {
        let (url, received) = serve(StatusCode::OK).await;
        let notifier = WebhookNotifier::new(url, Some("s3cret".into())).unwrap();

        notifier
            .notify("counselor@example.org", "Conversation blocked", "Details")
            .await
            .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (signature, json, raw) = &received[0];
        assert_eq!(json["recipient"], "counselor@example.org");
        assert_eq!(json["subject"], "Conversation blocked");
        assert!(json["sent_at"].is_string());
        assert!(verify_signature("s3cret", raw, signature.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn unsigned_without_secret() {
        let (url, received) = serve(StatusCode::OK).await;
        let notifier = WebhookNotifier::new(url, Some(String::new())).unwrap();
        notifier.notify("r", "s", "b").await.unwrap();
        assert!(received.lock().unwrap()[0].0.is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_delivery_failure() {
        let (url, _) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
        let notifier = WebhookNotifier::new(url, None).unwrap();
        let err = notifier.notify("r", "s", "b").await.unwrap_err();
        assert!(matches!(err, NotifyError::DeliveryFailed { reason, .. } if reason == "HTTP 500"));
    }
}
