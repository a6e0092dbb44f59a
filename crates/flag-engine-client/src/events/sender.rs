//! Event delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Outcome of one delivery attempt (after the sender's own retry).
#[derive(Debug, Clone, Default)]
pub struct EventSenderResult {
    pub success: bool,
    /// A 401/403 response: credentials are bad, stop all event I/O for good.
    pub must_shutdown: bool,
    /// The server's `Date` header, used to anchor debug-event expiry.
    pub server_time: Option<DateTime<Utc>>,
}

/// Transport seam for the events endpoints. The default implementation is
/// [`ReqwestEventSender`].
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_events(&self, payload: Vec<Value>) -> EventSenderResult;

    async fn send_diagnostic(&self, payload: Value) -> EventSenderResult;
}

/// Production sender: `POST {base}/bulk` and `POST {base}/diagnostic`, one
/// immediate retry on transient failures, permanent shutdown on 401/403.
pub struct ReqwestEventSender {
    client: reqwest::Client,
    events_uri: String,
    diagnostic_uri: String,
    sdk_key: String,
    custom_headers: Vec<(String, String)>,
}

impl ReqwestEventSender {
    pub fn new(
        client: reqwest::Client,
        base_uri: &str,
        sdk_key: &str,
        custom_headers: Vec<(String, String)>,
    ) -> ReqwestEventSender {
        let base = base_uri.trim_end_matches('/');
        ReqwestEventSender {
            client,
            events_uri: format!("{}/bulk", base),
            diagnostic_uri: format!("{}/diagnostic", base),
            sdk_key: sdk_key.to_string(),
            custom_headers,
        }
    }

    async fn post(&self, uri: &str, body: &Value, payload_id: Option<&str>) -> EventSenderResult {
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            let mut request = self
                .client
                .post(uri)
                .header(reqwest::header::AUTHORIZATION, &self.sdk_key)
                .header("X-Event-Schema-Version", "4")
                .json(body);
            if let Some(id) = payload_id {
                // The payload id stays the same across the retry so the
                // server can drop the duplicate.
                request = request.header("X-Payload-ID", id);
            }
            for (name, value) in &self.custom_headers {
                request = request.header(name, value);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let server_time = response
                        .headers()
                        .get(reqwest::header::DATE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
                        .map(|t| t.with_timezone(&Utc));
                    if status == 401 || status == 403 {
                        tracing::error!(status, "event delivery unauthorized; disabling events");
                        return EventSenderResult {
                            success: false,
                            must_shutdown: true,
                            server_time,
                        };
                    }
                    if (200..300).contains(&status) {
                        return EventSenderResult {
                            success: true,
                            must_shutdown: false,
                            server_time,
                        };
                    }
                    tracing::warn!(status, attempt, "event delivery failed");
                    if !is_recoverable(status) {
                        return EventSenderResult::default();
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "event delivery network failure");
                }
            }
        }
        EventSenderResult::default()
    }
}

fn is_recoverable(status: u16) -> bool {
    status == 400 || status == 408 || status == 429 || status >= 500
}

#[async_trait]
impl EventSender for ReqwestEventSender {
    async fn send_events(&self, payload: Vec<Value>) -> EventSenderResult {
        let payload_id = Uuid::new_v4().to_string();
        self.post(
            &self.events_uri,
            &Value::Array(payload),
            Some(&payload_id),
        )
        .await
    }

    async fn send_diagnostic(&self, payload: Value) -> EventSenderResult {
        self.post(&self.diagnostic_uri, &payload, None).await
    }
}
