//! The delivery contract shared by both webhook queues: signed POSTs with a
//! bounded per-attempt timeout, truncated response capture, and retry
//! classification.

use std::time::Duration;

use quay_core::Context;
use quay_work::WorkError;

/// Per-attempt timeout, independent of any request deadline.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Statuses which indicate the receiver may recover; everything else is
/// final from the queue's perspective.
const RETRYABLE_STATUSES: [u16; 3] = [502, 503, 504];

/// The outcome of one webhook POST, ready for the delivery record.
#[derive(Debug)]
pub(crate) struct WebhookResponse {
    pub status: i32,
    pub body: String,
    pub headers: String,
}

impl WebhookResponse {
    /// True when this response should be retried (the delivery record is
    /// updated either way).
    pub fn should_retry(&self) -> bool {
        RETRYABLE_STATUSES.contains(&(self.status as u16))
    }
}

/// The standard outbound header set. The nonce and signature authenticate
/// the exact payload bytes; receivers verify with the fleet's public key.
pub(crate) fn request_headers(event: &str, delivery_uuid: &str) -> Vec<(String, String)> {
    vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("X-Webhook-Event".to_string(), event.to_string()),
        ("X-Webhook-Delivery".to_string(), delivery_uuid.to_string()),
    ]
}

/// Serialize headers for persistence, one `Name: value` pair per line.
pub(crate) fn serialize_headers(headers: &[(String, String)]) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out
}

/// POST `payload` to `url` with the standard headers plus a fresh
/// nonce/signature pair. The response body is truncated to `body_limit`
/// bytes.
///
/// Network failures are transient (the scheduler retries); a malformed URL
/// or an unreadable response body is permanent.
pub(crate) async fn post_webhook(
    ctx: &Context,
    url: &str,
    headers: &[(String, String)],
    payload: &[u8],
    body_limit: usize,
) -> Result<WebhookResponse, WorkError> {
    let client = reqwest::Client::builder()
        .timeout(ATTEMPT_TIMEOUT)
        .build()
        .map_err(WorkError::permanent)?;

    let url: reqwest::Url = url.parse().map_err(WorkError::permanent)?;

    let (nonce, signature) = quay_crypto::for_context(ctx).sign_webhook(payload);

    let mut request = client.post(url).body(payload.to_vec());
    for (name, value) in headers {
        request = request.header(name, value);
    }
    request = request
        .header("X-Payload-Nonce", &nonce)
        .header("X-Payload-Signature", &signature);

    let response = request.send().await.map_err(WorkError::transient)?;

    let status = i32::from(response.status().as_u16());
    let mut response_headers = String::new();
    for (name, value) in response.headers() {
        response_headers.push_str(name.as_str());
        response_headers.push_str(": ");
        response_headers.push_str(value.to_str().unwrap_or(""));
        response_headers.push_str("\r\n");
    }

    let body = response.bytes().await.map_err(WorkError::permanent)?;
    let body = String::from_utf8_lossy(&body[..body.len().min(body_limit)]).into_owned();

    Ok(WebhookResponse {
        status,
        body,
        headers: response_headers,
    })
}
