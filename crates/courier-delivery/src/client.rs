//! HTTP client for webhook delivery.
//!
//! Builds the signed POST for one attempt, bounds it by the attempt's
//! timeout tier and classifies transport failures. Non-2xx responses are
//! returned as data; the orchestrator decides what they mean.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use courier_core::{DeliveryId, SubscriptionId};
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Signature header name.
pub const SIGNATURE_HEADER: &str = "X-Signature";
/// Delivery id header name.
pub const EVENT_ID_HEADER: &str = "X-Event-Id";
/// Event type header name.
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";
/// Attempt number header name.
pub const ATTEMPT_NUMBER_HEADER: &str = "X-Attempt-Number";
/// Idempotency key header name.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_AUDIT_SIZE: usize = 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// TCP connect timeout, applied on top of the attempt timeout.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "Courier-Webhook-Delivery/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP client shared by all delivery attempts.
///
/// Reuses one connection pool for every subscriber.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
}

/// One outbound attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery being attempted, sent as `X-Event-Id`.
    pub delivery_id: DeliveryId,
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// Destination URL.
    pub url: String,
    /// Event type, sent as `X-Event-Type`.
    pub event_type: String,
    /// Serialized JSON body.
    pub body: Bytes,
    /// Packed `t=..,v1=..` signature.
    pub signature: String,
    /// 1-based attempt number, sent as `X-Attempt-Number`.
    pub attempt_number: u32,
    /// Caller supplied idempotency key.
    pub idempotency_key: Option<String>,
    /// Timeout tier for this attempt.
    pub timeout: Duration,
}

/// Response from a webhook delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated when large.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// The failure a non-2xx response represents.
    pub fn error(&self) -> Option<DeliveryError> {
        (!self.is_success).then(|| DeliveryError::from_status(self.status_code, self.body.clone()))
    }

    /// `Retry-After` hint in seconds, if the subscriber sent one.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        extract_retry_after_seconds(&self.headers)
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Creates a new delivery client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&ClientConfig::default())
    }

    /// Sends one attempt.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the attempt exceeds its timeout tier
    /// - `NetworkError` for connection and transport failures
    ///
    /// Any HTTP response, including 4xx and 5xx, is returned as `Ok`.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            subscription_id = %request.subscription_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self
                .client
                .post(&request.url)
                .timeout(request.timeout)
                .body(request.body.clone())
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, &request.signature)
                .header(EVENT_ID_HEADER, request.delivery_id.to_string())
                .header(EVENT_TYPE_HEADER, &request.event_type)
                .header(ATTEMPT_NUMBER_HEADER, request.attempt_number.to_string());

            if let Some(key) = &request.idempotency_key {
                http_request = http_request.header(IDEMPOTENCY_KEY_HEADER, key);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(request.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = parse_response(response, start_time).await;

            match delivery_response.status_code {
                200..=299 => {
                    tracing::info!(
                        duration_ms = delivery_response.duration.as_millis(),
                        "webhook delivered"
                    );
                },
                status => {
                    tracing::warn!(
                        status,
                        duration_ms = delivery_response.duration.as_millis(),
                        "webhook rejected"
                    );
                },
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

async fn parse_response(response: Response, start_time: std::time::Instant) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, headers, body, duration: start_time.elapsed(), is_success }
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() > MAX_RESPONSE_BODY_SIZE {
        let suffix = "... (truncated)";
        let max_content = MAX_AUDIT_SIZE - suffix.len();
        let truncated = String::from_utf8_lossy(&bytes[..max_content]);
        format!("{truncated}{suffix}")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}

/// Extracts the retry-after delay from response headers.
///
/// Supports both seconds format and HTTP-date format. Falls back to 60s if
/// the header is present but unparseable.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;

    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let remaining = date_time.with_timezone(&chrono::Utc).signed_duration_since(chrono::Utc::now());
        return Some(remaining.to_std().map_or(0, |d| d.as_secs()));
    }

    Some(DEFAULT_RETRY_AFTER)
}
