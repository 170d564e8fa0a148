//! HTTP mocking for subscriber endpoints.
//!
//! Wraps a wiremock server with the response shapes delivery tests need:
//! fixed statuses, `Retry-After` hints, slow responses and scripted
//! sequences that change behaviour from one attempt to the next.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use courier_delivery::client::{ATTEMPT_NUMBER_HEADER, EVENT_ID_HEADER, SIGNATURE_HEADER};
use serde_json::Value;
use wiremock::{
    matchers::{method, path},
    Mock, Request, Respond, ResponseTemplate,
};

/// Response a mock subscriber returns.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// 2xx with a body.
    Success {
        /// Status code
        status: u16,
        /// Response body
        body: String,
    },
    /// Non-2xx, optionally with `Retry-After` in seconds.
    Failure {
        /// Status code
        status: u16,
        /// `Retry-After` header value
        retry_after: Option<u64>,
    },
    /// 200 sent only after `delay`, long enough to trip an attempt timeout.
    Timeout {
        /// Delay before responding
        delay: Duration,
    },
}

impl MockResponse {
    /// `200 OK`.
    pub fn ok() -> Self {
        Self::Success { status: 200, body: "{}".to_string() }
    }

    /// Failure with `status`.
    pub fn status(status: u16) -> Self {
        Self::Failure { status, retry_after: None }
    }

    fn template(&self) -> ResponseTemplate {
        match self {
            Self::Success { status, body } => ResponseTemplate::new(*status).set_body_string(body.clone()),
            Self::Failure { status, retry_after } => {
                let template = ResponseTemplate::new(*status);
                match retry_after {
                    Some(seconds) => template.insert_header("Retry-After", seconds.to_string().as_str()),
                    None => template,
                }
            },
            Self::Timeout { delay } => ResponseTemplate::new(200).set_delay(*delay),
        }
    }
}

/// Plays responses in order, repeating the last one.
struct Sequence {
    responses: Vec<MockResponse>,
    served: Arc<AtomicUsize>,
}

impl Respond for Sequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let index = self.served.fetch_add(1, Ordering::AcqRel);
        self.responses
            .get(index)
            .or_else(|| self.responses.last())
            .map_or_else(|| ResponseTemplate::new(200), MockResponse::template)
    }
}

/// A request a subscriber received.
#[derive(Debug, Clone)]
pub struct ReceivedDelivery {
    /// Request path.
    pub path: String,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// `X-Signature` header.
    pub signature: Option<String>,
    /// `X-Event-Id` header.
    pub event_id: Option<String>,
    /// `X-Attempt-Number` header, parsed.
    pub attempt_number: Option<u32>,
}

impl ReceivedDelivery {
    /// Body parsed as JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    fn from_request(request: &Request) -> Self {
        let header = |name: &str| request.headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        Self {
            path: request.url.path().to_string(),
            body: request.body.clone(),
            signature: header(SIGNATURE_HEADER),
            event_id: header(EVENT_ID_HEADER),
            attempt_number: header(ATTEMPT_NUMBER_HEADER).and_then(|v| v.parse().ok()),
        }
    }
}

/// Mock subscriber server.
pub struct MockServer {
    server: wiremock::MockServer,
}

impl MockServer {
    /// Starts a server on a random local port.
    pub async fn start() -> Self {
        Self { server: wiremock::MockServer::start().await }
    }

    /// Base URL of the server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Full URL for `endpoint_path`, which must start with `/`.
    pub fn endpoint_url(&self, endpoint_path: &str) -> String {
        format!("{}{endpoint_path}", self.server.uri())
    }

    /// Answers every POST to `endpoint_path` with `response`.
    pub async fn respond(&self, endpoint_path: &str, response: MockResponse) {
        Mock::given(method("POST"))
            .and(path(endpoint_path))
            .respond_with(response.template())
            .mount(&self.server)
            .await;
    }

    /// Answers POSTs to `endpoint_path` with `responses` in order; the last
    /// one repeats.
    pub async fn respond_sequence(&self, endpoint_path: &str, responses: Vec<MockResponse>) {
        Mock::given(method("POST"))
            .and(path(endpoint_path))
            .respond_with(Sequence { responses, served: Arc::new(AtomicUsize::new(0)) })
            .mount(&self.server)
            .await;
    }

    /// Replaces every configured response.
    pub async fn reset(&self) {
        self.server.reset().await;
    }

    /// Every request received so far, in arrival order.
    pub async fn received(&self) -> Vec<ReceivedDelivery> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(ReceivedDelivery::from_request)
            .collect()
    }

    /// Requests received on `endpoint_path`.
    pub async fn received_at(&self, endpoint_path: &str) -> Vec<ReceivedDelivery> {
        self.received().await.into_iter().filter(|r| r.path == endpoint_path).collect()
    }
}
