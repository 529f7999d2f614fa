//! Streaming client for the provider's `/responses` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client, StatusCode};
use reqwest_eventsource::{Event, EventSource};

use super::error::{LlmError, LlmResult};
use super::types::{CompletionRequest, ErrorEnvelope, StreamEvent};

/// Ordered upstream events for one completion.
pub type EventStream = BoxStream<'static, LlmResult<StreamEvent>>;

/// Headers that carry a rate-limit reset hint.
const RESET_HEADERS: [&str; 3] = [
    "x-ratelimit-reset-tokens",
    "x-ratelimit-reset-requests",
    "retry-after",
];

/// Error code the provider uses for rate limits in error bodies.
pub const RATE_LIMIT_CODE: &str = "rate_limit_exceeded";

/// A provider of streaming completions.
///
/// `stream_completion` resolves once the upstream accepted the request, so
/// status-level failures (including rate limits) surface before any event.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream_completion(
        &self,
        api_key: &str,
        request: CompletionRequest,
    ) -> LlmResult<EventStream>;
}

/// Client for an OpenAI-compatible responses API.
#[derive(Debug, Clone)]
pub struct OpenAiResponsesClient {
    client: Client,
    base_url: String,
}

impl OpenAiResponsesClient {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> LlmResult<Self> {
        // No overall timeout: responses stream for as long as the model writes.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionClient for OpenAiResponsesClient {
    async fn stream_completion(
        &self,
        api_key: &str,
        request: CompletionRequest,
    ) -> LlmResult<EventStream> {
        let url = self.endpoint();
        tracing::debug!(url = %url, model = %request.model, "Opening completion stream");

        let request_builder = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header(ACCEPT, "text/event-stream")
            .json(&request);

        let mut es =
            EventSource::new(request_builder).map_err(|e| LlmError::Transport(e.to_string()))?;
        es.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        let first = match es.next().await {
            Some(Ok(Event::Open)) => None,
            Some(Ok(Event::Message(msg))) => Some(msg.data),
            Some(Err(e)) => {
                es.close();
                return Err(map_open_error(e).await);
            }
            None => {
                return Err(LlmError::Transport(
                    "stream closed before it opened".to_string(),
                ));
            }
        };

        let head = stream::iter(first.filter(|data| !is_done_marker(data)))
            .map(|data| StreamEvent::from_data(&data));

        let tail = stream::unfold(Some(es), |state| async move {
            let mut es = state?;
            loop {
                match es.next().await {
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(msg))) => {
                        if is_done_marker(&msg.data) {
                            continue;
                        }
                        return Some((StreamEvent::from_data(&msg.data), Some(es)));
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                        es.close();
                        return None;
                    }
                    Some(Err(e)) => {
                        es.close();
                        return Some((Err(LlmError::Transport(e.to_string())), None));
                    }
                }
            }
        });

        Ok(head.chain(tail).boxed())
    }
}

fn is_done_marker(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Classify a failure that happened while opening the stream.
async fn map_open_error(error: reqwest_eventsource::Error) -> LlmError {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let reset_hint = parse_reset_hint(response.headers());
            let body = response.text().await.unwrap_or_default();
            classify_status(status, &body, reset_hint)
        }
        reqwest_eventsource::Error::Transport(e) => LlmError::Transport(e.to_string()),
        other => LlmError::Transport(other.to_string()),
    }
}

/// Map an error status and body onto an [`LlmError`].
pub fn classify_status(status: StatusCode, body: &str, reset_hint: Option<Duration>) -> LlmError {
    let (message, code) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.message, envelope.error.code),
        Err(_) => (body.to_string(), None),
    };

    if status == StatusCode::TOO_MANY_REQUESTS || code.as_deref() == Some(RATE_LIMIT_CODE) {
        return LlmError::RateLimited { reset_hint };
    }

    LlmError::Api {
        status: Some(status.as_u16()),
        code,
        message,
    }
}

/// Read the longest parseable reset hint from response headers.
pub fn parse_reset_hint(headers: &HeaderMap) -> Option<Duration> {
    RESET_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_duration_hint)
        })
        .max()
}

/// Parse `"6"`, `"1.5"` (seconds) or duration strings like `"6m0s"`, `"250ms"`.
///
/// Negative, non-finite and out-of-range values yield `None`.
pub fn parse_duration_hint(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(seconds).ok();
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = 0.0_f64;
    let mut rest = value;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c))?;
        if number_end == 0 {
            return None;
        }
        let number: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let factor = match &rest[..unit_end] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        total += number * factor;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(total).ok()
}
