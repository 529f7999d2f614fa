//! Bounded retry for rate-limited upstream calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::ChatError;
use crate::llm::{CompletionClient, CompletionRequest, EventStream, LlmError};

/// Retry settings (`[retry]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total upstream attempts, the first call included.
    pub max_attempts: u32,
    /// Delay before the first retry when the provider sends no hint.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter_ratio: f64,
    /// Budget for the whole attempt loop, sleeps included.
    pub total_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 6000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_ratio: 0.2,
            total_timeout_secs: 180,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1 for the first retry).
    ///
    /// A provider hint is used as is. Without one the first retry waits
    /// exactly `base_delay_ms`; later retries back off exponentially with
    /// jitter, capped at `max_delay_ms`.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        if retry <= 1 {
            return Duration::from_millis(self.base_delay_ms);
        }

        let exp = self.multiplier.max(1.0).powi((retry - 1).min(16) as i32);
        let delay = self.base_delay_ms as f64 * exp;
        let jitter = delay * self.jitter_ratio.clamp(0.0, 1.0) * rand::random::<f64>();

        Duration::from_millis(((delay + jitter) as u64).min(self.max_delay_ms))
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}

/// Open a completion stream, retrying only on rate limits.
pub async fn open_with_retry(
    client: &dyn CompletionClient,
    api_key: &str,
    request: &CompletionRequest,
    config: &RetryConfig,
) -> Result<EventStream, ChatError> {
    let max_attempts = config.max_attempts.max(1);

    let attempts = async {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match client.stream_completion(api_key, request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(LlmError::RateLimited { reset_hint }) if attempt < max_attempts => {
                    let delay = config.delay_for(attempt, reset_hint);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        hinted = reset_hint.is_some(),
                        "Upstream rate limited, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(LlmError::RateLimited { .. }) => {
                    return Err(ChatError::RateLimitExhausted { attempts: attempt });
                }
                Err(e) => return Err(ChatError::Upstream(e)),
            }
        }
    };

    let budget = config.total_timeout();
    tokio::time::timeout(budget, attempts)
        .await
        .map_err(|_| ChatError::Timeout(budget))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{InputMessage, InputRole, StreamEvent};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Fails with the scripted errors, then succeeds.
    struct ScriptedClient {
        failures: Mutex<VecDeque<LlmError>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedClient {
        fn new(failures: Vec<LlmError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn stream_completion(
            &self,
            _api_key: &str,
            _request: CompletionRequest,
        ) -> Result<EventStream, LlmError> {
            self.calls.lock().unwrap().push(Instant::now());
            match self.failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(futures::stream::iter(vec![Ok(StreamEvent::Completed)]).boxed()),
            }
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "m".to_string(),
            instructions: None,
            input: vec![InputMessage::new(InputRole::User, "hi")],
            stream: true,
            tools: vec![],
        }
    }

    fn rate_limited(hint: Option<Duration>) -> LlmError {
        LlmError::RateLimited { reset_hint: hint }
    }

    #[test]
    fn test_delay_without_hint() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(1, None), Duration::from_millis(6000));

        let second = config.delay_for(2, None);
        assert!(second >= Duration::from_millis(12_000));
        assert!(second <= Duration::from_millis(14_400));

        assert_eq!(config.delay_for(10, None), Duration::from_millis(60_000));
    }

    #[test]
    fn test_delay_uses_hint_exactly() {
        let config = RetryConfig::default();
        assert_eq!(
            config.delay_for(3, Some(Duration::from_millis(1500))),
            Duration::from_millis(1500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_delay_is_six_seconds() {
        let client = ScriptedClient::new(vec![rate_limited(None)]);
        let result = open_with_retry(&client, "k", &request(), &RetryConfig::default()).await;

        assert!(result.is_ok());
        assert_eq!(client.gaps(), vec![Duration::from_millis(6000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hinted_delay_is_honoured() {
        let client = ScriptedClient::new(vec![
            rate_limited(Some(Duration::from_millis(2500))),
            rate_limited(Some(Duration::from_secs(1))),
        ]);
        let result = open_with_retry(&client, "k", &request(), &RetryConfig::default()).await;

        assert!(result.is_ok());
        assert_eq!(
            client.gaps(),
            vec![Duration::from_millis(2500), Duration::from_secs(1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let client = ScriptedClient::new((0..10).map(|_| rate_limited(None)).collect());
        let config = RetryConfig {
            max_attempts: 3,
            ..Default::default()
        };

        let result = open_with_retry(&client, "k", &request(), &config).await;
        assert!(matches!(result, Err(ChatError::RateLimitExhausted { attempts: 3 })));
        assert_eq!(client.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_timeout() {
        let client = ScriptedClient::new((0..10).map(|_| rate_limited(None)).collect());
        let config = RetryConfig {
            max_attempts: 10,
            total_timeout_secs: 10,
            ..Default::default()
        };

        let result = open_with_retry(&client, "k", &request(), &config).await;
        assert!(matches!(result, Err(ChatError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let client = ScriptedClient::new(vec![LlmError::Api {
            status: Some(401),
            code: Some("invalid_api_key".to_string()),
            message: "bad key".to_string(),
        }]);

        let result = open_with_retry(&client, "k", &request(), &RetryConfig::default()).await;
        assert!(matches!(result, Err(ChatError::Upstream(LlmError::Api { .. }))));
        assert_eq!(client.calls.lock().unwrap().len(), 1);
    }
}
