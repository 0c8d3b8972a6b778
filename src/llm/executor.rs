//! Lifecycle of one completion request.
//!
//! Per call: `Pending -> (Attempting <-> BackoffWait)* -> Succeeded | Failed`.
//! The executor keeps no state between calls, so one instance can serve any
//! number of concurrent `execute` calls.

use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::error::{ExecutionError, TransportError};
use crate::llm::cancel::CancelSignal;
use crate::llm::retry::RetryPolicy;
use crate::llm::wire;
use crate::llm::{Credentials, RawResponse, Transport};
use crate::types::{CompletionRequest, CompletionResponse};

pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    endpoint: String,
    credentials: Credentials,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            credentials,
        }
    }

    pub async fn execute(
        &self,
        request: &CompletionRequest,
        policy: &RetryPolicy,
    ) -> Result<CompletionResponse, ExecutionError> {
        self.execute_with_cancel(request, policy, &CancelSignal::never())
            .await
    }

    /// Like [`execute`](Self::execute), but aborts with
    /// [`ExecutionError::Cancelled`] as soon as `cancel` fires, whether the
    /// call is waiting on the transport or sitting in a backoff.
    #[instrument(
        skip(self, request, policy, cancel),
        fields(model = %request.model(), max_attempts = policy.max_attempts())
    )]
    pub async fn execute_with_cancel(
        &self,
        request: &CompletionRequest,
        policy: &RetryPolicy,
        cancel: &CancelSignal,
    ) -> Result<CompletionResponse, ExecutionError> {
        request.validate()?;
        policy.validate()?;
        let payload = wire::to_payload(request)?;

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                debug!(attempt, "Cancelled before attempt");
                return Err(ExecutionError::Cancelled);
            }

            attempt += 1;
            debug!(attempt, "Sending request");

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempt, "Cancelled while awaiting transport");
                    return Err(ExecutionError::Cancelled);
                }
                result = self.transport.send(&self.endpoint, &payload, &self.credentials) => {
                    classify(result)
                }
            };

            match outcome {
                Ok(response) => {
                    debug!(
                        attempt,
                        finish_reason = ?response.finish_reason,
                        total_tokens = response.usage.total_tokens,
                        "Request succeeded"
                    );
                    return Ok(response);
                }
                Err(e) if policy.is_retryable(&e) && attempt < policy.max_attempts() => {
                    let delay = policy.delay_for(attempt, &e);
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(attempt, "Cancelled during backoff");
                            return Err(ExecutionError::Cancelled);
                        }
                        _ = sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(attempt, kind = ?e.kind(), error = %e, "Request failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Turns one transport outcome into a validated response or a typed error.
fn classify(result: Result<RawResponse, TransportError>) -> Result<CompletionResponse, ExecutionError> {
    let raw = result?;
    match raw.status {
        200..=299 => wire::into_response(&raw.body),
        429 => Err(ExecutionError::RateLimited {
            retry_after: raw.retry_after,
        }),
        401 | 403 => Err(ExecutionError::AuthenticationFailed(wire::error_message(&raw.body))),
        500..=599 => Err(ExecutionError::ServerError {
            status: raw.status,
            message: wire::error_message(&raw.body),
        }),
        status => Err(ExecutionError::Rejected {
            status,
            message: wire::error_message(&raw.body),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::llm::cancel;
    use crate::types::FinishReason;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    const ENDPOINT: &str = "https://api.example.test/v1/chat/completions";

    fn ok_body(text: &str) -> String {
        serde_json::json!({
            "id": "chatcmpl-test",
            "model": "gpt-3.5-turbo",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
        })
        .to_string()
    }

    fn ok(text: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse::new(200, ok_body(text)))
    }

    fn status(code: u16) -> Result<RawResponse, TransportError> {
        Ok(RawResponse::new(code, r#"{"error":{"message":"stubbed"}}"#))
    }

    /// Replays a fixed list of outcomes and records when each call happened.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
        calls: AtomicU32,
        call_times: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<RawResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                call_times: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn gaps(&self) -> Vec<Duration> {
            let times = self.call_times.lock().unwrap();
            times.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            endpoint: &str,
            payload: &serde_json::Value,
            credentials: &Credentials,
        ) -> Result<RawResponse, TransportError> {
            assert_eq!(endpoint, ENDPOINT);
            assert!(payload.get("messages").is_some());
            assert_eq!(credentials.bearer(), "Bearer test-key");

            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_times.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connection("script exhausted".to_string())))
        }
    }

    /// Never answers.
    struct HangingTransport {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for HangingTransport {
        async fn send(
            &self,
            _endpoint: &str,
            _payload: &serde_json::Value,
            _credentials: &Credentials,
        ) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn assert_gaps(actual: &[Duration], expected: &[Duration]) {
        let tolerance = Duration::from_millis(5);
        assert_eq!(actual.len(), expected.len(), "gaps: {:?}", actual);
        for (a, e) in actual.iter().zip(expected) {
            let diff = if a > e { *a - *e } else { *e - *a };
            assert!(diff <= tolerance, "expected {:?}, observed {:?}", e, a);
        }
    }

    fn executor(transport: Arc<dyn Transport>) -> RequestExecutor {
        RequestExecutor::new(transport, ENDPOINT, Credentials::new("test-key"))
    }

    fn request() -> CompletionRequest {
        CompletionRequest::prompt("gpt-3.5-turbo", "hi").unwrap()
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100), 2.0).unwrap()
    }

    #[tokio::test]
    async fn test_single_choice_response() {
        let transport = ScriptedTransport::new(vec![ok("stub text")]);
        let response = assert_ok!(executor(transport.clone()).execute(&request(), &policy(3)).await);

        assert_eq!(response.text, "stub text");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.total_tokens, 3);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retryable_failures() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            status(429),
            status(503),
            ok("finally"),
        ]);
        let response = assert_ok!(executor(transport.clone()).execute(&request(), &policy(5)).await);

        assert_eq!(response.text, "finally");
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_attempt_budget() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Connection("reset".to_string())),
            Err(TransportError::Connection("reset".to_string())),
            ok("third time"),
        ]);
        assert_ok!(executor(transport.clone()).execute(&request(), &policy(3)).await);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_last_error() {
        let transport = ScriptedTransport::new(vec![status(500), status(502), status(503), ok("unused")]);
        let err = assert_err!(executor(transport.clone()).execute(&request(), &policy(3)).await);

        assert!(matches!(err, ExecutionError::ServerError { status: 503, .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_authentication_failure_is_not_retried() {
        let transport = ScriptedTransport::new(vec![status(401), ok("unused")]);
        let err = assert_err!(executor(transport.clone()).execute(&request(), &policy(10)).await);

        assert!(matches!(err, ExecutionError::AuthenticationFailed(ref m) if m == "stubbed"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![status(400), ok("unused")]);
        let err = assert_err!(executor(transport.clone()).execute(&request(), &policy(3)).await);

        assert!(matches!(err, ExecutionError::Rejected { status: 400, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_response_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse::new(200, r#"{"choices": []}"#)),
            ok("unused"),
        ]);
        let err = assert_err!(executor(transport.clone()).execute(&request(), &policy(3)).await);

        assert_eq!(err.kind(), FailureKind::MalformedResponse);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_durations() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            ok("done"),
        ]);
        let policy = RetryPolicy::new(4, Duration::from_millis(100), 3.0).unwrap();
        assert_ok!(executor(transport.clone()).execute(&request(), &policy).await);

        assert_gaps(
            &transport.gaps(),
            &[
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(900),
            ],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retry_after_is_honored() {
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse::new(429, "").with_retry_after(Duration::from_secs(2))),
            ok("done"),
        ]);
        let policy = policy(2).with_honor_retry_after(true);
        assert_ok!(executor(transport.clone()).execute(&request(), &policy).await);
        assert_gaps(&transport.gaps(), &[Duration::from_secs(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retry_after_ignored_by_default() {
        let transport = ScriptedTransport::new(vec![
            Ok(RawResponse::new(429, "").with_retry_after(Duration::from_secs(2))),
            ok("done"),
        ]);
        assert_ok!(executor(transport.clone()).execute(&request(), &policy(2)).await);
        assert_gaps(&transport.gaps(), &[Duration::from_millis(100)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_backoff_is_not_capped() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            ok("done"),
        ]);
        let policy = RetryPolicy::new(3, Duration::from_secs(40), 2.0).unwrap();
        assert_ok!(executor(transport.clone()).execute(&request(), &policy).await);
        assert_gaps(
            &transport.gaps(),
            &[Duration::from_secs(40), Duration::from_secs(80)],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_returns_retryable_error_without_sleeping() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout), ok("unused")]);
        let started = Instant::now();
        let err = assert_err!(
            executor(transport.clone())
                .execute(&request(), &RetryPolicy::no_retry())
                .await
        );

        assert!(matches!(err, ExecutionError::Transport(TransportError::Timeout)));
        assert_eq!(transport.calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout), ok("unused")]);
        let policy = RetryPolicy::new(3, Duration::from_secs(10), 2.0).unwrap();
        let (handle, signal) = cancel::pair();

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let err = assert_err!(
            executor(transport.clone())
                .execute_with_cancel(&request(), &policy, &signal)
                .await
        );

        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(transport.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_transport_wait() {
        let transport = Arc::new(HangingTransport {
            calls: AtomicU32::new(0),
        });
        let (handle, signal) = cancel::pair();

        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });

        let err = assert_err!(
            executor(transport.clone())
                .execute_with_cancel(&request(), &policy(3), &signal)
                .await
        );
        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_sends_nothing() {
        let transport = ScriptedTransport::new(vec![ok("unused")]);
        let (handle, signal) = cancel::pair();
        handle.cancel();

        let err = assert_err!(
            executor(transport.clone())
                .execute_with_cancel(&request(), &policy(3), &signal)
                .await
        );
        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_independent() {
        let transport = ScriptedTransport::new(vec![ok("a"), ok("b")]);
        let executor = Arc::new(executor(transport.clone()));
        let policy = RetryPolicy::no_retry();

        let first = {
            let executor = executor.clone();
            let policy = policy.clone();
            tokio::spawn(async move { executor.execute(&request(), &policy).await })
        };
        let second = {
            let executor = executor.clone();
            let policy = policy.clone();
            tokio::spawn(async move { executor.execute(&request(), &policy).await })
        };

        let mut texts = vec![
            first.await.unwrap().unwrap().text,
            second.await.unwrap().unwrap().text,
        ];
        texts.sort();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn test_classify_statuses() {
        assert_eq!(
            classify(Ok(RawResponse::new(429, ""))).unwrap_err().kind(),
            FailureKind::RateLimited
        );
        assert_eq!(
            classify(Ok(RawResponse::new(403, ""))).unwrap_err().kind(),
            FailureKind::AuthenticationFailed
        );
        assert_eq!(
            classify(Ok(RawResponse::new(504, ""))).unwrap_err().kind(),
            FailureKind::ServerError
        );
        assert_eq!(
            classify(Ok(RawResponse::new(404, ""))).unwrap_err().kind(),
            FailureKind::Rejected
        );
        assert_eq!(
            classify(Err(TransportError::Timeout)).unwrap_err().kind(),
            FailureKind::Transport
        );
    }
}
