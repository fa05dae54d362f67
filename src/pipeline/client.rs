//! Stage invocation: one transport attempt, wrapped in retry and deadline
//! handling.
//!
//! [`StageTransport`] is the narrow seam to the outside world: send one JSON
//! body to one stage, get one JSON body back or a classified failure.
//! [`HttpTransport`] is the production implementation over a shared
//! `reqwest::Client`; tests substitute scripted in-memory transports.
//!
//! [`StageClient`] adds everything a single attempt does not know about:
//! wire encoding, the per-stage retry budget, exponential backoff, the run
//! deadline and cancellation.
//!
//! ## Retry Strategy
//!
//! Only `Unreachable` failures are retried: a stage that answered (even with
//! a 500) or answered garbage will answer the same way again. The wait before
//! retry `n` is `retry_backoff * 2^(n-1)`, capped at `max_backoff`; with a
//! 250 ms base and 2 retries that is 250 ms → 500 ms. A retry whose backoff
//! would run past the deadline is skipped and the last failure returned.

use crate::error::{FailureKind, GatewayError, StageFailure};
use crate::pipeline::encode::{decode_response, encode_request};
use crate::pipeline::run::RunBudget;
use crate::stage::{StageDescriptor, StageOutput, StageRequest, StageResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Longest slice of a non-2xx body echoed into a `RemoteError` message.
const BODY_SNIPPET_CHARS: usize = 200;

/// One attempt at one stage.
#[async_trait]
pub trait StageTransport: Send + Sync {
    /// POST `body` to `stage` and return the parsed JSON response.
    ///
    /// Implementations classify failures: transport problems as
    /// `Unreachable`, non-2xx as `RemoteError`, a non-JSON body as
    /// `ProtocolError`. They should bound the attempt by `stage.timeout`.
    async fn send(&self, stage: &StageDescriptor, body: &Value) -> Result<Value, StageFailure>;
}

/// [`StageTransport`] over HTTP.
///
/// Holds a single `reqwest::Client`, whose connection pool is shared by every
/// run and every stage.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StageTransport for HttpTransport {
    async fn send(&self, stage: &StageDescriptor, body: &Value) -> Result<Value, StageFailure> {
        let response = self
            .client
            .post(stage.endpoint.clone())
            .timeout(stage.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport_error(stage, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StageFailure::remote(
                stage.kind,
                format!("HTTP {}: {}", status.as_u16(), snippet(&text)),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport_error(stage, &e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            StageFailure::protocol(stage.kind, format!("response is not valid JSON: {e}"))
        })
    }
}

fn classify_transport_error(stage: &StageDescriptor, e: &reqwest::Error) -> StageFailure {
    let message = if e.is_timeout() {
        format!("no response within {}ms", stage.timeout.as_millis())
    } else if e.is_connect() {
        format!("connection to {} failed: {e}", stage.endpoint)
    } else {
        format!("request to {} failed: {e}", stage.endpoint)
    };
    StageFailure::unreachable(stage.kind, message)
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= BODY_SNIPPET_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(BODY_SNIPPET_CHARS).collect();
        format!("{cut}…")
    }
}

/// Exponential backoff policy shared by all stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Calls stages with retry, backoff, deadline and cancellation applied.
#[derive(Clone)]
pub struct StageClient {
    transport: Arc<dyn StageTransport>,
    backoff: Backoff,
}

impl std::fmt::Debug for StageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageClient")
            .field("transport", &"<dyn StageTransport>")
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl StageClient {
    pub fn new(transport: Arc<dyn StageTransport>, backoff: Backoff) -> Self {
        Self { transport, backoff }
    }

    /// Invoke `stage` with `request`, within `budget`.
    ///
    /// Returns exactly one result. `Unreachable` failures are retried up to
    /// `stage.max_retries` times; every other failure is returned at once.
    pub async fn call(
        &self,
        stage: &StageDescriptor,
        request: StageRequest,
        budget: &RunBudget,
    ) -> StageResult<StageOutput> {
        let body = encode_request(stage.kind, &request)?;
        let label = request.field_name.as_deref().unwrap_or("document");

        let mut last_err: Option<StageFailure> = None;

        for attempt in 0..=stage.max_retries {
            if attempt > 0 {
                let backoff = self.backoff.delay(attempt);
                if Instant::now() + backoff >= budget.deadline {
                    warn!(
                        "{} [{}]: skipping retry {}/{}, {}ms backoff exceeds remaining budget",
                        stage.kind,
                        label,
                        attempt,
                        stage.max_retries,
                        backoff.as_millis()
                    );
                    break;
                }
                warn!(
                    "{} [{}]: retry {}/{} after {}ms",
                    stage.kind,
                    label,
                    attempt,
                    stage.max_retries,
                    backoff.as_millis()
                );
                tokio::select! {
                    _ = budget.cancel.cancelled() => {
                        return Err(StageFailure::cancelled(stage.kind, "run cancelled during backoff"));
                    }
                    _ = sleep(backoff) => {}
                }
            }

            match self.attempt(stage, &body, budget).await {
                Ok(value) => {
                    debug!("{} [{}]: succeeded on attempt {}", stage.kind, label, attempt + 1);
                    return decode_response(stage.kind, value);
                }
                Err(failure) if failure.kind.is_retryable() => {
                    warn!(
                        "{} [{}]: attempt {} failed: {}",
                        stage.kind,
                        label,
                        attempt + 1,
                        failure.message
                    );
                    last_err = Some(failure);
                }
                Err(failure) => return Err(failure),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            StageFailure::unreachable(stage.kind, "no attempt was made")
        }))
    }

    /// A single attempt bounded by `min(stage.timeout, remaining budget)`.
    async fn attempt(
        &self,
        stage: &StageDescriptor,
        body: &Value,
        budget: &RunBudget,
    ) -> Result<Value, StageFailure> {
        if budget.is_cancelled() {
            return Err(StageFailure::cancelled(stage.kind, "run cancelled"));
        }
        let remaining = budget.remaining();
        if remaining.is_zero() {
            return Err(StageFailure::timeout(
                stage.kind,
                "run deadline exceeded before the call started",
            ));
        }
        let limited_by_run = remaining <= stage.timeout;
        let limit = remaining.min(stage.timeout);

        tokio::select! {
            _ = budget.cancel.cancelled() => {
                Err(StageFailure::cancelled(stage.kind, "run cancelled"))
            }
            outcome = tokio::time::timeout(limit, self.transport.send(stage, body)) => match outcome {
                Ok(result) => result,
                Err(_) if limited_by_run => Err(StageFailure::timeout(
                    stage.kind,
                    "run deadline exceeded while waiting for the stage",
                )),
                Err(_) => Err(StageFailure::new(
                    stage.kind,
                    FailureKind::Unreachable,
                    format!("no response within {}ms", stage.timeout.as_millis()),
                )),
            }
        }
    }
}
