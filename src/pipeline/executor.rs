use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::models::{PipelineConfig, PipelineId};
use crate::errors::ExecutorError;

/// Opaque structured result of a phase.
pub type PhaseOutput = serde_json::Value;

/// Read-only snapshot handed to the executor for one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseRequest {
    pub pipeline_id: PipelineId,
    pub phase_index: usize,
    pub phase_name: String,
    pub attempt: u32,
    pub niche: String,
    pub topic: Option<String>,
    pub config: PipelineConfig,
    /// Outputs of every earlier completed phase, keyed by phase index
    pub phase_outputs: BTreeMap<usize, PhaseOutput>,
}

/// Boundary to the content-generation collaborator.
///
/// Implementations return a result and never touch pipeline state; the
/// orchestrator applies the outcome. Approval policy is not their concern.
/// Real implementations: `HttpExecutor`, `StubExecutor`.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, request: PhaseRequest) -> Result<PhaseOutput, ExecutorError>;
}

#[async_trait]
impl<E: PhaseExecutor + ?Sized> PhaseExecutor for Arc<E> {
    async fn execute(&self, request: PhaseRequest) -> Result<PhaseOutput, ExecutorError> {
        (**self).execute(request).await
    }
}

/// Run one dispatch to completion: the executor runs on its own task under a
/// hard deadline, so a hang becomes `TimedOut` and a panic becomes `Panicked`.
pub async fn execute_with_deadline(
    executor: Arc<dyn PhaseExecutor>,
    request: PhaseRequest,
    deadline: Duration,
) -> Result<PhaseOutput, ExecutorError> {
    let mut task = tokio::spawn(async move { executor.execute(request).await });
    match tokio::time::timeout(deadline, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ExecutorError::Panicked(join_err.to_string())),
        Err(_) => {
            task.abort();
            Err(ExecutorError::TimedOut {
                after_ms: deadline.as_millis() as u64,
            })
        }
    }
}

/// Exponential backoff settings for transient executor failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `min * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.min_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Retries transient failures of the wrapped executor. Other errors return at once.
pub struct RetryingExecutor<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: PhaseExecutor> RetryingExecutor<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<E: PhaseExecutor> PhaseExecutor for RetryingExecutor<E> {
    async fn execute(&self, request: PhaseRequest) -> Result<PhaseOutput, ExecutorError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut try_number = 1;
        loop {
            match self.inner.execute(request.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && try_number < max_attempts => {
                    let delay = self.policy.backoff(try_number);
                    tracing::warn!(
                        pipeline_id = %request.pipeline_id,
                        phase = request.phase_index,
                        try_number,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "executor.retry"
                    );
                    tokio::time::sleep(delay).await;
                    try_number += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Local stand-in collaborator: returns a deterministic summary of its inputs.
#[derive(Debug, Clone, Default)]
pub struct StubExecutor;

impl StubExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PhaseExecutor for StubExecutor {
    async fn execute(&self, request: PhaseRequest) -> Result<PhaseOutput, ExecutorError> {
        Ok(serde_json::json!({
            "phase": request.phase_name,
            "niche": request.niche,
            "topic": request.topic,
            "attempt": request.attempt,
            "inputs": request.phase_outputs.len(),
            "summary": format!("{} for {}", request.phase_name, request.niche),
        }))
    }
}

/// Delegates phases to an HTTP service: POSTs the request as JSON and
/// returns the JSON response body as the phase output.
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
}

impl HttpExecutor {
    pub fn new(url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

/// 429 and 5xx are worth retrying; any other failure status is final.
fn classify_status(status: reqwest::StatusCode, body: &str) -> ExecutorError {
    let message = format!("phase service returned {}: {}", status, body.trim());
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ExecutorError::Transient(message)
    } else {
        ExecutorError::Permanent(message)
    }
}

#[async_trait]
impl PhaseExecutor for HttpExecutor {
    async fn execute(&self, request: PhaseRequest) -> Result<PhaseOutput, ExecutorError> {
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ExecutorError::Transient(e.to_string())
                } else {
                    ExecutorError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<PhaseOutput>()
            .await
            .map_err(|e| ExecutorError::Permanent(format!("Invalid JSON from phase service: {}", e)))
    }
}
