//! Client for the authoritative source of project configs.
//!
//! A query is bounded by a total time budget (`query_timeout`), each attempt
//! by `request_timeout`. Timeouts, connection errors, and transient status
//! codes are retried with exponential backoff until the next wait would exceed
//! the budget. Undecodable responses are never retried.

mod backoff;
mod http;
mod protocol;

pub use backoff::{BackoffConfig, RetryBackoff};
pub use http::{HttpTransport, HttpTransportError};
pub use protocol::{
    GlobalStatus, ProjectConfigsRequest, ProjectConfigsResponse, UpstreamOutcome,
};

use crate::metrics_defs::{UPSTREAM_ATTEMPTS, UPSTREAM_FAILURES, UPSTREAM_REQUEST_DURATION};
use crate::types::ProjectKey;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use shared::{counter, histogram};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("could not reach upstream: {0}")]
    Transport(String),
    #[error("upstream request returned error {0}")]
    Status(StatusCode),
    #[error("could not decode upstream response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upstream query abandoned after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<UpstreamError>,
    },
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Timeout | UpstreamError::Transport(_) => true,
            UpstreamError::Status(status) => RETRIABLE_STATUS_CODES.contains(status),
            UpstreamError::Decode(_) | UpstreamError::RetriesExhausted { .. } => false,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Transport(_) => "transport",
            UpstreamError::Status(_) => "status",
            UpstreamError::Decode(_) => "decode",
            UpstreamError::RetriesExhausted { .. } => "exhausted",
        }
    }
}

/// Sends a single project configs query. Implementations perform exactly one
/// attempt, retries are handled by [`UpstreamClient`].
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(
        &self,
        request: &ProjectConfigsRequest,
    ) -> Result<ProjectConfigsResponse, UpstreamError>;
}

/// Per-attempt timeout unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UpstreamClient {
    transport: Arc<dyn UpstreamTransport>,
    query_timeout: Duration,
    request_timeout: Duration,
    backoff: BackoffConfig,
}

impl UpstreamClient {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        query_timeout: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        UpstreamClient {
            transport,
            query_timeout,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Total time budget of a query, including retries.
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Fetches a batch of keys with their last known revisions.
    pub async fn fetch(
        &self,
        batch: &[(ProjectKey, Option<String>)],
    ) -> Result<HashMap<ProjectKey, UpstreamOutcome>, UpstreamError> {
        let request = ProjectConfigsRequest::for_batch(batch);
        let response = self.query(&request, "project").await?;
        Ok(response.into_outcomes(&request.public_keys))
    }

    /// Fetches the global config. Returns `None` while the upstream reports it
    /// as pending.
    pub async fn fetch_global(&self) -> Result<Option<JsonValue>, UpstreamError> {
        let response = self.query(&ProjectConfigsRequest::global(), "global").await?;
        if response.global_status == Some(GlobalStatus::Pending) {
            return Ok(None);
        }
        Ok(response.global)
    }

    async fn query(
        &self,
        request: &ProjectConfigsRequest,
        kind: &'static str,
    ) -> Result<ProjectConfigsResponse, UpstreamError> {
        let started = Instant::now();
        let deadline = started + self.query_timeout;
        let mut backoff = RetryBackoff::new(self.backoff);
        let mut attempts: u32 = 0;

        let result = loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt_timeout = self.request_timeout.min(remaining);
            let result = timeout(attempt_timeout, self.transport.send(request))
                .await
                .unwrap_or(Err(UpstreamError::Timeout));

            match result {
                Ok(response) => break Ok(response),
                Err(err) if err.is_retryable() => {
                    let wait = backoff.next_backoff();
                    if Instant::now() + wait > deadline {
                        break Err(UpstreamError::RetriesExhausted {
                            attempts,
                            last: Box::new(err),
                        });
                    }
                    tracing::warn!(
                        attempt = attempts,
                        wait_ms = wait.as_millis() as u64,
                        "upstream query failed, retrying: {err}"
                    );
                    sleep(wait).await;
                }
                Err(err) => break Err(err),
            }
        };

        histogram!(UPSTREAM_REQUEST_DURATION, "kind" => kind).record(started.elapsed());
        histogram!(UPSTREAM_ATTEMPTS, "kind" => kind).record(attempts as f64);
        if let Err(err) = &result {
            counter!(UPSTREAM_FAILURES, "kind" => kind, "error" => err.kind()).increment(1);
        }

        result
    }
}
