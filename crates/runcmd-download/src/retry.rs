use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{status_error_message, AttemptFailure, DownloadError, StatusClass};
use crate::redact::uri_for_logging;
use crate::strategy::DownloadStrategy;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest pause between two reads of a response. Bodies may take arbitrarily long overall.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
/// Pauses between retries. Injected so tests can record the schedule instead of waiting.
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Per-strategy retry budget with exponential backoff `base_delay * 2^attempt`.
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1_u32
            .checked_shl(u32::try_from(attempt).unwrap_or(u32::MAX))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Clone)]
pub struct Downloader {
    http: reqwest::Client,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl Downloader {
    pub fn new() -> Result<Self> {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }

    /// Bounds connection setup and each idle gap between reads, never the whole transfer.
    pub fn with_timeouts(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .context("failed to create download http client")?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Performs exactly one attempt with `strategy`. Non-success responses are dropped
    /// (closing the body) and turned into [`DownloadError::Status`].
    pub async fn download_once(
        &self,
        strategy: &DownloadStrategy,
    ) -> Result<reqwest::Response, DownloadError> {
        let request = strategy.build_request(&self.http).await?;
        let response = self
            .http
            .execute(request)
            .await
            .map_err(DownloadError::transport)?;
        let status = response.status().as_u16();
        if StatusClass::of(status) == StatusClass::Success {
            return Ok(response);
        }
        drop(response);
        Err(DownloadError::Status {
            status,
            strategy: strategy.kind(),
            message: status_error_message(
                strategy.kind(),
                &uri_for_logging(strategy.url()),
                status,
            ),
        })
    }

    /// Walks `strategies` in order and returns the first successful response.
    ///
    /// Access issues and non-transient failures move on to the next strategy at once;
    /// transient statuses are retried on the same strategy after a backoff sleep, up to the
    /// policy's attempt budget.
    pub async fn fetch(
        &self,
        strategies: &[DownloadStrategy],
    ) -> Result<reqwest::Response, DownloadError> {
        if strategies.is_empty() {
            return Err(DownloadError::NoStrategies);
        }

        let mut failures = Vec::new();
        for strategy in strategies {
            let kind = strategy.kind();
            let uri = uri_for_logging(strategy.url());
            for attempt in 0..self.policy.max_attempts.max(1) {
                let error = match self.download_once(strategy).await {
                    Ok(response) => {
                        info!(strategy = %kind, uri = %uri, attempt, "download succeeded");
                        return Ok(response);
                    }
                    Err(error) => error,
                };
                warn!(strategy = %kind, uri = %uri, attempt, error = %error, "download attempt failed");

                let status = error.status();
                failures.push(AttemptFailure {
                    strategy: kind,
                    attempt,
                    status,
                    message: error.to_string(),
                });

                let retry_same_strategy =
                    matches!(status.map(StatusClass::of), Some(StatusClass::Transient));
                if !retry_same_strategy {
                    debug!(strategy = %kind, ?status, "abandoning download strategy");
                    break;
                }
                if attempt + 1 < self.policy.max_attempts {
                    let delay = self.policy.delay_for(attempt);
                    debug!(strategy = %kind, delay_ms = delay.as_millis() as u64, "backing off before retry");
                    self.sleeper.sleep(delay).await;
                }
            }
        }
        Err(DownloadError::Exhausted { attempts: failures })
    }
}
