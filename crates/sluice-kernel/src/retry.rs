//! Retry policy for remote storage calls.
//!
//! [`DefaultRetryPolicy`] is a general exponential-backoff policy.
//! [`ObjectStoreRetryer`] decorates any base policy with object-store
//! specific rules: connection-class errors get a fixed `2^(n+1)` second
//! backoff and chunked uploads always retry them. [`run_with_retry`] drives
//! an async operation under a policy and a cancellation token.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;
use crate::vfs::backends::ObjectError;

/// Operations that get the connection-error retry allowance.
pub const CHUNKED_UPLOAD_OPERATIONS: &[&str] = &["UploadPart"];

/// One retry decision input.
#[derive(Debug, Clone, Copy)]
pub struct RetryRequest<'a> {
    /// Remote operation name, e.g. `GetObject`, `UploadPart`.
    pub operation: &'a str,
    pub error: &'a ObjectError,
    /// Retries already performed for this operation.
    pub retry_count: u32,
    /// Explicit decision made upstream (cancellation, deadline).
    pub retryable: Option<bool>,
}

/// Decides whether and when a failed remote call is retried.
pub trait RetryPolicy: Send + Sync {
    fn max_retries(&self) -> u32;

    fn should_retry(&self, req: &RetryRequest<'_>) -> bool;

    /// Backoff before the next attempt. Called before the retry count is
    /// incremented for the current attempt.
    fn retry_delay(&self, req: &RetryRequest<'_>) -> Duration;
}

/// Exponential backoff with jitter, capped at `max_delay`.
///
/// Retries throttling, 5xx-style and transport failures.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    max_retries: u32,
    min_delay: Duration,
    max_delay: Duration,
}

const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "SlowDown",
    "EC2ThrottledException",
];

const TRANSIENT_CODES: &[&str] = &[
    "RequestError",
    "RequestTimeout",
    "RequestTimeoutException",
    "ResponseTimeout",
    "InternalError",
    "ServiceUnavailable",
    "ClientDisconnected",
];

impl DefaultRetryPolicy {
    pub fn new(max_retries: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.min_delay(), config.max_delay())
    }

    fn is_retryable_error(error: &ObjectError) -> bool {
        match error {
            ObjectError::NotFound(_) => false,
            ObjectError::Service { code, status, .. } => {
                THROTTLE_CODES.contains(&code.as_str())
                    || TRANSIENT_CODES.contains(&code.as_str())
                    || status.is_some_and(|s| s >= 500 && s != 501)
                    || *status == Some(429)
            }
        }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn should_retry(&self, req: &RetryRequest<'_>) -> bool {
        if let Some(retryable) = req.retryable {
            return retryable;
        }
        Self::is_retryable_error(req.error)
    }

    fn retry_delay(&self, req: &RetryRequest<'_>) -> Duration {
        let min_ms = self.min_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let shift = req.retry_count.min(32);
        let base = min_ms.saturating_mul(1u64 << shift).min(max_ms);
        let half = base / 2;
        let jitter = if base > half {
            rand::random::<u64>() % (base - half + 1)
        } else {
            0
        };
        Duration::from_millis((half + jitter).max(min_ms).min(max_ms))
    }
}

/// Object-store retry rules layered over a base policy.
#[derive(Debug, Clone)]
pub struct ObjectStoreRetryer<P> {
    base: P,
}

impl<P: RetryPolicy> ObjectStoreRetryer<P> {
    pub fn new(base: P) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &P {
        &self.base
    }
}

impl ObjectStoreRetryer<DefaultRetryPolicy> {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(DefaultRetryPolicy::from_config(config))
    }
}

fn is_chunked_upload(operation: &str) -> bool {
    CHUNKED_UPLOAD_OPERATIONS.contains(&operation)
}

impl<P: RetryPolicy> RetryPolicy for ObjectStoreRetryer<P> {
    fn max_retries(&self) -> u32 {
        self.base.max_retries()
    }

    fn should_retry(&self, req: &RetryRequest<'_>) -> bool {
        let retry = if self.max_retries() == 0 {
            false
        } else if let Some(retryable) = req.retryable {
            retryable
        } else if req.error.is_connection_error() && is_chunked_upload(req.operation) {
            true
        } else {
            self.base.should_retry(req)
        };
        debug!(
            operation = req.operation,
            retry,
            error = %req.error,
            "object store retry decision"
        );
        retry
    }

    fn retry_delay(&self, req: &RetryRequest<'_>) -> Duration {
        let delay = if self.max_retries() == 0 {
            Duration::ZERO
        } else if req.error.is_connection_error() {
            Duration::from_secs(1u64 << req.retry_count.saturating_add(1).min(32))
        } else {
            self.base.retry_delay(req)
        };
        debug!(
            operation = req.operation,
            attempt = req.retry_count + 1,
            max = self.max_retries(),
            ?delay,
            "object store retry backoff"
        );
        delay
    }
}

/// Run `op` until it succeeds, the policy declines, or `cancel` fires.
///
/// A cancelled token marks the failed request as not retryable, and a
/// backoff sleep in progress is cut short by cancellation.
pub async fn run_with_retry<T, F, Fut>(
    policy: &dyn RetryPolicy,
    operation: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ObjectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ObjectError>>,
{
    let mut retry_count = 0u32;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let req = RetryRequest {
            operation,
            error: &error,
            retry_count,
            retryable: cancel.is_cancelled().then_some(false),
        };
        if retry_count >= policy.max_retries() || !policy.should_retry(&req) {
            return Err(error);
        }
        let delay = policy.retry_delay(&req);
        tokio::select! {
            _ = cancel.cancelled() => return Err(error),
            _ = tokio::time::sleep(delay) => {}
        }
        retry_count += 1;
    }
}
