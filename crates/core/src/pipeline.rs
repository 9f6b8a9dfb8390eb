//! Resilience pipeline wrapped around every network operation.
//!
//! A call goes through two layers, outermost first:
//!
//! 1. **Admission** - one permit from the bulkhead of its [`OperationClass`].
//!    The permit is held until the call returns, retries included.
//! 2. **Retry** - the operation runs; the error tag decides what happens next:
//!    - [`ErrorKind::Authentication`]: back off, re-authenticate, retry
//!    - [`ErrorKind::Integrity`] / [`ErrorKind::TransientNetwork`]: back off, retry
//!    - anything else: returned immediately
//!
//! Each retryable class may fail `retry_count` times before its last error is
//! returned. Backoff is `base * 2^attempt` plus uniform jitter.

use crate::config::{RetryConfig, TransferConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::remote::Authenticator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bulkhead an operation is admitted through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Upload,
    Download,
    Generic,
}

impl OperationClass {
    pub fn as_str(&self) -> &str {
        match self {
            OperationClass::Upload => "upload",
            OperationClass::Download => "download",
            OperationClass::Generic => "generic",
        }
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fixed-capacity concurrency pool
pub struct Bulkhead {
    class: OperationClass,
    semaphore: Semaphore,
    capacity: usize,
}

impl Bulkhead {
    pub fn new(class: OperationClass, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            class,
            semaphore: Semaphore::new(capacity),
            capacity,
        }
    }

    /// Wait for a permit, giving up if `cancel` fires first
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SemaphorePermit<'_>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            permit = self.semaphore.acquire() => permit
                .map_err(|_| Error::Other(format!("{} pool closed", self.class))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Permit counts per pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub upload: usize,
    pub download: usize,
    pub generic: usize,
}

impl PoolLimits {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            upload: config.upload_connections,
            download: config.download_connections,
            generic: config.generic_connections,
        }
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

/// Retry cap and backoff schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures tolerated per error class
    pub retry_count: u32,
    pub backoff_base: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            retry_count: config.retry_count.max(1),
            backoff_base: config.backoff_base(),
            jitter_min: Duration::from_millis(config.jitter_min_ms),
            jitter_max: Duration::from_millis(config.jitter_max_ms.max(config.jitter_min_ms)),
        }
    }

    /// Policy with no waiting between attempts
    pub fn immediate(retry_count: u32) -> Self {
        Self {
            retry_count: retry_count.max(1),
            backoff_base: Duration::ZERO,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
        }
    }

    /// Delay before the retry following failure number `attempt`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.min(16));
        self.backoff_base.saturating_mul(multiplier)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// State of one logical retry sequence
#[derive(Debug)]
pub struct RetryContext {
    failures: HashMap<ErrorKind, u32>,
    /// Operation invocations so far
    pub attempts: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_delay: Duration,
    pub total_delay: Duration,
    start_time: Instant,
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            failures: HashMap::new(),
            attempts: 0,
            last_error_kind: None,
            last_delay: Duration::ZERO,
            total_delay: Duration::ZERO,
            start_time: Instant::now(),
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Count a failure of `kind`, returning that class's running total
    pub fn record_failure(&mut self, kind: ErrorKind) -> u32 {
        self.last_error_kind = Some(kind);
        let count = self.failures.entry(kind).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_delay(&mut self, delay: Duration) {
        self.last_delay = delay;
        self.total_delay += delay;
    }

    pub fn failures(&self, kind: ErrorKind) -> u32 {
        self.failures.get(&kind).copied().unwrap_or(0)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission, re-authentication and retry around network operations.
///
/// One instance is shared by every transfer of a client so the bulkheads bound
/// the process-wide number of in-flight calls per class.
pub struct ResiliencePipeline {
    upload: Bulkhead,
    download: Bulkhead,
    generic: Bulkhead,
    policy: RetryPolicy,
    authenticator: Arc<dyn Authenticator>,
    rng: Mutex<StdRng>,
}

impl ResiliencePipeline {
    pub fn new(
        limits: PoolLimits,
        policy: RetryPolicy,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            upload: Bulkhead::new(OperationClass::Upload, limits.upload),
            download: Bulkhead::new(OperationClass::Download, limits.download),
            generic: Bulkhead::new(OperationClass::Generic, limits.generic),
            policy,
            authenticator,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn bulkhead(&self, class: OperationClass) -> &Bulkhead {
        match class {
            OperationClass::Upload => &self.upload,
            OperationClass::Download => &self.download,
            OperationClass::Generic => &self.generic,
        }
    }

    /// Run `op` under the `class` bulkhead with the retry policy applied.
    ///
    /// `op` is invoked once per attempt. `cancel` is checked while waiting for
    /// a permit, before each attempt and during each backoff.
    pub async fn execute<T, F, Fut>(
        &self,
        class: OperationClass,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.bulkhead(class).acquire(cancel).await?;
        self.retry(class, cancel, op).await
    }

    async fn retry<T, F, Fut>(
        &self,
        class: OperationClass,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = RetryContext::new();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            ctx.record_attempt();
            let err = match op().await {
                Ok(value) => {
                    if ctx.attempts > 1 {
                        debug!(%class, attempts = ctx.attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = err.kind();
            if !kind.is_retryable() {
                return Err(err);
            }

            let failures = ctx.record_failure(kind);
            if failures >= self.policy.retry_count {
                warn!(
                    %class,
                    %kind,
                    attempts = ctx.attempts,
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    error = %err,
                    "retries exhausted"
                );
                return Err(err);
            }

            let delay = self.backoff(failures);
            ctx.record_delay(delay);
            warn!(
                %class,
                %kind,
                attempt = ctx.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying operation"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            if kind == ErrorKind::Authentication {
                debug!(%class, "re-authenticating before retry");
                self.authenticator.reauthenticate().await?;
            }
        }
    }

    /// Backoff after failure number `attempt`: `base * 2^attempt + jitter`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay(attempt);
        let (min, max) = (self.policy.jitter_min, self.policy.jitter_max);
        if max.is_zero() {
            return base;
        }

        let jitter_ms = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64)
        };
        base + Duration::from_millis(jitter_ms)
    }
}
