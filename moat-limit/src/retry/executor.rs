use std::error::Error;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::debug;

use super::BackoffPolicy;
use super::RetryConfig;
use super::RetryPredicate;
use super::Sleeper;
use super::ThreadSleeper;
use crate::BoxError;
use crate::ConfigError;

/// Why a retry episode gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// Every attempt failed.
    MaxAttempts,
    /// The last failure was not eligible for retry.
    NotRetryable,
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhaustion::MaxAttempts => f.write_str("max attempts reached"),
            Exhaustion::NotRetryable => f.write_str("failure is not retryable"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("retry exhausted after {attempts} attempt(s): {exhaustion}")]
    Exhausted {
        attempts: u32,
        exhaustion: Exhaustion,
        #[source]
        cause: BoxError,
    },

    /// A backoff wait was interrupted. Always fatal.
    #[error("retry interrupted during backoff after {attempts} attempt(s)")]
    Interrupted {
        attempts: u32,
        #[source]
        cause: BoxError,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Interrupted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The last failure of the protected operation.
    pub fn cause(&self) -> &(dyn Error + Send + Sync + 'static) {
        match self {
            RetryError::Exhausted { cause, .. } | RetryError::Interrupted { cause, .. } => {
                cause.as_ref()
            }
        }
    }

    pub fn into_cause(self) -> BoxError {
        match self {
            RetryError::Exhausted { cause, .. } | RetryError::Interrupted { cause, .. } => cause,
        }
    }
}

/// Per-call retry state. Never shared between calls.
#[derive(Debug, Default)]
pub struct RetryContext {
    attempts: u32,
    last_error: Option<BoxError>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts started so far, the one in progress included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.last_error.as_deref()
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMetrics {
    pub max_attempts: u32,
    /// Episodes in which at least one retry was made.
    pub retry_times: u64,
    /// Retries made across every episode.
    pub total_retried_count: u64,
}

impl fmt::Display for RetryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} episode(s), {} retried attempt(s), max attempts {}",
            self.retry_times, self.total_retried_count, self.max_attempts
        )
    }
}

/// Executes operations under a retry policy.
///
/// The synchronous [`execute`](Self::execute) backs off on the calling
/// thread. Async callers drive the same policy through
/// [`RetryContext::begin_attempt`] and [`on_failure`](Self::on_failure),
/// sleeping on their own runtime.
#[derive(Debug)]
pub struct RetryOperations {
    name: String,
    config: RetryConfig,
    predicate: RetryPredicate,
    backoff: BackoffPolicy,
    retry_times: AtomicU64,
    total_retried_count: AtomicU64,
}

impl RetryOperations {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, ConfigError> {
        Self::with_sleeper(name, config, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(
        name: impl Into<String>,
        config: RetryConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            predicate: RetryPredicate::new(&config),
            backoff: BackoffPolicy::with_sleeper(config.backoff, sleeper),
            config,
            retry_times: AtomicU64::new(0),
            total_retried_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `op` until it succeeds or the policy gives up.
    ///
    /// # Errors
    ///
    /// [`RetryError::Exhausted`] carrying the last failure, or
    /// [`RetryError::Interrupted`] if a backoff wait was cut short.
    pub fn execute<T, F>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(&RetryContext) -> Result<T, BoxError>,
    {
        let mut ctx = RetryContext::new();
        loop {
            ctx.begin_attempt();
            match op(&ctx) {
                Ok(value) => return Ok(value),
                Err(err) => match self.on_failure(&mut ctx, err) {
                    ControlFlow::Continue(delay) => {
                        if let Err(interrupted) = self.backoff.sleep(delay) {
                            let cause = ctx
                                .last_error
                                .take()
                                .unwrap_or_else(|| Box::new(interrupted) as BoxError);
                            return Err(RetryError::Interrupted {
                                attempts: ctx.attempts,
                                cause,
                            });
                        }
                    }
                    ControlFlow::Break(err) => return Err(err),
                },
            }
        }
    }

    /// Classifies a failed attempt.
    ///
    /// Continues with the backoff to wait before the next attempt, or breaks
    /// with the error that ends the episode.
    pub fn on_failure(
        &self,
        ctx: &mut RetryContext,
        err: BoxError,
    ) -> ControlFlow<RetryError, Duration> {
        let exhaustion = if !self.predicate.is_retryable(err.as_ref()) {
            Some(Exhaustion::NotRetryable)
        } else if !self.predicate.has_budget(ctx.attempts) {
            Some(Exhaustion::MaxAttempts)
        } else {
            None
        };

        if let Some(exhaustion) = exhaustion {
            debug!(retry = %self.name, attempts = ctx.attempts, %exhaustion, "retry episode ended");
            return ControlFlow::Break(RetryError::Exhausted {
                attempts: ctx.attempts,
                exhaustion,
                cause: err,
            });
        }

        if ctx.attempts == 1 {
            self.retry_times.fetch_add(1, Ordering::Relaxed);
        }
        self.total_retried_count.fetch_add(1, Ordering::Relaxed);
        ctx.last_error = Some(err);
        ControlFlow::Continue(self.backoff.delay_for(ctx.attempts))
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            max_attempts: self.config.max_attempts,
            retry_times: self.retry_times.load(Ordering::Relaxed),
            total_retried_count: self.total_retried_count.load(Ordering::Relaxed),
        }
    }
}
