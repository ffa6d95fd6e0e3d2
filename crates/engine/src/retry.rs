//! Backoff retrier
//!
//! Wraps a unit of work in an explicit retry loop. Each failed attempt is
//! classified by a caller-supplied [`RetryPolicy`]: client failures are
//! returned immediately and unchanged, transient failures are retried after an
//! exponential delay with additive jitter until the retry budget runs out.
//!
//! The delay before retry `n` (0-based) is
//! `base_delay * backoff_factor^n + uniform(0, jitter_max)`, so the first
//! retry waits `base_delay`.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use backstop_engine::retry::{policies, RetryConfig, RetryExecutor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(200))
//!     .backoff_factor(2.0)
//!     .jitter_max(Duration::from_millis(50))
//!     .build()?;
//!
//! let executor = RetryExecutor::new(config, policies::AlwaysRetry)?;
//! let value = executor.execute(|| async { Ok::<_, std::io::Error>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{ConfigError, ConfigResult};
use crate::error::{Failure, FailureClass, RetryError};

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Decides whether a failed attempt is worth retrying
pub trait RetryPolicy<E> {
    /// Classify `error`, produced by the 0-based `attempt`
    fn classify(&self, error: &E, attempt: u32) -> FailureClass;
}

/// Result of a single attempt, produced once and never mutated
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    /// The attempt produced a value
    Success(T),
    /// The attempt failed in a way that may succeed on retry
    RetryableFailure(Failure<E>),
    /// The attempt failed with a client error; no retry will help
    FatalFailure(E),
}

impl<T, E> AttemptOutcome<T, E> {
    /// Build the outcome of `attempt` from its raw result using `policy`.
    ///
    /// Timeouts are always retryable.
    pub fn classify<P>(result: Result<T, Failure<E>>, policy: &P, attempt: u32) -> Self
    where
        P: RetryPolicy<E> + ?Sized,
    {
        match result {
            Ok(value) => Self::Success(value),
            Err(Failure::TimedOut { timeout }) => {
                Self::RetryableFailure(Failure::TimedOut { timeout })
            }
            Err(Failure::Error(error)) => match policy.classify(&error, attempt) {
                FailureClass::Transient => Self::RetryableFailure(Failure::Error(error)),
                FailureClass::Client => Self::FatalFailure(error),
            },
        }
    }
}

/// Configuration for retry behavior
///
/// Immutable once built; share it between executors through
/// [`RetryExecutor::with_shared_config`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Extra attempts allowed after the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied per retry (> 1)
    pub backoff_factor: f64,
    /// Upper bound of the uniform jitter added to each delay
    pub jitter_max: Duration,
    /// Optional cap on the exponential term (jitter is added on top)
    pub max_delay: Option<Duration>,
    /// Optional deadline for each individual attempt
    pub per_attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter_max: Duration::from_secs(1),
            max_delay: None,
            per_attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay", "must be greater than zero"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 1.0 {
            return Err(ConfigError::invalid("backoff_factor", "must be a finite value above 1"));
        }
        if let Some(max_delay) = self.max_delay {
            if max_delay < self.base_delay {
                return Err(ConfigError::invalid("max_delay", "must not be below base_delay"));
            }
        }
        if self.per_attempt_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("per_attempt_timeout", "must be greater than zero"));
        }
        Ok(())
    }

    /// Deterministic part of the delay before retry `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Full delay before retry `attempt`, including random jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_delay(attempt).saturating_add(self.jitter())
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(0.0..=self.jitter_max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Builder for [`RetryConfig`]
#[derive(Debug)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn jitter_max(mut self, jitter: Duration) -> Self {
        self.config.jitter_max = jitter;
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.config.jitter_max = Duration::ZERO;
        self
    }

    pub fn max_delay(mut self, cap: Duration) -> Self {
        self.config.max_delay = Some(cap);
        self
    }

    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_attempt_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Summary of one `execute` call
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: RetryResult<T, E>,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Each inter-attempt delay, in order
    pub delays: Vec<Duration>,
    /// Human-readable representation of the last failure, if any
    pub last_error: Option<String>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Total time spent sleeping between attempts
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// Runs work under a [`RetryConfig`] and a [`RetryPolicy`]
///
/// Each `execute` call is independent; the executor holds no mutable state.
pub struct RetryExecutor<P> {
    config: Arc<RetryConfig>,
    policy: P,
}

impl<P> RetryExecutor<P> {
    /// Create a new retry executor with the given configuration and policy.
    ///
    /// Fails with [`ConfigError::Invalid`] when `config` does not validate.
    pub fn new(config: RetryConfig, policy: P) -> ConfigResult<Self> {
        Self::with_shared_config(Arc::new(config), policy)
    }

    /// Create an executor reusing an already shared configuration
    pub fn with_shared_config(config: Arc<RetryConfig>, policy: P) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, policy })
    }

    /// Create with default configuration
    pub fn with_policy(policy: P) -> Self {
        Self { config: Arc::new(RetryConfig::default()), policy }
    }

    /// The configuration used by this executor
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    #[instrument(skip(self, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, None).await.into_result()
    }

    /// Execute an operation, stopping promptly once `cancel` fires.
    ///
    /// Both the in-flight attempt and the inter-attempt delay observe the
    /// token; cancellation yields [`RetryError::Cancelled`].
    #[instrument(skip(self, cancel, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute_until_cancelled<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, Some(cancel)).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, operation: F) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, None).await
    }

    async fn run<F, Fut, T, E>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        let mut delays = Vec::new();
        let mut last_error: Option<String> = None;

        loop {
            let attempts = attempt.saturating_add(1);
            debug!(
                attempt = attempts,
                allowed = self.config.max_attempts.saturating_add(1),
                "Executing operation"
            );

            let Some(result) = self.run_attempt(&mut operation, cancel).await else {
                debug!(attempt = attempts, "Execution cancelled during attempt");
                return RetryOutcome {
                    result: Err(RetryError::Cancelled),
                    attempts,
                    delays,
                    last_error,
                };
            };

            match AttemptOutcome::classify(result, &self.policy, attempt) {
                AttemptOutcome::Success(value) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return RetryOutcome { result: Ok(value), attempts, delays, last_error };
                }
                AttemptOutcome::FatalFailure(error) => {
                    warn!(attempt = attempts, error = ?error, "Client failure, not retrying");
                    return RetryOutcome {
                        last_error: Some(format!("{error:?}")),
                        result: Err(RetryError::Client { source: error }),
                        attempts,
                        delays,
                    };
                }
                AttemptOutcome::RetryableFailure(failure) => {
                    last_error = Some(format!("{failure:?}"));

                    if attempt >= self.config.max_attempts {
                        warn!(
                            attempts,
                            error = ?failure,
                            "All retry attempts exhausted"
                        );
                        return RetryOutcome {
                            result: Err(RetryError::Fatal { attempts, cause: failure }),
                            attempts,
                            delays,
                            last_error,
                        };
                    }

                    let delay = self.config.delay_for(attempt);
                    warn!(
                        attempt = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = ?failure,
                        "Operation failed, retrying"
                    );

                    if !sleep_unless_cancelled(delay, cancel).await {
                        debug!(attempt = attempts, "Execution cancelled during backoff");
                        return RetryOutcome {
                            result: Err(RetryError::Cancelled),
                            attempts,
                            delays,
                            last_error,
                        };
                    }
                    delays.push(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Run one attempt under the per-attempt timeout. `None` means cancelled.
    async fn run_attempt<F, Fut, T, E>(
        &self,
        operation: &mut F,
        cancel: Option<&CancellationToken>,
    ) -> Option<Result<T, Failure<E>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let timeout = self.config.per_attempt_timeout;
        let attempt = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result.map_err(Failure::Error),
                    Err(_) => Err(Failure::TimedOut { timeout: limit }),
                },
                None => operation().await.map_err(Failure::Error),
            }
        };

        match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => None,
                result = attempt => Some(result),
            },
            None => Some(attempt.await),
        }
    }
}

impl<P: Clone> Clone for RetryExecutor<P> {
    fn clone(&self) -> Self {
        Self { config: Arc::clone(&self.config), policy: self.policy.clone() }
    }
}

impl<P> fmt::Debug for RetryExecutor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor").field("config", &self.config).finish_non_exhaustive()
    }
}

/// Sleep for `delay`; returns `false` if cancelled first.
pub(crate) async fn sleep_unless_cancelled(
    delay: Duration,
    cancel: Option<&CancellationToken>,
) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            () = token.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

/// Convenience function to create a retry executor and execute an operation.
///
/// An invalid `config` is reported as the outer error before any attempt runs.
pub async fn retry_with_policy<F, Fut, T, E, P>(
    config: RetryConfig,
    policy: P,
    operation: F,
) -> ConfigResult<RetryResult<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    let executor = RetryExecutor::new(config, policy)?;
    Ok(executor.execute(operation).await)
}

/// Convenience function to retry with default configuration
pub async fn retry<F, Fut, T, E, P>(policy: P, operation: F) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    RetryExecutor::with_policy(policy).execute(operation).await
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::{FailureClass, RetryPolicy};
    use crate::error::Classify;

    /// Treats every failure as transient
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn classify(&self, _error: &E, _attempt: u32) -> FailureClass {
            FailureClass::Transient
        }
    }

    /// Treats every failure as a client failure
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn classify(&self, _error: &E, _attempt: u32) -> FailureClass {
            FailureClass::Client
        }
    }

    /// Retries while the predicate returns `true`
    #[derive(Debug, Clone)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn classify(&self, error: &E, attempt: u32) -> FailureClass {
            if (self.predicate)(error, attempt) {
                FailureClass::Transient
            } else {
                FailureClass::Client
            }
        }
    }

    /// Defers to the error's own [`Classify`] implementation
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ClassifiedRetry;

    impl<E: Classify> RetryPolicy<E> for ClassifiedRetry {
        fn classify(&self, error: &E, _attempt: u32) -> FailureClass {
            error.failure_class()
        }
    }
}
