//! Integration tests for the backoff retrier
//!
//! Exercises classification, attempt accounting and backoff timing through
//! the public API, in virtual time where delays matter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backstop_engine::admission::{AdmissionConfig, AdmissionController};
use backstop_engine::error::{Classify, FailureClass, RetryError};
use backstop_engine::retry::{policies, RetryConfig, RetryExecutor};
use backstop_engine::testing::ScriptedWork;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error type standing in for an HTTP client's failures
#[derive(Debug, Clone, PartialEq, Eq)]
enum ApiError {
    /// 4xx: the request itself is wrong
    BadRequest(u16),
    /// 5xx or connection trouble
    Unavailable(u16),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(status) => write!(f, "client error {status}"),
            Self::Unavailable(status) => write!(f, "server error {status}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl Classify for ApiError {
    fn failure_class(&self) -> FailureClass {
        match self {
            Self::BadRequest(_) => FailureClass::Client,
            Self::Unavailable(_) => FailureClass::Transient,
        }
    }
}

fn config(max_attempts: u32, base: Duration) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(max_attempts)
        .base_delay(base)
        .backoff_factor(2.0)
        .no_jitter()
        .build()
        .expect("valid retry config")
}

/// Validates that N transient failures followed by success cost N+1 calls.
///
/// # Test Steps
/// 1. Allow 3 retries
/// 2. Script three 503s, then success
/// 3. Verify the value comes back and exactly 4 calls were made
#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success() {
    let work = ScriptedWork::new(
        [
            Err(ApiError::Unavailable(503)),
            Err(ApiError::Unavailable(502)),
            Err(ApiError::Unavailable(504)),
        ],
        Ok("payload"),
    );
    let executor =
        RetryExecutor::new(config(3, Duration::from_millis(100)), policies::ClassifiedRetry)
            .expect("valid retry config");

    let result = executor.execute(|| work.call()).await;

    assert_eq!(result.expect("should succeed on the last attempt"), "payload");
    assert_eq!(work.calls(), 4);
}

/// Validates that a client error is returned unchanged after one call.
///
/// # Test Steps
/// 1. Script a 400 followed by a success that must never be reached
/// 2. Verify the error is `Client` carrying the original 400
/// 3. Confirm no time elapsed and exactly one call was made
#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let work = ScriptedWork::new([Err(ApiError::BadRequest(400))], Ok(()));
    let executor =
        RetryExecutor::new(config(5, Duration::from_secs(1)), policies::ClassifiedRetry)
            .expect("valid retry config");
    let start = Instant::now();

    let result = executor.execute(|| work.call()).await;

    match result {
        Err(RetryError::Client { source }) => assert_eq!(source, ApiError::BadRequest(400)),
        other => panic!("expected client error, got {other:?}"),
    }
    assert_eq!(work.calls(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

/// Validates the exact backoff schedule without jitter.
///
/// # Test Steps
/// 1. Configure 3 retries, base 1s, factor 2, no jitter
/// 2. Script two transient failures, then success
/// 3. Verify the recorded delays are 1s then 2s and 3 calls were made
/// 4. Confirm at least 3s of virtual time passed
#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_one_then_two_seconds() {
    let work = ScriptedWork::new(
        [Err(ApiError::Unavailable(503)), Err(ApiError::Unavailable(503))],
        Ok(42),
    );
    let executor =
        RetryExecutor::new(config(3, Duration::from_secs(1)), policies::ClassifiedRetry)
            .expect("valid retry config");
    let start = Instant::now();

    let outcome = executor.execute_with_outcome(|| work.call()).await;

    assert_eq!(outcome.delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.total_delay(), Duration::from_secs(3));
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert_eq!(outcome.into_result().expect("third attempt succeeds"), 42);
    assert_eq!(work.calls(), 3);
}

/// Validates that exhaustion reports the attempt count and last cause.
///
/// # Test Steps
/// 1. Allow 2 retries against a resource that always fails
/// 2. Verify `Fatal` with 3 attempts wrapping the last error
#[tokio::test(start_paused = true)]
async fn test_exhaustion_wraps_last_failure() {
    let work = ScriptedWork::new(
        [Err(ApiError::Unavailable(500)), Err(ApiError::Unavailable(502))],
        Err::<(), _>(ApiError::Unavailable(503)),
    );
    let executor =
        RetryExecutor::new(config(2, Duration::from_millis(10)), policies::ClassifiedRetry)
            .expect("valid retry config");

    let error = executor.execute(|| work.call()).await.expect_err("should give up");

    assert_eq!(error.attempts(), Some(3));
    assert_eq!(error.to_string(), "gave up after 3 attempts: server error 503");
    match error {
        RetryError::Fatal { cause, .. } => {
            assert_eq!(cause.into_error(), Some(ApiError::Unavailable(503)));
        }
        other => panic!("expected fatal failure, got {other:?}"),
    }
}

/// Validates that retried work keeps going through admission and never leaks
/// a permit.
///
/// # Test Steps
/// 1. Wrap each attempt in `AdmissionController::run`
/// 2. Fail twice, then succeed
/// 3. Verify three admissions happened and nothing is left in flight
#[tokio::test(start_paused = true)]
async fn test_retries_pass_through_admission() {
    let admission_config = AdmissionConfig::builder()
        .concurrency_limit(1)
        .rate_limit_per_second(10.0)
        .bucket_capacity(1)
        .build()
        .expect("valid admission config");
    let admission = AdmissionController::new(admission_config).expect("valid admission config");
    let work = ScriptedWork::new(
        [Err(ApiError::Unavailable(503)), Err(ApiError::Unavailable(503))],
        Ok("ok"),
    );
    let executor =
        RetryExecutor::new(config(3, Duration::from_millis(10)), policies::ClassifiedRetry)
            .expect("valid retry config");

    let result = executor.execute(|| admission.run(|| work.call())).await;

    assert_eq!(result.expect("should succeed"), "ok");
    let snapshot = admission.snapshot();
    assert_eq!(snapshot.admitted_total, 3);
    assert_eq!(snapshot.in_flight, 0);
}

/// Validates that cancellation during a long backoff ends execution
/// promptly.
///
/// # Test Steps
/// 1. Configure a 60s base delay
/// 2. Cancel the token 5s into the first backoff
/// 3. Verify `Cancelled` is returned well before the delay elapses
#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let executor = RetryExecutor::new(config(3, Duration::from_secs(60)), policies::AlwaysRetry)
        .expect("valid retry config");
    let token = CancellationToken::new();
    let canceller = token.clone();
    let start = Instant::now();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let result = executor
        .execute_until_cancelled(&token, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ApiError::Unavailable(503)) }
        })
        .await;

    assert!(result.expect_err("cancelled").is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_secs(60));
}

/// Validates that jittered delays stay within `[backoff, backoff + jitter]`.
///
/// # Test Steps
/// 1. Configure base 100ms, factor 2, jitter up to 50ms
/// 2. Fail three times, then succeed
/// 3. Verify each recorded delay sits within its jitter window
#[tokio::test(start_paused = true)]
async fn test_jittered_delays_stay_in_window() {
    let config = RetryConfig::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(100))
        .backoff_factor(2.0)
        .jitter_max(Duration::from_millis(50))
        .build()
        .expect("valid retry config");
    let work = ScriptedWork::new(
        [
            Err(ApiError::Unavailable(503)),
            Err(ApiError::Unavailable(503)),
            Err(ApiError::Unavailable(503)),
        ],
        Ok(()),
    );
    let executor =
        RetryExecutor::new(config, policies::ClassifiedRetry).expect("valid retry config");

    let outcome = executor.execute_with_outcome(|| work.call()).await;

    assert!(outcome.result.is_ok());
    for (index, delay) in outcome.delays.iter().enumerate() {
        let floor = Duration::from_millis(100 * (1 << index));
        assert!(*delay >= floor, "delay {index} below backoff: {delay:?}");
        assert!(
            *delay <= floor + Duration::from_millis(50),
            "delay {index} above window: {delay:?}"
        );
    }
}
