//! Resilient execution of network work.
//!
//! Backstop decides whether a failed unit of work is retried, how many units
//! may run at once, how fast new ones are admitted, and how often a polled
//! resource is checked. It never touches the wire: work and fetches are opaque
//! closures supplied by the caller.
//!
//! # Components
//!
//! - [`retry`]: exponential backoff with jitter around a unit of work
//! - [`admission`]: concurrency gate plus token bucket behind one permit
//! - [`poller`]: conditional polling with an adaptive interval and observers
//! - [`config`]: one explicit configuration value, loadable from TOML or env
//!
//! # Composition
//!
//! ```rust
//! use backstop_engine::admission::{AdmissionConfig, AdmissionController};
//! use backstop_engine::retry::{policies::AlwaysRetry, RetryConfig, RetryExecutor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let admission = AdmissionController::new(AdmissionConfig::default())?;
//! let executor = RetryExecutor::new(RetryConfig::default(), AlwaysRetry)?;
//!
//! let body = executor
//!     .execute(|| {
//!         let admission = admission.clone();
//!         async move { admission.run(|| async { Ok::<_, std::io::Error>("ok") }).await }
//!     })
//!     .await?;
//! assert_eq!(body, "ok");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod admission;
pub mod config;
pub mod error;
pub mod poller;
pub mod retry;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod testing;
pub mod time;

// Re-export commonly used types
// ------------------------
pub use admission::{
    AdmissionConfig, AdmissionConfigBuilder, AdmissionController, AdmissionPermit,
    AdmissionSnapshot,
};
pub use config::{ConfigError, ConfigResult, EngineConfig};
pub use error::{
    AdmissionError, AdmissionResult, BoxedError, Classify, Failure, FailureClass, PollerError,
    PollerResult, RetryError,
};
pub use poller::{
    FetchFailure, FetchOutcome, FnFetcher, ObserverRegistry, PollConfig, PollConfigBuilder,
    PollHandle, PollPhase, PollStatus, Poller, ResourceFetcher,
};
pub use retry::{
    retry, retry_with_policy, AttemptOutcome, RetryConfig, RetryConfigBuilder, RetryExecutor,
    RetryOutcome, RetryPolicy, RetryResult,
};
pub use time::{Clock, MockClock, TokioClock};
