//! Adaptive poller
//!
//! Repeatedly fetches one resource, sending the validator of the last seen
//! version so the fetcher can make a conditional request. The wait between
//! fetches adapts to what comes back:
//!
//! | Outcome | Next interval |
//! |---------|---------------|
//! | `Changed` | `max(min_interval, interval - interval_step)`, observers notified |
//! | `Unchanged` | `min(max_interval, interval + interval_step)` |
//! | `TransientFailure` | `min(max_interval, interval + backoff_step)` |
//!
//! The loop runs as a tokio task owned by a [`PollHandle`]. Stopping takes
//! effect at the next scheduling point: an in-flight fetch always completes.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use backstop_engine::poller::{FetchOutcome, FnFetcher, PollConfig, Poller};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PollConfig::builder()
//!     .min_interval(Duration::from_secs(5))
//!     .max_interval(Duration::from_secs(60))
//!     .build()?;
//!
//! let poller = Poller::<String>::new(config)?;
//! poller.register_observer("log", |body: &String| {
//!     println!("resource changed: {} bytes", body.len());
//!     Ok(())
//! });
//!
//! let handle = poller.start(FnFetcher::new(|_validator: Option<String>| async {
//!     FetchOutcome::changed("v1", "payload".to_string())
//! }));
//!
//! // ... application runs ...
//! handle.stop();
//! handle.join().await?;
//! # Ok(())
//! # }
//! ```

mod fetcher;
mod observer;
mod state;

use std::time::Duration;

pub use fetcher::{CycleKind, FetchOutcome, FnFetcher, ResourceFetcher};
pub use observer::{NotifyReport, ObserverCallback, ObserverRegistry};
pub use state::{PollPhase, PollState, PollStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::admission::AdmissionController;
use crate::config::{ConfigError, ConfigResult};
use crate::error::{BoxedError, PollerError, PollerResult};
use crate::retry::sleep_unless_cancelled;

/// Configuration for the adaptive poller
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Shortest wait between fetches
    pub min_interval: Duration,
    /// Longest wait between fetches
    pub max_interval: Duration,
    /// Wait after the first fetch is adapted from this value
    pub initial_interval: Duration,
    /// Shrink on change, growth on no change
    pub interval_step: Duration,
    /// Growth on failure
    pub backoff_step: Duration,
    /// Deadline for one fetch; exceeding it counts as a transient failure
    pub fetch_timeout: Option<Duration>,
    /// Stop after this many failures in a row; `None` backs off forever
    pub max_consecutive_failures: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            initial_interval: Duration::from_secs(5),
            interval_step: Duration::from_secs(5),
            backoff_step: Duration::from_secs(10),
            fetch_timeout: None,
            max_consecutive_failures: None,
        }
    }
}

impl PollConfig {
    /// Create a new configuration builder
    pub fn builder() -> PollConfigBuilder {
        PollConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_interval.is_zero() {
            return Err(ConfigError::invalid("min_interval", "must be greater than zero"));
        }
        if self.max_interval < self.min_interval {
            return Err(ConfigError::invalid("max_interval", "must not be below min_interval"));
        }
        if self.initial_interval < self.min_interval || self.initial_interval > self.max_interval
        {
            return Err(ConfigError::invalid(
                "initial_interval",
                "must lie within [min_interval, max_interval]",
            ));
        }
        if self.interval_step.is_zero() {
            return Err(ConfigError::invalid("interval_step", "must be greater than zero"));
        }
        if self.backoff_step.is_zero() {
            return Err(ConfigError::invalid("backoff_step", "must be greater than zero"));
        }
        if self.fetch_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("per_attempt_timeout", "must be greater than zero"));
        }
        if self.max_consecutive_failures == Some(0) {
            return Err(ConfigError::invalid("max_consecutive_failures", "must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`PollConfig`]
///
/// `initial_interval` follows `min_interval` unless set explicitly.
#[derive(Debug)]
pub struct PollConfigBuilder {
    config: PollConfig,
    initial_interval: Option<Duration>,
}

impl Default for PollConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PollConfigBuilder {
    pub fn new() -> Self {
        Self { config: PollConfig::default(), initial_interval: None }
    }

    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.config.min_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.config.max_interval = interval;
        self
    }

    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = Some(interval);
        self
    }

    pub fn interval_step(mut self, step: Duration) -> Self {
        self.config.interval_step = step;
        self
    }

    pub fn backoff_step(mut self, step: Duration) -> Self {
        self.config.backoff_step = step;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = Some(timeout);
        self
    }

    pub fn max_consecutive_failures(mut self, failures: u32) -> Self {
        self.config.max_consecutive_failures = Some(failures);
        self
    }

    pub fn build(mut self) -> ConfigResult<PollConfig> {
        self.config.initial_interval = self.initial_interval.unwrap_or(self.config.min_interval);
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Delivered to failure observers after each failed fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    /// Failure description from the fetcher, or the timeout
    pub detail: String,
    /// Failures in a row, including this one
    pub consecutive_failures: u32,
    /// Wait before the next fetch
    pub next_interval: Duration,
}

/// Builds poll loops sharing one configuration and observer list
pub struct Poller<P> {
    config: PollConfig,
    observers: ObserverRegistry<P>,
    failure_observers: ObserverRegistry<FetchFailure>,
    admission: Option<AdmissionController>,
}

impl<P> Poller<P>
where
    P: Send + Sync + 'static,
{
    /// Create a poller; fails on an invalid configuration
    pub fn new(config: PollConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            observers: ObserverRegistry::new(),
            failure_observers: ObserverRegistry::new(),
            admission: None,
        })
    }

    /// Hold an admission permit for the duration of every fetch
    pub fn with_admission(mut self, controller: AdmissionController) -> Self {
        self.admission = Some(controller);
        self
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Register a change observer; `false` if `id` is taken
    pub fn register_observer<F>(&self, id: impl Into<String>, callback: F) -> bool
    where
        F: Fn(&P) -> Result<(), BoxedError> + Send + Sync + 'static,
    {
        self.observers.register(id, callback)
    }

    /// Register a failure observer; `false` if `id` is taken
    pub fn register_failure_observer<F>(&self, id: impl Into<String>, callback: F) -> bool
    where
        F: Fn(&FetchFailure) -> Result<(), BoxedError> + Send + Sync + 'static,
    {
        self.failure_observers.register(id, callback)
    }

    pub fn observers(&self) -> &ObserverRegistry<P> {
        &self.observers
    }

    /// Spawn the poll loop on the current tokio runtime
    ///
    /// Loops started from the same poller share its observers.
    #[instrument(skip(self, fetcher), fields(min_ms = millis(self.config.min_interval)))]
    pub fn start<F>(&self, fetcher: F) -> PollHandle<P>
    where
        F: ResourceFetcher<P> + 'static,
    {
        let cancel = CancellationToken::new();
        let state = PollState::new(&self.config);
        let (status_tx, status_rx) = watch::channel(state.status(PollPhase::Idle));

        let poll_loop = PollLoop {
            config: self.config.clone(),
            fetcher,
            state,
            observers: self.observers.clone(),
            failure_observers: self.failure_observers.clone(),
            admission: self.admission.clone(),
            cancel: cancel.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(poll_loop.run());
        info!("Poll loop started");

        PollHandle {
            cancel,
            task: Some(task),
            status: status_rx,
            observers: self.observers.clone(),
            failure_observers: self.failure_observers.clone(),
        }
    }
}

impl<P> std::fmt::Debug for Poller<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("config", &self.config)
            .field("observers", &self.observers)
            .field("admission", &self.admission.is_some())
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct PollLoop<P, F> {
    config: PollConfig,
    fetcher: F,
    state: PollState,
    observers: ObserverRegistry<P>,
    failure_observers: ObserverRegistry<FetchFailure>,
    admission: Option<AdmissionController>,
    cancel: CancellationToken,
    status: watch::Sender<PollStatus>,
}

impl<P, F> PollLoop<P, F>
where
    P: Send + Sync + 'static,
    F: ResourceFetcher<P>,
{
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                debug!("Poll loop cancelled");
                break;
            }

            self.publish(PollPhase::Polling);
            let Some(outcome) = self.fetch().await else {
                debug!("Poll loop cancelled while waiting for admission");
                break;
            };

            let phase = self.handle(outcome);
            self.publish(phase);

            if let Some(limit) = self.config.max_consecutive_failures {
                if self.state.consecutive_failures() >= limit {
                    warn!(failures = limit, "Too many consecutive failures, stopping poll loop");
                    break;
                }
            }

            let interval = self.state.current_interval();
            if !sleep_unless_cancelled(interval, Some(&self.cancel)).await {
                debug!("Poll loop cancelled while waiting");
                break;
            }
        }

        self.state.deactivate();
        self.publish(PollPhase::Stopped);
        info!("Poll loop stopped");
    }

    /// One fetch under the optional admission permit and timeout. `None`
    /// means cancelled before the fetch started.
    async fn fetch(&self) -> Option<FetchOutcome<P>> {
        let _permit = match &self.admission {
            Some(controller) => Some(controller.acquire_until_cancelled(&self.cancel).await.ok()?),
            None => None,
        };

        let validator = self.state.validator();
        match self.config.fetch_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.fetcher.fetch(validator)).await {
                    Ok(outcome) => Some(outcome),
                    Err(_) => Some(FetchOutcome::TransientFailure(format!(
                        "fetch timed out after {timeout:?}"
                    ))),
                }
            }
            None => Some(self.fetcher.fetch(validator).await),
        }
    }

    /// Apply one outcome and return the phase to wait in
    fn handle(&mut self, outcome: FetchOutcome<P>) -> PollPhase {
        let kind = outcome.kind();
        let interval = self.state.apply(kind, &self.config);

        match outcome {
            FetchOutcome::Changed { validator, payload } => {
                debug!(validator = %validator, next_ms = millis(interval), "Resource changed");
                self.state.set_validator(validator);
                let report = self.observers.notify_all(&payload);
                if report.failed > 0 {
                    warn!(failed = report.failed, "Some observers failed");
                }
                PollPhase::Polling
            }
            FetchOutcome::Unchanged => {
                debug!(next_ms = millis(interval), "Resource unchanged");
                PollPhase::Polling
            }
            FetchOutcome::TransientFailure(detail) => {
                let consecutive_failures = self.state.consecutive_failures();
                warn!(
                    error = %detail,
                    consecutive_failures,
                    next_ms = millis(interval),
                    "Fetch failed, backing off"
                );
                self.failure_observers.notify_all(&FetchFailure {
                    detail,
                    consecutive_failures,
                    next_interval: interval,
                });
                PollPhase::BackingOff
            }
        }
    }

    fn publish(&self, phase: PollPhase) {
        // Receivers may all be gone; the loop keeps going regardless.
        self.status.send_replace(self.state.status(phase));
    }
}

/// Handle to a running poll loop
///
/// Dropping the handle while the loop runs cancels it.
pub struct PollHandle<P> {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    status: watch::Receiver<PollStatus>,
    observers: ObserverRegistry<P>,
    failure_observers: ObserverRegistry<FetchFailure>,
}

impl<P> PollHandle<P> {
    /// Request the loop to stop at its next scheduling point. Idempotent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Stopping poll loop");
            self.cancel.cancel();
        }
    }

    /// Whether the loop has reached `Stopped`
    pub fn is_stopped(&self) -> bool {
        self.status.borrow().is_stopped()
    }

    /// Latest published status
    pub fn status(&self) -> PollStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<PollStatus> {
        self.status.clone()
    }

    /// Register a change observer; `false` if `id` is taken
    pub fn register_observer<F>(&self, id: impl Into<String>, callback: F) -> bool
    where
        F: Fn(&P) -> Result<(), BoxedError> + Send + Sync + 'static,
    {
        self.observers.register(id, callback)
    }

    /// Register a failure observer; `false` if `id` is taken
    pub fn register_failure_observer<F>(&self, id: impl Into<String>, callback: F) -> bool
    where
        F: Fn(&FetchFailure) -> Result<(), BoxedError> + Send + Sync + 'static,
    {
        self.failure_observers.register(id, callback)
    }

    /// Wait for the loop to exit
    ///
    /// Does not stop the loop by itself; call [`stop`](Self::stop) first
    /// unless the loop ends on its own.
    pub async fn join(mut self) -> PollerResult<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| PollerError::TaskFailed(e.to_string())),
            None => Ok(()),
        }
    }

    /// Stop the loop and wait up to `timeout` for it to exit
    #[instrument(skip(self))]
    pub async fn shutdown(mut self, timeout: Duration) -> PollerResult<()> {
        self.stop();
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("Poll task panicked: {}", e);
                Err(PollerError::TaskFailed(e.to_string()))
            }
            Err(_) => {
                warn!("Poll task did not complete within timeout");
                Err(PollerError::JoinTimeout { timeout })
            }
        }
    }
}

impl<P> Drop for PollHandle<P> {
    fn drop(&mut self) {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) && !self.cancel.is_cancelled()
        {
            warn!("Poll handle dropped while running; cancelling loop");
            self.cancel.cancel();
        }
    }
}

impl<P> std::fmt::Debug for PollHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollHandle")
            .field("status", &*self.status.borrow())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::testing::ScriptedFetcher;

    fn config() -> PollConfig {
        PollConfig::builder()
            .min_interval(Duration::from_secs(5))
            .max_interval(Duration::from_secs(60))
            .interval_step(Duration::from_secs(5))
            .backoff_step(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(PollConfig::default().validate().is_ok());
        assert!(PollConfig::builder().min_interval(Duration::ZERO).build().is_err());
        assert!(PollConfig::builder()
            .min_interval(Duration::from_secs(10))
            .max_interval(Duration::from_secs(5))
            .build()
            .is_err());
        assert!(PollConfig::builder()
            .initial_interval(Duration::from_secs(120))
            .build()
            .is_err());
        assert!(PollConfig::builder().interval_step(Duration::ZERO).build().is_err());
        assert!(PollConfig::builder().max_consecutive_failures(0).build().is_err());
    }

    #[test]
    fn test_builder_initial_interval_follows_min() {
        let config = PollConfig::builder().min_interval(Duration::from_secs(2)).build().unwrap();
        assert_eq!(config.initial_interval, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_changes_reach_observers_and_validator_is_sent() {
        tokio::time::pause();
        let fetcher = Arc::new(ScriptedFetcher::new(
            [FetchOutcome::changed("v1", 10u32), FetchOutcome::Unchanged],
            FetchOutcome::changed("v2", 20u32),
        ));
        let poller = Poller::new(config()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        poller.register_observer("sink", move |value: &u32| {
            sink.lock().push(*value);
            Ok(())
        });

        let handle = poller.start(Arc::clone(&fetcher));
        let mut status = handle.subscribe();
        status.wait_for(|status| status.changes == 2).await.unwrap();
        handle.stop();
        handle.join().await.unwrap();

        assert_eq!(*seen.lock(), vec![10, 20]);
        let validators: Vec<Option<String>> =
            fetcher.calls().into_iter().map(|call| call.validator).collect();
        assert_eq!(validators[..3], [None, Some("v1".to_string()), Some("v1".to_string())]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_terminal() {
        tokio::time::pause();
        let poller: Poller<()> = Poller::new(config()).unwrap();
        let handle = poller.start(ScriptedFetcher::new([], FetchOutcome::Unchanged));

        let mut status = handle.subscribe();
        status.wait_for(|status| status.cycles >= 1).await.unwrap();
        handle.stop();
        handle.stop();
        status.wait_for(PollStatus::is_stopped).await.unwrap();

        assert!(handle.is_stopped());
        assert_eq!(handle.status().phase, PollPhase::Stopped);
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_notify_failure_observers_and_can_stop_loop() {
        tokio::time::pause();
        let config = PollConfig::builder()
            .min_interval(Duration::from_secs(5))
            .max_interval(Duration::from_secs(60))
            .backoff_step(Duration::from_secs(10))
            .max_consecutive_failures(3)
            .build()
            .unwrap();
        let poller: Poller<()> = Poller::new(config).unwrap();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        poller.register_failure_observer("alerts", move |failure: &FetchFailure| {
            sink.lock().push((failure.consecutive_failures, failure.next_interval.as_secs()));
            Ok(())
        });

        let handle = poller.start(ScriptedFetcher::new([], FetchOutcome::failure("503")));
        let mut status = handle.subscribe();
        let last = status.wait_for(PollStatus::is_stopped).await.unwrap().clone();

        assert_eq!(*failures.lock(), vec![(1, 15), (2, 25), (3, 35)]);
        assert_eq!(last.failures, 3);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out_as_failure() {
        tokio::time::pause();
        let config = PollConfig::builder()
            .min_interval(Duration::from_secs(5))
            .fetch_timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let poller: Poller<()> = Poller::new(config).unwrap();
        let fetcher =
            ScriptedFetcher::new([], FetchOutcome::Unchanged).with_latency(Duration::from_secs(30));

        let handle = poller.start(fetcher);
        let mut status = handle.subscribe();
        let snapshot = status.wait_for(|status| status.failures >= 1).await.unwrap().clone();

        assert_eq!(snapshot.phase, PollPhase::BackingOff);
        assert_eq!(snapshot.interval, Duration::from_secs(15));
        handle.stop();
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_loop() {
        tokio::time::pause();
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fetches);
        let poller: Poller<()> = Poller::new(config()).unwrap();
        let handle = poller.start(FnFetcher::new(move |_: Option<String>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { FetchOutcome::Unchanged }
        }));

        let mut status = handle.subscribe();
        status.wait_for(|status| status.cycles >= 1).await.unwrap();
        drop(handle);
        status.wait_for(PollStatus::is_stopped).await.unwrap();

        let after_stop = fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_fetch_holds_admission_permit() {
        tokio::time::pause();
        let controller = AdmissionController::with_defaults();
        let observed = Arc::new(AtomicUsize::new(0));
        let observer_view = controller.clone();
        let seen = Arc::clone(&observed);

        let poller: Poller<()> = Poller::new(config()).unwrap().with_admission(controller.clone());
        let handle = poller.start(FnFetcher::new(move |_: Option<String>| {
            seen.store(observer_view.snapshot().in_flight, Ordering::SeqCst);
            async { FetchOutcome::Unchanged }
        }));

        let mut status = handle.subscribe();
        status.wait_for(|status| status.cycles >= 1).await.unwrap();
        handle.stop();
        handle.join().await.unwrap();

        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(controller.snapshot().in_flight, 0);
    }
}
