//! Admission control for outgoing work
//!
//! An [`AdmissionController`] gates work on two conditions at once: a free
//! concurrency slot ([`ConcurrencyGate`]) and an available rate token
//! ([`RateBucket`]). Both counters live behind a single mutex so a slot and a
//! token are always taken together.
//!
//! Admission hands out an [`AdmissionPermit`]. Releasing it returns the slot
//! (the token is spent for good). Dropping an unreleased permit releases it,
//! so cancelled or panicking work never leaks a slot.
//!
//! ```rust
//! use backstop_engine::admission::{AdmissionConfig, AdmissionController};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AdmissionConfig::builder()
//!     .concurrency_limit(10)
//!     .rate_limit_per_second(20.0)
//!     .bucket_capacity(20)
//!     .build()?;
//! let controller = AdmissionController::new(config)?;
//!
//! let body = controller.run(|| async { "response" }).await;
//! assert_eq!(body, "response");
//! # Ok(())
//! # }
//! ```

mod concurrency_gate;
mod rate_bucket;

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use concurrency_gate::ConcurrencyGate;
use parking_lot::Mutex;
pub use rate_bucket::RateBucket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::config::{ConfigError, ConfigResult};
use crate::error::{AdmissionError, AdmissionResult};
use crate::time::{Clock, TokioClock};

/// Configuration for the admission controller
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// Maximum units of work in flight at once
    pub concurrency_limit: usize,
    /// Steady-state admissions per second
    pub rate_limit_per_second: f64,
    /// Burst size; the bucket starts full
    pub bucket_capacity: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { concurrency_limit: 10, rate_limit_per_second: 20.0, bucket_capacity: 20 }
    }
}

impl AdmissionConfig {
    /// Create a new configuration builder
    pub fn builder() -> AdmissionConfigBuilder {
        AdmissionConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::invalid("concurrency_limit", "must be greater than 0"));
        }
        if !self.rate_limit_per_second.is_finite() || self.rate_limit_per_second <= 0.0 {
            return Err(ConfigError::invalid(
                "rate_limit_per_second",
                "must be a finite value above 0",
            ));
        }
        if self.bucket_capacity == 0 {
            return Err(ConfigError::invalid("rate_bucket_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`AdmissionConfig`]
#[derive(Debug)]
pub struct AdmissionConfigBuilder {
    config: AdmissionConfig,
}

impl Default for AdmissionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionConfigBuilder {
    pub fn new() -> Self {
        Self { config: AdmissionConfig::default() }
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub fn rate_limit_per_second(mut self, rate: f64) -> Self {
        self.config.rate_limit_per_second = rate;
        self
    }

    pub fn bucket_capacity(mut self, capacity: u32) -> Self {
        self.config.bucket_capacity = capacity;
        self
    }

    pub fn build(self) -> ConfigResult<AdmissionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of the controller's counters
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionSnapshot {
    /// Permits currently held
    pub in_flight: usize,
    /// Concurrency limit
    pub limit: usize,
    /// Tokens in the bucket right now
    pub available_tokens: f64,
    /// Bucket capacity
    pub capacity: u32,
    /// Tasks currently suspended in `acquire`
    pub waiting: usize,
    /// Permits handed out since creation
    pub admitted_total: u64,
    /// Highest `in_flight` observed
    pub peak_in_flight: usize,
}

impl AdmissionSnapshot {
    /// Share of the concurrency limit in use (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.in_flight as f64 / self.limit as f64
    }

    /// Whether every concurrency slot is taken
    pub fn is_saturated(&self) -> bool {
        self.in_flight >= self.limit
    }

    /// Human-readable status line
    pub fn status_message(&self) -> String {
        format!(
            "Admission: {}/{} in flight ({:.1}% utilized), {:.1}/{} tokens, {} waiting",
            self.in_flight,
            self.limit,
            self.utilization() * 100.0,
            self.available_tokens,
            self.capacity,
            self.waiting
        )
    }
}

/// Counters guarded by the single admission lock
#[derive(Debug)]
struct Counters {
    bucket: RateBucket,
    gate: ConcurrencyGate,
}

enum Admission {
    Admitted(AdmissionPermit),
    GateFull,
    RateLimited(Duration),
}

struct Shared {
    config: AdmissionConfig,
    counters: Mutex<Counters>,
    released: Notify,
    clock: Arc<dyn Clock>,
    next_permit_id: AtomicU64,
    admitted_total: AtomicU64,
    waiting: AtomicUsize,
}

impl Shared {
    /// Take a slot and a token together, or report what is missing
    fn try_admit(self: &Arc<Self>) -> Admission {
        let mut counters = self.counters.lock();
        if !counters.gate.has_capacity() {
            return Admission::GateFull;
        }

        if !counters.bucket.try_take(self.clock.now()) {
            return Admission::RateLimited(counters.bucket.time_until_token());
        }
        let entered = counters.gate.enter();
        debug_assert!(entered, "gate capacity checked under the same lock");
        let in_flight = counters.gate.in_flight();
        drop(counters);

        let id = self.next_permit_id.fetch_add(1, Ordering::Relaxed);
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
        debug!(permit_id = id, in_flight, "Admitted");
        Admission::Admitted(AdmissionPermit { id, shared: Arc::clone(self), released: false })
    }

    fn release_slot(&self, permit_id: u64) {
        let left = {
            let mut counters = self.counters.lock();
            counters.gate.leave()
        };
        if left {
            debug!(permit_id, "Released");
            self.released.notify_waiters();
        } else {
            error!(permit_id, "Release without a held slot");
        }
    }
}

/// Counts a task as waiting for as long as it sits in `acquire`
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::Relaxed);
        Self(waiting)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Gate for concurrency and rate of new work
///
/// Cloning is cheap; clones share the same counters.
#[derive(Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    /// Create a controller driven by tokio's clock
    pub fn new(config: AdmissionConfig) -> ConfigResult<Self> {
        Self::with_clock(config, TokioClock)
    }

    /// Create a controller with a custom clock for the rate bucket.
    ///
    /// Only the bucket reads this clock. [`acquire`](Self::acquire) still
    /// sleeps on tokio time, so a [`MockClock`](crate::time::MockClock) suits
    /// [`try_acquire`](Self::try_acquire) and [`snapshot`](Self::snapshot)
    /// but leaves a rate-limited `acquire` waiting until the mock is advanced.
    pub fn with_clock(config: AdmissionConfig, clock: impl Clock) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, Arc::new(clock)))
    }

    /// Create a controller with default configuration
    pub fn with_defaults() -> Self {
        Self::from_parts(AdmissionConfig::default(), Arc::new(TokioClock))
    }

    fn from_parts(config: AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        let counters = Counters {
            bucket: RateBucket::new(
                config.bucket_capacity,
                config.rate_limit_per_second,
                clock.now(),
            ),
            gate: ConcurrencyGate::new(config.concurrency_limit),
        };

        Self {
            shared: Arc::new(Shared {
                config,
                counters: Mutex::new(counters),
                released: Notify::new(),
                clock,
                next_permit_id: AtomicU64::new(1),
                admitted_total: AtomicU64::new(0),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.config
    }

    /// Suspend until both a concurrency slot and a rate token are available
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self) -> AdmissionPermit {
        match self.admit(std::future::pending::<Infallible>()).await {
            Ok(permit) => permit,
            Err(never) => match never {},
        }
    }

    /// Like [`acquire`](Self::acquire), giving up once `cancel` fires
    #[instrument(level = "debug", skip(self, cancel))]
    pub async fn acquire_until_cancelled(
        &self,
        cancel: &CancellationToken,
    ) -> AdmissionResult<AdmissionPermit> {
        if cancel.is_cancelled() {
            return Err(AdmissionError::Cancelled);
        }
        self.admit(cancel.cancelled()).await.map_err(|()| {
            debug!("Admission cancelled while waiting");
            AdmissionError::Cancelled
        })
    }

    /// Admit without suspending; `None` when a slot or token is missing
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        match self.shared.try_admit() {
            Admission::Admitted(permit) => Some(permit),
            Admission::GateFull | Admission::RateLimited(_) => None,
        }
    }

    /// Release `permit` through this controller
    ///
    /// Fails on a second release or when the permit came from another
    /// controller.
    pub fn release(&self, permit: &mut AdmissionPermit) -> AdmissionResult<()> {
        if !Arc::ptr_eq(&self.shared, &permit.shared) {
            error!(permit_id = permit.id, "Permit released through a foreign controller");
            return Err(AdmissionError::ForeignPermit { permit_id: permit.id });
        }
        permit.release()
    }

    /// Acquire, run `work`, and release on every exit path
    pub async fn run<F, Fut, T>(&self, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let permit = self.acquire().await;
        let output = work().await;
        drop(permit);
        output
    }

    /// Current counters
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let (in_flight, limit, peak_in_flight, available_tokens) = {
            let counters = self.shared.counters.lock();
            (
                counters.gate.in_flight(),
                counters.gate.limit(),
                counters.gate.peak(),
                counters.bucket.available_at(self.shared.clock.now()),
            )
        };

        AdmissionSnapshot {
            in_flight,
            limit,
            available_tokens,
            capacity: self.shared.config.bucket_capacity,
            waiting: self.shared.waiting.load(Ordering::Relaxed),
            admitted_total: self.shared.admitted_total.load(Ordering::Relaxed),
            peak_in_flight,
        }
    }

    /// Admission loop; `cancelled` resolving aborts the wait with its output
    async fn admit<X>(&self, cancelled: impl Future<Output = X>) -> Result<AdmissionPermit, X> {
        tokio::pin!(cancelled);
        let _waiting = WaitingGuard::enter(&self.shared.waiting);

        loop {
            // Registered before the check so a release between the check and
            // the await is not lost.
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.shared.try_admit() {
                Admission::Admitted(permit) => return Ok(permit),
                Admission::GateFull => {
                    debug!("Concurrency limit reached, waiting for a release");
                    tokio::select! {
                        biased;
                        reason = &mut cancelled => return Err(reason),
                        () = released => {}
                    }
                }
                Admission::RateLimited(wait) => {
                    debug!(
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "Rate bucket empty, waiting for refill"
                    );
                    tokio::select! {
                        biased;
                        reason = &mut cancelled => return Err(reason),
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("AdmissionController")
            .field("in_flight", &snapshot.in_flight)
            .field("limit", &snapshot.limit)
            .field("available_tokens", &snapshot.available_tokens)
            .field("waiting", &snapshot.waiting)
            .finish()
    }
}

/// One held concurrency slot plus one spent rate token
///
/// Released exactly once: explicitly through [`release`](Self::release) or
/// implicitly on drop.
#[must_use = "dropping a permit releases it immediately"]
pub struct AdmissionPermit {
    id: u64,
    shared: Arc<Shared>,
    released: bool,
}

impl AdmissionPermit {
    /// Identifier unique within the issuing controller
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Return the concurrency slot; the rate token is not refunded
    pub fn release(&mut self) -> AdmissionResult<()> {
        if self.released {
            error!(permit_id = self.id, "Permit released twice");
            return Err(AdmissionError::AlreadyReleased { permit_id: self.id });
        }
        self.released = true;
        self.shared.release_slot(self.id);
        Ok(())
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release_slot(self.id);
        }
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
