//! Poll loop state and the interval adaptation rules

use std::fmt;
use std::time::Duration;

use super::fetcher::CycleKind;
use super::PollConfig;

/// Lifecycle phase of a poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollPhase {
    /// Spawned, first fetch not started
    Idle,
    /// Fetching, or waiting after a successful cycle
    Polling,
    /// Waiting after a failed cycle
    BackingOff,
    /// Terminal
    Stopped,
}

impl fmt::Display for PollPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Polling => write!(f, "polling"),
            Self::BackingOff => write!(f, "backing_off"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Mutable state owned by a single poll loop
#[derive(Debug, Clone)]
pub struct PollState {
    current_interval: Duration,
    validator: Option<String>,
    active: bool,
    cycles: u64,
    changes: u64,
    unchanged: u64,
    failures: u64,
    consecutive_failures: u32,
}

impl PollState {
    /// Fresh state starting at the configured initial interval
    pub fn new(config: &PollConfig) -> Self {
        Self {
            current_interval: config
                .initial_interval
                .clamp(config.min_interval, config.max_interval),
            validator: None,
            active: true,
            cycles: 0,
            changes: 0,
            unchanged: 0,
            failures: 0,
            consecutive_failures: 0,
        }
    }

    /// Adapt the interval to one cycle's outcome and return the new interval
    ///
    /// A change shrinks the interval by `interval_step`, no change grows it by
    /// `interval_step`, and a failure grows it by `backoff_step`. The result is
    /// always clamped to `[min_interval, max_interval]`.
    pub fn apply(&mut self, kind: CycleKind, config: &PollConfig) -> Duration {
        let interval = self.current_interval;
        self.current_interval = match kind {
            CycleKind::Changed => interval.saturating_sub(config.interval_step),
            CycleKind::Unchanged => interval.saturating_add(config.interval_step),
            CycleKind::Failed => interval.saturating_add(config.backoff_step),
        }
        .clamp(config.min_interval, config.max_interval);

        self.cycles += 1;
        match kind {
            CycleKind::Changed => {
                self.changes += 1;
                self.consecutive_failures = 0;
            }
            CycleKind::Unchanged => {
                self.unchanged += 1;
                self.consecutive_failures = 0;
            }
            CycleKind::Failed => {
                self.failures += 1;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }

        self.current_interval
    }

    /// Remember the validator of the latest successful fetch
    pub fn set_validator(&mut self, validator: String) {
        self.validator = Some(validator);
    }

    pub fn validator(&self) -> Option<&str> {
        self.validator.as_deref()
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Snapshot for observers of the loop
    pub fn status(&self, phase: PollPhase) -> PollStatus {
        PollStatus {
            phase,
            interval: self.current_interval,
            validator: self.validator.clone(),
            cycles: self.cycles,
            changes: self.changes,
            unchanged: self.unchanged,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Published view of a poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollStatus {
    pub phase: PollPhase,
    /// Interval that will be (or is being) waited before the next fetch
    pub interval: Duration,
    /// Validator of the latest successful fetch
    pub validator: Option<String>,
    /// Completed fetch cycles
    pub cycles: u64,
    pub changes: u64,
    pub unchanged: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
}

impl PollStatus {
    pub fn is_stopped(&self) -> bool {
        self.phase == PollPhase::Stopped
    }
}
