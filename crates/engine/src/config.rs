//! Engine configuration
//!
//! All tunables live in one explicit [`EngineConfig`] value that is passed to
//! the components at construction time. It can be built in code, parsed from
//! TOML, or overlaid with environment variables.
//!
//! ## Loading Strategy
//! 1. Start from the file given to [`EngineConfig::load`], or from defaults
//! 2. Overlay any `BACKSTOP_*` environment variables that are set
//! 3. Validate every section
//!
//! ## Environment Variables
//! - `BACKSTOP_MAX_ATTEMPTS`: extra retries after the first attempt
//! - `BACKSTOP_BASE_DELAY_MS`: delay before the first retry
//! - `BACKSTOP_BACKOFF_FACTOR`: exponential multiplier (> 1)
//! - `BACKSTOP_JITTER_MAX_MS`: upper bound of the additive jitter
//! - `BACKSTOP_MAX_DELAY_MS`: cap on the exponential backoff term
//! - `BACKSTOP_CONCURRENCY_LIMIT`: maximum simultaneous units of work
//! - `BACKSTOP_RATE_LIMIT_PER_SECOND`: steady admission rate
//! - `BACKSTOP_RATE_BUCKET_CAPACITY`: admission burst size
//! - `BACKSTOP_MIN_INTERVAL_MS` / `BACKSTOP_MAX_INTERVAL_MS`: poll bounds
//! - `BACKSTOP_INITIAL_INTERVAL_MS`: first poll interval
//! - `BACKSTOP_INTERVAL_STEP_MS`: poll interval change on change/no-change
//! - `BACKSTOP_BACKOFF_STEP_MS`: poll interval growth on failure
//! - `BACKSTOP_MAX_CONSECUTIVE_FAILURES`: failures in a row before a poller stops
//! - `BACKSTOP_PER_ATTEMPT_TIMEOUT_MS`: deadline for one attempt or fetch
//! - `BACKSTOP_LOG_FILTER` / `BACKSTOP_LOG_FORMAT`: subscriber settings
//!
//! ## Example
//!
//! ```rust
//! use backstop_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(
//!     r#"
//!     per_attempt_timeout_ms = 10000
//!
//!     [retry]
//!     max_attempts = 3
//!     base_delay_ms = 1000
//!
//!     [admission]
//!     concurrency_limit = 10
//!     rate_limit_per_second = 20.0
//!     rate_bucket_capacity = 20
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.admission.concurrency_limit, 10);
//! assert!(config.validate().is_ok());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::AdmissionConfig;
use crate::poller::PollConfig;
use crate::retry::RetryConfig;

/// Prefix shared by every recognized environment variable
pub const ENV_PREFIX: &str = "BACKSTOP_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is outside its allowed range
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    /// The configuration file could not be read
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment variable could not be parsed
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: String, value: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Deadline for a single attempt (retrier) or fetch (poller)
    #[serde(rename = "per_attempt_timeout_ms", with = "option_duration_millis")]
    pub per_attempt_timeout: Option<Duration>,
    pub retry: RetrySettings,
    pub admission: AdmissionSettings,
    pub poll: PollSettings,
    pub telemetry: TelemetrySettings,
}

/// Backoff retrier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    pub backoff_factor: f64,
    #[serde(rename = "jitter_max_ms", with = "duration_millis")]
    pub jitter_max: Duration,
    #[serde(rename = "max_delay_ms", with = "option_duration_millis")]
    pub max_delay: Option<Duration>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            backoff_factor: defaults.backoff_factor,
            jitter_max: defaults.jitter_max,
            max_delay: defaults.max_delay,
        }
    }
}

/// Admission controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionSettings {
    pub concurrency_limit: usize,
    pub rate_limit_per_second: f64,
    pub rate_bucket_capacity: u32,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        let defaults = AdmissionConfig::default();
        Self {
            concurrency_limit: defaults.concurrency_limit,
            rate_limit_per_second: defaults.rate_limit_per_second,
            rate_bucket_capacity: defaults.bucket_capacity,
        }
    }
}

/// Adaptive poller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSettings {
    #[serde(rename = "min_interval_ms", with = "duration_millis")]
    pub min_interval: Duration,
    #[serde(rename = "max_interval_ms", with = "duration_millis")]
    pub max_interval: Duration,
    /// Starting interval; defaults to `min_interval`
    #[serde(rename = "initial_interval_ms", with = "option_duration_millis")]
    pub initial_interval: Option<Duration>,
    #[serde(rename = "interval_step_ms", with = "duration_millis")]
    pub interval_step: Duration,
    #[serde(rename = "backoff_step_ms", with = "duration_millis")]
    pub backoff_step: Duration,
    /// Stop polling after this many consecutive failures; unbounded if unset
    pub max_consecutive_failures: Option<u32>,
}

impl Default for PollSettings {
    fn default() -> Self {
        let defaults = PollConfig::default();
        Self {
            min_interval: defaults.min_interval,
            max_interval: defaults.max_interval,
            initial_interval: None,
            interval_step: defaults.interval_step,
            backoff_step: defaults.backoff_step,
            max_consecutive_failures: defaults.max_consecutive_failures,
        }
    }
}

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other}")),
        }
    }
}

/// Log subscriber settings, used by `telemetry::init_tracing`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySettings {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self { log_filter: "info".to_string(), log_format: LogFormat::Pretty }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Load from an optional file, overlay the environment and validate
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let base = match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading engine configuration from file");
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        let config = base.with_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        tracing::info!("Engine configuration loaded");
        Ok(config)
    }

    /// Apply `BACKSTOP_*` overrides read through `lookup`
    pub fn with_env_overrides<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        if let Some(value) = env.parse("MAX_ATTEMPTS")? {
            self.retry.max_attempts = value;
        }
        if let Some(value) = env.millis("BASE_DELAY_MS")? {
            self.retry.base_delay = value;
        }
        if let Some(value) = env.parse("BACKOFF_FACTOR")? {
            self.retry.backoff_factor = value;
        }
        if let Some(value) = env.millis("JITTER_MAX_MS")? {
            self.retry.jitter_max = value;
        }
        if let Some(value) = env.millis("MAX_DELAY_MS")? {
            self.retry.max_delay = Some(value);
        }
        if let Some(value) = env.parse("CONCURRENCY_LIMIT")? {
            self.admission.concurrency_limit = value;
        }
        if let Some(value) = env.parse("RATE_LIMIT_PER_SECOND")? {
            self.admission.rate_limit_per_second = value;
        }
        if let Some(value) = env.parse("RATE_BUCKET_CAPACITY")? {
            self.admission.rate_bucket_capacity = value;
        }
        if let Some(value) = env.millis("MIN_INTERVAL_MS")? {
            self.poll.min_interval = value;
        }
        if let Some(value) = env.millis("MAX_INTERVAL_MS")? {
            self.poll.max_interval = value;
        }
        if let Some(value) = env.millis("INITIAL_INTERVAL_MS")? {
            self.poll.initial_interval = Some(value);
        }
        if let Some(value) = env.millis("INTERVAL_STEP_MS")? {
            self.poll.interval_step = value;
        }
        if let Some(value) = env.millis("BACKOFF_STEP_MS")? {
            self.poll.backoff_step = value;
        }
        if let Some(value) = env.parse("MAX_CONSECUTIVE_FAILURES")? {
            self.poll.max_consecutive_failures = Some(value);
        }
        if let Some(value) = env.millis("PER_ATTEMPT_TIMEOUT_MS")? {
            self.per_attempt_timeout = Some(value);
        }
        if let Some(value) = env.parse("LOG_FILTER")? {
            self.telemetry.log_filter = value;
        }
        if let Some(value) = env.parse("LOG_FORMAT")? {
            self.telemetry.log_format = value;
        }

        Ok(self)
    }

    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry_config()?;
        self.admission_config()?;
        self.poll_config()?;
        Ok(())
    }

    /// Build the retrier configuration
    pub fn retry_config(&self) -> ConfigResult<RetryConfig> {
        let config = RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: self.retry.base_delay,
            backoff_factor: self.retry.backoff_factor,
            jitter_max: self.retry.jitter_max,
            max_delay: self.retry.max_delay,
            per_attempt_timeout: self.per_attempt_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the admission controller configuration
    pub fn admission_config(&self) -> ConfigResult<AdmissionConfig> {
        let config = AdmissionConfig {
            concurrency_limit: self.admission.concurrency_limit,
            rate_limit_per_second: self.admission.rate_limit_per_second,
            bucket_capacity: self.admission.rate_bucket_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the poller configuration
    pub fn poll_config(&self) -> ConfigResult<PollConfig> {
        let config = PollConfig {
            min_interval: self.poll.min_interval,
            max_interval: self.poll.max_interval,
            initial_interval: self.poll.initial_interval.unwrap_or(self.poll.min_interval),
            interval_step: self.poll.interval_step,
            backoff_step: self.poll.backoff_step,
            fetch_timeout: self.per_attempt_timeout,
            max_consecutive_failures: self.poll.max_consecutive_failures,
        };
        config.validate()?;
        Ok(config)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: FromStr>(&self, suffix: &str) -> ConfigResult<Option<T>> {
        let name = format!("{ENV_PREFIX}{suffix}");
        match (self.lookup)(&name) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
            None => Ok(None),
        }
    }

    fn millis(&self, suffix: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse::<u64>(suffix)?.map(Duration::from_millis))
    }
}

/// Serialize a `Duration` as whole milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serialize an optional `Duration` as whole milliseconds
pub mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer
                .serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
