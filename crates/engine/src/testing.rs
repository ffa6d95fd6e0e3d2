//! Scripted fakes for exercising the engine without a network
//!
//! - [`ScriptedWork`]: a unit of work that plays back results in order
//! - [`ScriptedFetcher`]: a [`ResourceFetcher`] that plays back outcomes and
//!   records every call
//!
//! ```rust
//! use backstop_engine::retry::{policies::AlwaysRetry, RetryConfig, RetryExecutor};
//! use backstop_engine::testing::ScriptedWork;
//!
//! # async fn example() {
//! let work = ScriptedWork::new([Err("503"), Err("503")], Ok("done"));
//! let config = RetryConfig::builder().no_jitter().build().unwrap();
//! let executor = RetryExecutor::new(config, AlwaysRetry).unwrap();
//!
//! let value = executor.execute(|| work.call()).await.unwrap();
//! assert_eq!(value, "done");
//! assert_eq!(work.calls(), 3);
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::poller::{FetchOutcome, ResourceFetcher};

/// Plays back scripted results, then repeats a final one
#[derive(Debug)]
pub struct ScriptedWork<T, E> {
    script: Mutex<VecDeque<Result<T, E>>>,
    then: Result<T, E>,
    calls: AtomicU32,
}

impl<T: Clone, E: Clone> ScriptedWork<T, E> {
    pub fn new(script: impl IntoIterator<Item = Result<T, E>>, then: Result<T, E>) -> Self {
        Self { script: Mutex::new(script.into_iter().collect()), then, calls: AtomicU32::new(0) }
    }

    /// Produce the next scripted result
    pub async fn call(&self) -> Result<T, E> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.then.clone())
    }

    /// Times `call` has been invoked
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// One recorded fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    /// When the fetch started
    pub at: Instant,
    /// Validator sent with the fetch
    pub validator: Option<String>,
}

/// Fetcher that plays back scripted outcomes and records each call
#[derive(Debug)]
pub struct ScriptedFetcher<P> {
    script: Mutex<VecDeque<FetchOutcome<P>>>,
    then: FetchOutcome<P>,
    latency: Option<Duration>,
    calls: Mutex<Vec<FetchCall>>,
}

impl<P: Clone> ScriptedFetcher<P> {
    pub fn new(
        script: impl IntoIterator<Item = FetchOutcome<P>>,
        then: FetchOutcome<P>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            then,
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sleep for `latency` before answering each fetch
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every fetch so far, in order
    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    /// Gaps between consecutive fetch starts
    pub fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock();
        calls.windows(2).map(|pair| pair[1].at.duration_since(pair[0].at)).collect()
    }
}

#[async_trait]
impl<P> ResourceFetcher<P> for ScriptedFetcher<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn fetch(&self, validator: Option<&str>) -> FetchOutcome<P> {
        self.calls
            .lock()
            .push(FetchCall { at: Instant::now(), validator: validator.map(str::to_owned) });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.then.clone())
    }
}
