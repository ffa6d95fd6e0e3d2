//! Resource fetch abstraction used by the poll loop

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

/// Result of one conditional fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<P> {
    /// The resource changed; `validator` identifies the new version
    Changed { validator: String, payload: P },
    /// The resource matches the validator sent with the request
    Unchanged,
    /// The fetch failed in a way worth trying again later
    TransientFailure(String),
}

/// Signal the interval adapts to, with the payload stripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleKind {
    Changed,
    Unchanged,
    Failed,
}

impl<P> FetchOutcome<P> {
    pub fn kind(&self) -> CycleKind {
        match self {
            Self::Changed { .. } => CycleKind::Changed,
            Self::Unchanged => CycleKind::Unchanged,
            Self::TransientFailure(_) => CycleKind::Failed,
        }
    }

    /// Shorthand for a `Changed` outcome
    pub fn changed(validator: impl Into<String>, payload: P) -> Self {
        Self::Changed { validator: validator.into(), payload }
    }

    /// Shorthand for a `TransientFailure` outcome
    pub fn failure(detail: impl Into<String>) -> Self {
        Self::TransientFailure(detail.into())
    }
}

/// Fetches a resource, sending the validator of the last seen version
///
/// Implementations own transport concerns. Anything other than "changed" or
/// "not modified" should come back as [`FetchOutcome::TransientFailure`].
#[async_trait]
pub trait ResourceFetcher<P>: Send + Sync {
    async fn fetch(&self, validator: Option<&str>) -> FetchOutcome<P>;
}

#[async_trait]
impl<P, T> ResourceFetcher<P> for Arc<T>
where
    P: Send + 'static,
    T: ResourceFetcher<P> + ?Sized,
{
    async fn fetch(&self, validator: Option<&str>) -> FetchOutcome<P> {
        (**self).fetch(validator).await
    }
}

/// Adapts an async closure into a [`ResourceFetcher`]
///
/// ```rust
/// use backstop_engine::poller::{FetchOutcome, FnFetcher};
///
/// let fetcher = FnFetcher::new(|validator: Option<String>| async move {
///     match validator.as_deref() {
///         Some("v1") => FetchOutcome::Unchanged,
///         _ => FetchOutcome::changed("v1", "body".to_string()),
///     }
/// });
/// # let _ = fetcher;
/// ```
#[derive(Debug, Clone)]
pub struct FnFetcher<F> {
    fetch: F,
}

impl<F> FnFetcher<F> {
    pub fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

#[async_trait]
impl<P, F, Fut> ResourceFetcher<P> for FnFetcher<F>
where
    P: Send + 'static,
    F: Fn(Option<String>) -> Fut + Send + Sync,
    Fut: Future<Output = FetchOutcome<P>> + Send,
{
    async fn fetch(&self, validator: Option<&str>) -> FetchOutcome<P> {
        (self.fetch)(validator.map(str::to_owned)).await
    }
}
