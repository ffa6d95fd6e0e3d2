//! Observer registry for change notifications
//!
//! Callbacks are kept in registration order and keyed by an id, so
//! registering the same id twice is a no-op. Notification works on a
//! snapshot of the list taken up front, which lets callbacks (or other
//! tasks) register and unregister while a notification is running.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::BoxedError;

/// Callback invoked with each payload
pub type ObserverCallback<P> = Arc<dyn Fn(&P) -> Result<(), BoxedError> + Send + Sync>;

struct Observer<P> {
    id: String,
    callback: ObserverCallback<P>,
}

impl<P> Clone for Observer<P> {
    fn clone(&self) -> Self {
        Self { id: self.id.clone(), callback: Arc::clone(&self.callback) }
    }
}

/// Result of one `notify_all` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Callbacks that returned `Ok`
    pub delivered: usize,
    /// Callbacks that returned an error or panicked
    pub failed: usize,
}

/// Ordered, de-duplicated list of callbacks
///
/// Cloning is cheap; clones share the same list.
pub struct ObserverRegistry<P> {
    observers: Arc<RwLock<Vec<Observer<P>>>>,
}

impl<P> ObserverRegistry<P> {
    pub fn new() -> Self {
        Self { observers: Arc::new(RwLock::new(Vec::new())) }
    }

    /// Append a callback; returns `false` if `id` is already registered
    pub fn register<F>(&self, id: impl Into<String>, callback: F) -> bool
    where
        F: Fn(&P) -> Result<(), BoxedError> + Send + Sync + 'static,
    {
        let id = id.into();
        let mut observers = self.observers.write();
        if observers.iter().any(|observer| observer.id == id) {
            debug!(observer = %id, "Observer already registered");
            return false;
        }
        debug!(observer = %id, "Observer registered");
        observers.push(Observer { id, callback: Arc::new(callback) });
        true
    }

    /// Remove a callback; returns `false` if `id` was not registered
    pub fn unregister(&self, id: &str) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|observer| observer.id != id);
        observers.len() != before
    }

    pub fn contains(&self, id: &str) -> bool {
        self.observers.read().iter().any(|observer| observer.id == id)
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Registered ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.observers.read().iter().map(|observer| observer.id.clone()).collect()
    }

    /// Invoke every callback in registration order
    ///
    /// A callback that errors or panics is logged and skipped; the remaining
    /// callbacks still run and nothing propagates to the caller.
    pub fn notify_all(&self, payload: &P) -> NotifyReport {
        let snapshot: Vec<Observer<P>> = self.observers.read().clone();
        let mut report = NotifyReport::default();

        for observer in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| (observer.callback)(payload))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(observer = %observer.id, error = %e, "Observer failed");
                    report.failed += 1;
                }
                Err(panic) => {
                    warn!(
                        observer = %observer.id,
                        panic = panic_message(panic.as_ref()),
                        "Observer panicked"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

impl<P> Default for ObserverRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for ObserverRegistry<P> {
    fn clone(&self) -> Self {
        Self { observers: Arc::clone(&self.observers) }
    }
}

impl<P> fmt::Debug for ObserverRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry").field("ids", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        name: &'static str,
    ) -> impl Fn(&u32) -> Result<(), BoxedError> {
        let log = Arc::clone(log);
        move |value| {
            log.lock().push(format!("{name}:{value}"));
            Ok(())
        }
    }

    #[test]
    fn test_notifies_in_registration_order() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(registry.register("first", recorder(&log, "first")));
        assert!(registry.register("second", recorder(&log, "second")));

        let report = registry.notify_all(&7);

        assert_eq!(*log.lock(), vec!["first:7", "second:7"]);
        assert_eq!(report, NotifyReport { delivered: 2, failed: 0 });
    }

    #[test]
    fn test_duplicate_registration_is_ignored() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(registry.register("dashboard", recorder(&log, "a")));
        assert!(!registry.register("dashboard", recorder(&log, "b")));

        registry.notify_all(&1);
        assert_eq!(*log.lock(), vec!["a:1"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failing_observers_are_isolated() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register("errors", |_: &u32| Err("disk full".into()));
        registry.register("panics", |_: &u32| panic!("observer bug"));
        registry.register("healthy", recorder(&log, "healthy"));

        let report = registry.notify_all(&3);

        assert_eq!(report, NotifyReport { delivered: 1, failed: 2 });
        assert_eq!(*log.lock(), vec!["healthy:3"]);
    }

    #[test]
    fn test_registration_during_notification_uses_snapshot() {
        let registry: ObserverRegistry<u32> = ObserverRegistry::new();
        let inner = registry.clone();

        registry.register("spawner", move |_| {
            inner.register("late", |_| Ok(()));
            Ok(())
        });

        let report = registry.notify_all(&0);
        assert_eq!(report.delivered, 1);
        assert_eq!(registry.ids(), vec!["spawner".to_string(), "late".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let registry: ObserverRegistry<u32> = ObserverRegistry::new();
        registry.register("a", |_| Ok(()));

        assert!(registry.contains("a"));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.is_empty());
    }
}
