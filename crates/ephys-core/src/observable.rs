//! Observable values
//!
//! Reactive device flags backed by `tokio::sync::watch` for multi-subscriber
//! notifications, plus a [`Signal`] for callback observers.
//!
//! Used for the pipette's `calibrated` flag and the patch pipette's `active`,
//! `tip_clean` and `tip_broken` flags.
//!
//! # Example
//!
//! ```rust,ignore
//! let clean = Observable::new("tip_clean", false)
//!     .with_description("Tip has been cleaned since the last patch attempt");
//!
//! clean.changed().connect(|v| tracing::info!(clean = *v, "tip flag changed"));
//! clean.set(true);
//! ```

use crate::signal::Signal;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

/// A thread-safe, observable value with change notifications.
///
/// Clones share the same value, description and subscribers.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    name: Arc<str>,
    description: Arc<RwLock<Option<String>>>,
    sender: watch::Sender<T>,
    changed: Signal<T>,
}

impl<T: Clone + Send + Sync + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("description", &*self.description.read())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            description: Arc::clone(&self.description),
            sender: self.sender.clone(),
            changed: self.changed.clone(),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let name: String = name.into();
        let (sender, _) = watch::channel(initial_value);
        Self {
            changed: Signal::new(format!("{name}.changed")),
            name: name.into(),
            description: Arc::new(RwLock::new(None)),
            sender,
        }
    }

    /// Add a description to this observable.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        *self.description.write() = Some(description.into());
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Name, unique within the owning device.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description, if one was given.
    pub fn description(&self) -> Option<String> {
        self.description.read().clone()
    }

    /// Set a new value, notifying all subscribers.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value.clone());
        self.changed.emit(&value);
    }

    /// Subscribe to value changes through a watch receiver.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Signal fired on every change.
    pub fn changed(&self) -> &Signal<T> {
        &self.changed
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Set only if the value differs. Returns whether a change was published.
    pub fn set_if_changed(&self, value: T) -> bool {
        if *self.sender.borrow() == value {
            return false;
        }
        self.set(value);
        true
    }
}
