//! Typed publish/subscribe signals.
//!
//! A [`Signal<T>`] is the notification primitive used by every device and task
//! in the rig. Observers either register a callback with [`Signal::connect`] or
//! take a channel receiver with [`Signal::subscribe`] (backed by
//! `tokio::sync::broadcast`, usable from plain threads via `blocking_recv`).
//!
//! # Ordering
//!
//! Emission is serialized per signal, so every observer sees payloads in a single
//! total order. Callbacks are invoked after the subscriber list lock has been
//! released, which lets a callback connect or disconnect observers (including
//! itself) without deadlocking. A callback may also emit on the same signal from
//! the emitting thread; the nested emission is delivered before the outer one
//! continues.
//!
//! Callbacks run on the emitting thread and must not block for long. Observers
//! that need to do real work should subscribe to the channel instead.

use parking_lot::{ReentrantMutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel behind [`Signal::subscribe`].
///
/// Slow channel subscribers that fall further behind than this observe
/// `RecvError::Lagged` and skip ahead.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// Handle returned by [`Signal::connect`], used to disconnect the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    name: String,
    callbacks: RwLock<Vec<(SubscriptionId, Callback<T>)>>,
    next_id: AtomicU64,
    emit_lock: ReentrantMutex<()>,
    sender: broadcast::Sender<T>,
}

/// A thread-safe, cheaply cloneable signal carrying payloads of type `T`.
///
/// Clones share the same subscriber list.
pub struct Signal<T>
where
    T: Clone + Send + 'static,
{
    inner: Arc<SignalInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("callbacks", &self.inner.callbacks.read().len())
            .field("channel_subscribers", &self.inner.sender.receiver_count())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new("signal")
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + 'static,
{
    /// Create a signal with a name used in logs and debug output.
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SignalInner {
                name: name.into(),
                callbacks: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                emit_lock: ReentrantMutex::new(()),
                sender,
            }),
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a callback invoked on every emission.
    pub fn connect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if it was already gone.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.inner.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Subscribe through a broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.inner.sender.subscribe()
    }

    /// Number of connected callbacks plus channel subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.callbacks.read().len() + self.inner.sender.receiver_count()
    }

    /// Deliver `value` to every callback, then to channel subscribers.
    pub fn emit(&self, value: &T) {
        let _ordered = self.inner.emit_lock.lock();
        let snapshot: Vec<Callback<T>> = self
            .inner
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in snapshot {
            callback(value);
        }

        // No receivers is not an error for a signal.
        let _ = self.inner.sender.send(value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_reaches_callbacks_in_order() {
        let signal = Signal::<u32>::new("numbers");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        signal.connect(move |v| sink.lock().push(*v));

        for i in 0..5 {
            signal.emit(&i);
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_disconnect_from_inside_callback() {
        let signal = Signal::<u32>::new("once");
        let count = Arc::new(Mutex::new(0));
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let sig = signal.clone();
        let counter = Arc::clone(&count);
        let slot = Arc::clone(&id_slot);
        let id = signal.connect(move |_| {
            *counter.lock() += 1;
            if let Some(id) = *slot.lock() {
                sig.disconnect(id);
            }
        });
        *id_slot.lock() = Some(id);

        signal.emit(&1);
        signal.emit(&2);
        assert_eq!(*count.lock(), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn test_channel_subscriber_receives_payloads() {
        let signal = Signal::<String>::new("labels");
        let mut rx = signal.subscribe();
        signal.emit(&"a".to_string());
        signal.emit(&"b".to_string());
        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
    }

    #[test]
    fn test_emission_is_totally_ordered_across_threads() {
        let signal = Signal::<usize>::new("ordered");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        signal.connect(move |v| sink.lock().push(*v));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sig = signal.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        sig.emit(&(t * 1000 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 400);
        // Per-thread order is preserved inside the global order.
        for t in 0..4 {
            let mine: Vec<_> = seen.iter().filter(|v| **v / 1000 == t).copied().collect();
            let mut sorted = mine.clone();
            sorted.sort_unstable();
            assert_eq!(mine, sorted);
        }
    }
}
