//! Cooperative task futures.
//!
//! A [`Future<T>`] represents a long-running hardware operation (a move, an
//! acquisition, a state of the patch state machine) that runs on its own worker
//! thread. The handle is cheap to clone; every clone observes the same task.
//!
//! # Lifecycle
//!
//! ```text
//! starting ──set_state()──▶ <label> ──task_done()──▶ complete
//!                                           │
//!                                           └──────▶ interrupted: <message>
//! ```
//!
//! `task_done` is the only transition to done and may run once. After that the
//! result, error and error message never change.
//!
//! # Cancellation
//!
//! Cancellation is cooperative. [`Future::stop`] only raises a flag; the task
//! observes it at a suspension point ([`Future::check_stop`], [`Future::sleep`],
//! [`Future::wait_for`]) which returns [`EphysError::Stopped`]. Propagating that
//! error with `?` ends the task and the worker wrapper completes the future as
//! interrupted.
//!
//! # Example
//!
//! ```rust,ignore
//! let fut = Future::spawn("settle", |f| {
//!     for i in 0..10 {
//!         f.set_percent_done(i as f64 * 10.0);
//!         f.sleep(Duration::from_millis(50))?;
//!     }
//!     Ok(42)
//! });
//! assert_eq!(fut.get_result(None)?, 42);
//! ```

use crate::error::{EphysError, MultiError, Result};
use crate::limits::{STOP_POLL_INTERVAL, WAIT_POLL_INTERVAL};
use crate::signal::{Signal, SubscriptionId};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type FinishCallback<T> = Box<dyn FnOnce(&Future<T>) + Send>;
type ErrorCallback = Box<dyn FnOnce(&EphysError) + Send>;

/// Label of a freshly constructed future.
pub const STATE_STARTING: &str = "starting";
/// Label of a future that completed successfully.
pub const STATE_COMPLETE: &str = "complete";

/// Snapshot of a future's public attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct FutureStatus {
    /// Task name.
    pub name: String,
    /// Current progress label.
    pub state: String,
    /// Whether the task finished.
    pub done: bool,
    /// Whether the task finished without completing.
    pub interrupted: bool,
    /// Whether a stop was requested.
    pub stop_requested: bool,
    /// Error message, tentative (stop reason) until done.
    pub error_message: Option<String>,
    /// Progress in percent, when known.
    pub percent_done: Option<f64>,
}

struct TaskState<T> {
    label: String,
    done: bool,
    interrupted: bool,
    stop_reason: Option<String>,
    error_message: Option<String>,
    error: Option<EphysError>,
    result: Option<T>,
    percent: Option<f64>,
    finish_callbacks: Vec<FinishCallback<T>>,
}

impl<T> TaskState<T> {
    fn stopped(&self) -> Option<EphysError> {
        self.stop_reason.as_ref().map(|r| EphysError::stopped(r.clone()))
    }
}

impl<T: Clone> TaskState<T> {
    fn outcome(&self) -> Result<T> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.interrupted {
            return Err(EphysError::Interrupted(
                self.error_message
                    .clone()
                    .unwrap_or_else(|| "no error message".to_string()),
            ));
        }
        self.result
            .clone()
            .ok_or_else(|| EphysError::ProtocolViolation("completed future has no result".into()))
    }
}

struct FutureInner<T> {
    name: String,
    start_time: DateTime<Utc>,
    state: Mutex<TaskState<T>>,
    changed: Condvar,
    // Serializes label and finish notifications so observers see them in issue order.
    notify: ReentrantMutex<()>,
    state_changed: Signal<String>,
}

/// Handle to a cooperative task.
pub struct Future<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Future")
            .field("name", &self.inner.name)
            .field("state", &st.label)
            .field("done", &st.done)
            .field("interrupted", &st.interrupted)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Create a pending future named `"future"`.
    pub fn new() -> Self {
        Self::named("future")
    }

    /// Create a pending future with a name used in logs and thread names.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(FutureInner {
                state_changed: Signal::new(format!("{name}.state_changed")),
                name,
                start_time: Utc::now(),
                state: Mutex::new(TaskState {
                    label: STATE_STARTING.to_string(),
                    done: false,
                    interrupted: false,
                    stop_reason: None,
                    error_message: None,
                    error: None,
                    result: None,
                    percent: None,
                    finish_callbacks: Vec::new(),
                }),
                changed: Condvar::new(),
                notify: ReentrantMutex::new(()),
            }),
        }
    }

    /// An already-completed future holding `value`.
    pub fn immediate(value: T) -> Self {
        let future = Self::named("immediate");
        future.complete(Ok(value), None);
        future
    }

    /// An already-failed future holding `error`.
    pub fn immediate_error(error: EphysError) -> Self {
        let future = Self::named("immediate");
        future.complete(Err(error), None);
        future
    }

    /// Run `task` on a named worker thread. See [`TaskBuilder`].
    pub fn spawn<F>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(&Future<T>) -> Result<T> + Send + 'static,
    {
        TaskBuilder::new(name).spawn(task)
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// When the future was constructed.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.start_time
    }

    /// Current progress label.
    pub fn state(&self) -> String {
        self.inner.state.lock().label.clone()
    }

    /// Whether the task finished.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Whether the task finished without completing.
    pub fn was_interrupted(&self) -> bool {
        self.inner.state.lock().interrupted
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.inner.state.lock().stop_reason.is_some()
    }

    /// Error message. Before completion this is the tentative stop reason.
    pub fn error_message(&self) -> Option<String> {
        self.inner.state.lock().error_message.clone()
    }

    /// The stored error of a failed task. `None` for stopped tasks.
    pub fn error(&self) -> Option<EphysError> {
        self.inner.state.lock().error.clone()
    }

    /// Snapshot of every public attribute under one lock.
    pub fn status(&self) -> FutureStatus {
        let st = self.inner.state.lock();
        FutureStatus {
            name: self.inner.name.clone(),
            state: st.label.clone(),
            done: st.done,
            interrupted: st.interrupted,
            stop_requested: st.stop_reason.is_some(),
            error_message: st.error_message.clone(),
            percent_done: Self::percent_of(&st),
        }
    }

    fn percent_of(st: &TaskState<T>) -> Option<f64> {
        if st.done && !st.interrupted {
            Some(100.0)
        } else {
            st.percent
        }
    }

    /// Progress in percent (0-100). Completed futures report 100.
    pub fn percent_done(&self) -> Option<f64> {
        Self::percent_of(&self.inner.state.lock())
    }

    /// Report progress. Clamped to 0-100; ignored after done.
    pub fn set_percent_done(&self, percent: f64) {
        let mut st = self.inner.state.lock();
        if !st.done {
            st.percent = Some(percent.clamp(0.0, 100.0));
        }
    }

    /// Update the progress label, notifying observers if it changed.
    pub fn set_state(&self, label: impl Into<String>) {
        let label = label.into();
        let _ordered = self.inner.notify.lock();
        {
            let mut st = self.inner.state.lock();
            if st.done || st.label == label {
                return;
            }
            st.label.clone_from(&label);
        }
        debug!(task = %self.inner.name, state = %label, "task state changed");
        self.inner.state_changed.emit(&label);
    }

    /// Observe label changes, including the final one.
    pub fn on_state_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.state_changed.connect(move |label: &String| callback(label))
    }

    /// Signal fired on label changes.
    pub fn state_changed(&self) -> &Signal<String> {
        &self.inner.state_changed
    }

    /// Ask the task to stop. Idempotent, and a no-op once done.
    ///
    /// The first reason wins and becomes the tentative error message.
    pub fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut st = self.inner.state.lock();
            if st.done || st.stop_reason.is_some() {
                return;
            }
            st.stop_reason = Some(reason.clone());
            st.error_message = Some(reason.clone());
        }
        self.inner.changed.notify_all();
        debug!(task = %self.inner.name, reason = %reason, "stop requested");
    }

    /// `Err(Stopped)` if a stop was requested.
    pub fn check_stop(&self) -> Result<()> {
        match self.inner.state.lock().stopped() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Like [`check_stop`](Self::check_stop), but keeps watching the flag for `delay`.
    pub fn check_stop_within(&self, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            self.check_stop()
        } else {
            self.sleep(delay)
        }
    }

    /// Sleep for `duration`, returning `Err(Stopped)` promptly if stopped.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.sleep_with_interval(duration, STOP_POLL_INTERVAL)
    }

    /// Sleep in slices of at most `interval`, checking the stop flag each slice.
    pub fn sleep_with_interval(&self, duration: Duration, interval: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let interval = interval.max(Duration::from_millis(1));
        let mut st = self.inner.state.lock();
        loop {
            if let Some(err) = st.stopped() {
                return Err(err);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let slice = interval.min(deadline - now);
            self.inner.changed.wait_for(&mut st, slice);
        }
    }

    /// Block until done or until `timeout` elapses. Returns whether the task is done.
    pub fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.inner.state.lock();
        while !st.done {
            match deadline {
                None => self.inner.changed.wait(&mut st),
                Some(deadline) => {
                    if self.inner.changed.wait_until(&mut st, deadline).timed_out() {
                        return st.done;
                    }
                }
            }
        }
        true
    }

    /// Block until done.
    ///
    /// Returns `Timeout` if `timeout` elapses first; the task keeps running.
    /// A failed task returns a clone of its stored error; an interrupted task
    /// without one returns `Interrupted`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.wait_until_done(timeout) {
            return Err(EphysError::Timeout {
                waited: timeout.unwrap_or_default(),
            });
        }
        let st = self.inner.state.lock();
        if let Some(err) = &st.error {
            return Err(err.clone());
        }
        if st.interrupted {
            return Err(EphysError::Interrupted(
                st.error_message
                    .clone()
                    .unwrap_or_else(|| "no error message".to_string()),
            ));
        }
        Ok(())
    }

    /// Wait, then return a clone of the result.
    pub fn get_result(&self, timeout: Option<Duration>) -> Result<T> {
        self.wait(timeout)?;
        self.inner.state.lock().outcome()
    }

    /// The outcome if done, without blocking.
    pub fn try_result(&self) -> Option<Result<T>> {
        let st = self.inner.state.lock();
        st.done.then(|| st.outcome())
    }

    /// Block this task on `other`.
    ///
    /// If this future is stopped while waiting, the stop is forwarded to `other`
    /// and `Stopped` is returned. A failure of `other` is returned to the caller.
    pub fn wait_for<U>(&self, other: &Future<U>, timeout: Option<Duration>) -> Result<U>
    where
        U: Clone + Send + 'static,
    {
        let started = Instant::now();
        loop {
            if let Some(reason) = self.inner.state.lock().stop_reason.clone() {
                other.stop(reason.clone());
                return Err(EphysError::stopped(reason));
            }
            let slice = match timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(EphysError::Timeout { waited: limit });
                    }
                    WAIT_POLL_INTERVAL.min(limit - elapsed)
                }
                None => WAIT_POLL_INTERVAL,
            };
            if other.wait_until_done(Some(slice)) {
                return other.inner.state.lock().outcome();
            }
        }
    }

    /// Run `callback` once the task is done.
    ///
    /// If the task is already done the callback runs before this returns.
    pub fn on_finish<F>(&self, callback: F)
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        let mut st = self.inner.state.lock();
        if st.done {
            drop(st);
            callback(self);
        } else {
            st.finish_callbacks.push(Box::new(callback));
        }
    }

    /// Complete the future. This is the only transition to done.
    ///
    /// `Ok` completes normally. `Err(Stopped)` marks the future interrupted with
    /// the stop reason as message. Any other error marks it interrupted and is
    /// stored for waiters. A second call fails with `ProtocolViolation`.
    pub fn task_done(&self, outcome: Result<T>, state_override: Option<String>) -> Result<()> {
        let _ordered = self.inner.notify.lock();
        let (label, callbacks) = {
            let mut st = self.inner.state.lock();
            if st.done {
                return Err(EphysError::ProtocolViolation(format!(
                    "task '{}' completed twice",
                    self.inner.name
                )));
            }
            match outcome {
                Ok(value) => {
                    st.result = Some(value);
                    st.error_message = None;
                }
                Err(EphysError::Stopped { reason }) => {
                    st.interrupted = true;
                    st.error_message = Some(reason);
                }
                Err(err) => {
                    st.interrupted = true;
                    st.error_message = Some(err.to_string());
                    st.error = Some(err);
                }
            }
            let label = match (state_override, &st.error_message) {
                (Some(label), _) => label,
                (None, Some(msg)) if st.interrupted => format!("interrupted: {msg}"),
                (None, _) => STATE_COMPLETE.to_string(),
            };
            st.label.clone_from(&label);
            st.done = true;
            (label, std::mem::take(&mut st.finish_callbacks))
        };
        self.inner.changed.notify_all();

        self.inner.state_changed.emit(&label);
        for callback in callbacks {
            callback(self);
        }
        Ok(())
    }

    fn complete(&self, outcome: Result<T>, state_override: Option<String>) {
        if let Err(err) = self.task_done(outcome, state_override) {
            warn!(task = %self.inner.name, error = %err, "ignored duplicate completion");
        }
    }

    /// Whether two handles refer to the same task.
    pub fn ptr_eq(&self, other: &Future<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// =============================================================================
// Task dispatch
// =============================================================================

/// Builds a future and dispatches its task on a dedicated worker thread.
///
/// The task receives the future so it can report progress and observe stops.
/// Its return value completes the future; `Err(Stopped)` marks it interrupted;
/// any other error is stored intact for waiters. Panics are caught and recorded.
pub struct TaskBuilder<T> {
    name: String,
    error_callbacks: Vec<ErrorCallback>,
    _result: PhantomData<fn() -> T>,
}

impl<T> TaskBuilder<T>
where
    T: Clone + Send + 'static,
{
    /// Start building a task called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error_callbacks: Vec::new(),
            _result: PhantomData,
        }
    }

    /// Register a callback for task failures. Stops do not trigger it.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&EphysError) + Send + 'static,
    {
        self.error_callbacks.push(Box::new(callback));
        self
    }

    /// Dispatch `task` and return its future immediately.
    pub fn spawn<F>(self, task: F) -> Future<T>
    where
        F: FnOnce(&Future<T>) -> Result<T> + Send + 'static,
    {
        let future = Future::named(self.name.clone());
        for callback in self.error_callbacks {
            future.on_finish(move |f| {
                if let Some(err) = f.error() {
                    callback(&err);
                }
            });
        }

        let worker = future.clone();
        let spawned = std::thread::Builder::new()
            .name(self.name)
            .spawn(move || run_task(&worker, task));
        if let Err(err) = spawned {
            future.complete(Err(EphysError::from(err)), None);
        }
        future
    }
}

fn run_task<T, F>(future: &Future<T>, task: F)
where
    T: Clone + Send + 'static,
    F: FnOnce(&Future<T>) -> Result<T>,
{
    let outcome = match catch_unwind(AssertUnwindSafe(|| task(future))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(EphysError::from(anyhow::anyhow!(
            "task panicked: {}",
            panic_message(payload.as_ref())
        ))),
    };
    match &outcome {
        Ok(_) => debug!(task = %future.name(), "task complete"),
        Err(err) if err.is_stop() => debug!(task = %future.name(), reason = %err, "task stopped"),
        Err(err) => warn!(task = %future.name(), error = %err, "task failed"),
    }
    future.complete(outcome, None);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// =============================================================================
// Type-erased completion and composites
// =============================================================================

/// Type-erased view of a task, used by composites that mix result types.
pub trait Completion: Send + Sync {
    /// Task name.
    fn name(&self) -> &str;
    /// Whether the task finished.
    fn is_done(&self) -> bool;
    /// Whether the task finished without completing.
    fn was_interrupted(&self) -> bool;
    /// Forward a stop request.
    fn stop(&self, reason: &str);
    /// The error `wait` would return, if the task is done and did not complete.
    fn failure(&self) -> Option<EphysError>;
    /// Block until done or timeout; returns whether done.
    fn wait_until_done(&self, timeout: Option<Duration>) -> bool;
    /// Progress in percent, when known.
    fn percent_done(&self) -> Option<f64>;
    /// Run `callback` once done (immediately if already done).
    fn on_done(&self, callback: Box<dyn FnOnce() + Send>);
}

impl<T> Completion for Future<T>
where
    T: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        Future::name(self)
    }

    fn is_done(&self) -> bool {
        Future::is_done(self)
    }

    fn was_interrupted(&self) -> bool {
        Future::was_interrupted(self)
    }

    fn stop(&self, reason: &str) {
        Future::stop(self, reason);
    }

    fn failure(&self) -> Option<EphysError> {
        let st = self.inner.state.lock();
        if st.done && st.interrupted {
            st.outcome().err()
        } else {
            None
        }
    }

    fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        Future::wait_until_done(self, timeout)
    }

    fn percent_done(&self) -> Option<f64> {
        Future::percent_done(self)
    }

    fn on_done(&self, callback: Box<dyn FnOnce() + Send>) {
        self.on_finish(move |_| callback());
    }
}

/// Composite of several tasks.
///
/// Done when every child is done; interrupted when any child was. Stopping it
/// stops every child.
#[derive(Clone)]
pub struct MultiFuture {
    children: Arc<Vec<Arc<dyn Completion>>>,
}

impl fmt::Debug for MultiFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiFuture")
            .field(
                "children",
                &self.children.iter().map(|c| c.name().to_string()).collect::<Vec<_>>(),
            )
            .field("done", &self.is_done())
            .finish()
    }
}

impl MultiFuture {
    /// Compose the given tasks.
    pub fn new<I, C>(children: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Completion + 'static,
    {
        Self::from_completions(
            children
                .into_iter()
                .map(|c| Arc::new(c) as Arc<dyn Completion>)
                .collect(),
        )
    }

    /// Compose already type-erased tasks.
    pub fn from_completions(children: Vec<Arc<dyn Completion>>) -> Self {
        Self {
            children: Arc::new(children),
        }
    }

    /// The composed tasks.
    pub fn children(&self) -> &[Arc<dyn Completion>] {
        &self.children
    }

    /// Whether every child is done.
    pub fn is_done(&self) -> bool {
        self.children.iter().all(|c| c.is_done())
    }

    /// Whether any child was interrupted.
    pub fn was_interrupted(&self) -> bool {
        self.children.iter().any(|c| c.was_interrupted())
    }

    /// Stop every child.
    pub fn stop(&self, reason: &str) {
        for child in self.children.iter() {
            child.stop(reason);
        }
    }

    /// Mean progress of the children that report one.
    pub fn percent_done(&self) -> Option<f64> {
        let known: Vec<f64> = self.children.iter().filter_map(|c| c.percent_done()).collect();
        if known.is_empty() {
            None
        } else {
            Some(known.iter().sum::<f64>() / known.len() as f64)
        }
    }

    /// Failures of finished children, in registration order.
    pub fn errors(&self) -> Vec<EphysError> {
        self.children.iter().filter_map(|c| c.failure()).collect()
    }

    /// Block until every child is done or `timeout` elapses.
    pub fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.children.iter().all(|child| {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            child.wait_until_done(remaining)
        })
    }

    /// Wait for every child.
    ///
    /// A single failure is returned as-is; several are wrapped in
    /// `MultipleFailures` with every error preserved.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.wait_until_done(timeout) {
            return Err(EphysError::Timeout {
                waited: timeout.unwrap_or_default(),
            });
        }
        let mut failures = self.errors();
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(EphysError::MultipleFailures(MultiError::new(failures))),
        }
    }

    /// Run `callback` once every child is done.
    pub fn on_finish<F>(&self, callback: F)
    where
        F: FnOnce(&MultiFuture) + Send + 'static,
    {
        if self.children.is_empty() {
            callback(self);
            return;
        }
        let remaining = Arc::new(AtomicUsize::new(self.children.len()));
        let slot: Arc<Mutex<Option<Box<dyn FnOnce(&MultiFuture) + Send>>>> =
            Arc::new(Mutex::new(Some(Box::new(callback))));
        for child in self.children.iter() {
            let remaining = Arc::clone(&remaining);
            let slot = Arc::clone(&slot);
            let me = self.clone();
            child.on_done(Box::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let callback = slot.lock().take();
                    if let Some(callback) = callback {
                        callback(&me);
                    }
                }
            }));
        }
    }
}

impl Completion for MultiFuture {
    fn name(&self) -> &str {
        "multi"
    }

    fn is_done(&self) -> bool {
        MultiFuture::is_done(self)
    }

    fn was_interrupted(&self) -> bool {
        MultiFuture::was_interrupted(self)
    }

    fn stop(&self, reason: &str) {
        MultiFuture::stop(self, reason);
    }

    fn failure(&self) -> Option<EphysError> {
        if !self.is_done() {
            return None;
        }
        self.wait(Some(Duration::ZERO)).err()
    }

    fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        MultiFuture::wait_until_done(self, timeout)
    }

    fn percent_done(&self) -> Option<f64> {
        MultiFuture::percent_done(self)
    }

    fn on_done(&self, callback: Box<dyn FnOnce() + Send>) {
        self.on_finish(move |_| callback());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_new_future_is_starting() {
        let f = Future::<i32>::named("pending");
        assert_eq!(f.state(), STATE_STARTING);
        assert!(!f.is_done());
        assert!(!f.was_interrupted());
        assert!(f.error_message().is_none());
    }

    #[test]
    fn test_task_done_is_permanent_and_single_shot() {
        let f = Future::<i32>::new();
        f.task_done(Ok(5), None).unwrap();
        assert!(f.is_done());
        assert_eq!(f.state(), STATE_COMPLETE);

        let second = f.task_done(Ok(6), None).unwrap_err();
        assert!(matches!(second, EphysError::ProtocolViolation(_)));
        assert!(f.is_done());
        assert_eq!(f.get_result(None).unwrap(), 5);
    }

    #[test]
    fn test_set_state_notifies_and_is_ignored_after_done() {
        let f = Future::<()>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        f.on_state_change(move |s| sink.lock().push(s.to_string()));

        f.set_state("moving");
        f.set_state("moving");
        f.set_state("settling");
        f.task_done(Ok(()), None).unwrap();
        f.set_state("late");

        assert_eq!(*seen.lock(), vec!["moving", "settling", "complete"]);
        assert_eq!(f.state(), "complete");
    }

    #[test]
    fn test_stop_is_observed_by_check_stop_and_sleep() {
        let f = Future::<()>::new();
        assert!(f.check_stop().is_ok());
        f.stop("enough");
        f.stop("ignored second reason");

        let err = f.check_stop().unwrap_err();
        assert!(err.is_stop());
        assert_eq!(err.to_string(), "enough");

        let started = Instant::now();
        assert!(f.sleep(Duration::from_secs(10)).unwrap_err().is_stop());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!f.is_done());
    }

    #[test]
    fn test_check_stop_within_zero_delay_is_immediate() {
        let f = Future::<()>::new();
        let started = Instant::now();
        assert!(f.check_stop_within(Duration::ZERO).is_ok());
        assert!(started.elapsed() < Duration::from_millis(50));

        f.stop("halt");
        let err = f.check_stop_within(Duration::ZERO).unwrap_err();
        assert!(err.is_stop());
        assert_eq!(err.to_string(), "halt");
    }

    #[test]
    fn test_check_stop_within_sees_a_late_stop() {
        let f = Future::<()>::new();
        let started = Instant::now();
        assert!(f.check_stop_within(Duration::from_millis(40)).is_ok());
        assert!(started.elapsed() >= Duration::from_millis(40));

        let stopper = f.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            stopper.stop("late");
        });
        let started = Instant::now();
        let err = f.check_stop_within(Duration::from_secs(10)).unwrap_err();
        handle.join().unwrap();
        assert!(err.is_stop());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    // Containers generic over the result type must not have to repeat the
    // future's method bounds.
    struct Pending<T> {
        future: Option<Future<T>>,
    }

    impl<T> Pending<T> {
        fn empty() -> Self {
            Self { future: None }
        }
    }

    #[test]
    fn test_future_can_be_held_without_bounds() {
        let mut pending = Pending::<Vec<u8>>::empty();
        assert!(pending.future.is_none());
        pending.future = Some(Future::immediate(vec![1, 2]));
        let held = pending.future.take().unwrap();
        assert_eq!(held.get_result(None).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_stop_after_done_is_silent() {
        let f = Future::immediate(1u8);
        f.stop("too late");
        assert!(!f.stop_requested());
        assert!(f.error_message().is_none());
        assert!(!f.was_interrupted());
    }

    #[test]
    fn test_on_finish_after_completion_runs_once_synchronously() {
        let f = Future::immediate("ok".to_string());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let me = f.clone();
        f.on_finish(move |done| {
            assert!(done.ptr_eq(&me));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_finish_before_completion_runs_once() {
        let f = Future::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        f.on_finish(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        f.task_done(Ok(1), None).unwrap();
        let _ = f.task_done(Ok(2), None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_immediate_result_and_error() {
        assert_eq!(Future::immediate("ok").get_result(None).unwrap(), "ok");

        let f = Future::<()>::immediate_error(EphysError::InvalidInput("bad target".into()));
        assert!(f.is_done());
        assert!(f.was_interrupted());
        let err = f.wait(None).unwrap_err();
        assert!(matches!(err, EphysError::InvalidInput(ref m) if m == "bad target"));
        assert_eq!(f.state(), "interrupted: bad target");
    }

    #[test]
    fn test_wrapped_task_error_is_returned_intact() {
        let f = Future::<()>::spawn("raiser", |_| Err(EphysError::InvalidInput("x".into())));
        let err = f.wait(Some(LONG)).unwrap_err();
        assert!(matches!(err, EphysError::InvalidInput(ref m) if m == "x"));
        assert_eq!(f.error_message().as_deref(), Some("x"));
    }

    #[test]
    fn test_wrapped_task_foreign_error_shares_original() {
        let f = Future::<()>::spawn("io", |_| Err(anyhow::anyhow!("port closed").into()));
        let first = f.wait(Some(LONG)).unwrap_err();
        let second = f.wait(Some(LONG)).unwrap_err();
        match (first, second) {
            (EphysError::Other(a), EphysError::Other(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("unexpected errors: {other:?}"),
        }
    }

    #[test]
    fn test_panicking_task_is_recorded() {
        let f = Future::<()>::spawn("boom", |_| panic!("kaboom"));
        let err = f.wait(Some(LONG)).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert!(f.was_interrupted());
    }

    #[test]
    fn test_on_error_fires_for_failures_only() {
        let failed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failed);
        let f = TaskBuilder::<()>::new("fails")
            .on_error(move |_| flag.store(true, Ordering::SeqCst))
            .spawn(|_| Err(EphysError::Configuration("no imager".into())));
        let _ = f.wait(Some(LONG));
        assert!(failed.load(Ordering::SeqCst));

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let f = TaskBuilder::<()>::new("stops")
            .on_error(move |_| flag.store(true, Ordering::SeqCst))
            .spawn(|f| loop {
                f.sleep(Duration::from_millis(20))?;
            });
        f.stop("halt");
        assert!(f.wait_until_done(Some(LONG)));
        assert!(!stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_timeout_does_not_cancel() {
        let f = Future::<u8>::spawn("slow", |f| {
            f.sleep(Duration::from_millis(100))?;
            Ok(7)
        });
        let err = f.wait(Some(Duration::from_millis(5))).unwrap_err();
        assert!(matches!(err, EphysError::Timeout { .. }));
        assert!(!f.stop_requested());
        assert_eq!(f.get_result(Some(LONG)).unwrap(), 7);
    }

    #[test]
    fn test_stop_propagates_through_wait_for() {
        let a = Future::<()>::spawn("sleep-forever", |f| loop {
            f.sleep(Duration::from_secs(1))?;
        });
        let a2 = a.clone();
        let b = Future::<()>::spawn("waiter", move |f| f.wait_for(&a2, None));

        b.stop("x");
        assert!(b.wait_until_done(Some(Duration::from_secs(1))));
        assert!(a.wait_until_done(Some(Duration::from_secs(1))));
        assert!(a.was_interrupted());
        assert!(b.was_interrupted());
        assert!(a.error_message().unwrap().contains('x'));
        assert!(b.error_message().unwrap().contains('x'));
    }

    #[test]
    fn test_wait_for_returns_other_failure() {
        let a = Future::<u8>::spawn("fails", |_| Err(EphysError::hardware("pump", "stalled")));
        let a2 = a.clone();
        let b = Future::<u8>::spawn("waiter", move |f| f.wait_for(&a2, None));
        let err = b.wait(Some(LONG)).unwrap_err();
        assert!(matches!(err, EphysError::HardwareFault { .. }));
    }

    #[test]
    fn test_percent_done_clamped() {
        let f = Future::<()>::new();
        assert_eq!(f.percent_done(), None);
        f.set_percent_done(150.0);
        assert_eq!(f.percent_done(), Some(100.0));
        f.set_percent_done(-3.0);
        assert_eq!(f.percent_done(), Some(0.0));
    }

    #[test]
    fn test_multi_future_done_and_interrupted() {
        let a = Future::<()>::new();
        let b = Future::<u8>::new();
        let c = Future::<String>::new();
        let multi = MultiFuture::from_completions(vec![
            Arc::new(a.clone()) as Arc<dyn Completion>,
            Arc::new(b.clone()) as Arc<dyn Completion>,
            Arc::new(c.clone()) as Arc<dyn Completion>,
        ]);

        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        multi.on_finish(move |m| {
            assert!(m.is_done());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.task_done(Ok(()), None).unwrap();
        b.task_done(Ok(1), None).unwrap();
        assert!(!multi.is_done());
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        c.task_done(Err(EphysError::stopped("user")), None).unwrap();
        assert!(multi.is_done());
        assert!(multi.was_interrupted());
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        let err = multi.wait(None).unwrap_err();
        assert!(matches!(err, EphysError::Interrupted(ref m) if m == "user"));
    }

    #[test]
    fn test_multi_future_aggregates_failures() {
        let a = Future::<()>::immediate_error(EphysError::InvalidInput("a".into()));
        let b = Future::<()>::immediate_error(EphysError::InvalidInput("b".into()));
        let c = Future::immediate(());
        let multi = MultiFuture::new(vec![a, b, c]);

        let err = multi.wait(None).unwrap_err();
        let multi_err = err.multi().unwrap();
        assert_eq!(multi_err.errors.len(), 2);
        assert_eq!(multi_err.primary().unwrap().to_string(), "a");
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<MultiError>().is_some());
    }

    #[test]
    fn test_multi_future_stop_reaches_children() {
        let a = Future::<()>::spawn("a", |f| loop {
            f.sleep(Duration::from_secs(1))?;
        });
        let b = Future::<()>::spawn("b", |f| loop {
            f.sleep(Duration::from_secs(1))?;
        });
        let multi = MultiFuture::new(vec![a.clone(), b.clone()]);
        multi.stop("abort");
        assert!(multi.wait_until_done(Some(LONG)));
        assert!(a.was_interrupted() && b.was_interrupted());
    }

    #[test]
    fn test_multi_future_percent_is_mean() {
        let a = Future::<()>::new();
        let b = Future::<()>::new();
        let c = Future::<()>::new();
        a.set_percent_done(20.0);
        b.set_percent_done(60.0);
        let multi = MultiFuture::new(vec![a, b, c]);
        assert_eq!(multi.percent_done(), Some(40.0));
    }
}
