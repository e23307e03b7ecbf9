//! Error types shared by every rig crate.
//!
//! `EphysError` is the single error enum carried through futures, device
//! operations and the patch state machine. It is `Clone` because a failed
//! [`Future`](crate::future::Future) hands the *same* stored error to every
//! caller of `wait()`/`get_result()`; foreign errors are wrapped in an
//! `Arc<anyhow::Error>` so their chain and backtrace survive the clone.
//!
//! ## Error Categories
//!
//! - **Cancellation** - `Stopped`, `Interrupted`. Cooperative stops are expected by
//!   whoever requested them and are usually not reported as failures.
//! - **Waiting** - `Timeout`. The task keeps running; only the wait gave up.
//! - **Hardware** - `HardwareFault`. A driver rejected a command or a move missed its target.
//! - **Programming / setup** - `ProtocolViolation`, `Configuration`, `InvalidInput`.
//! - **Analysis** - `DetectionFailure` from the image-based tip tracker.
//! - **Composites** - `MultipleFailures`, whose `source()` is the [`MultiError`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the rig crates.
pub type Result<T> = std::result::Result<T, EphysError>;

/// Primary error type for the rig automation core.
#[derive(Error, Debug, Clone)]
pub enum EphysError {
    /// A stop was requested and observed at a suspension point.
    ///
    /// Returned by `Future::check_stop`, `Future::sleep` and `Future::wait_for`.
    /// Task bodies propagate it with `?`; the task wrapper then completes the
    /// future as interrupted with `reason` as its error message.
    ///
    /// **Error Type**: Expected - the caller asked for it.
    #[error("{reason}")]
    Stopped {
        /// Reason given to `stop()`.
        reason: String,
    },

    /// The awaited task finished interrupted without a more specific error.
    #[error("Task did not complete: {0}")]
    Interrupted(String),

    /// `wait()` gave up before the task finished.
    ///
    /// **Error Type**: Transient - the task is still running. Call `stop()` as well
    /// if the work itself should be abandoned.
    #[error("Timed out waiting for task after {waited:?}")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// A device reported an error or failed to reach a commanded state.
    ///
    /// **Recovery Strategy**: Put the hardware in a safe state (pressure to
    /// atmosphere, stop motion) and surface the message to the operator.
    #[error("Device '{device}' fault: {message}")]
    HardwareFault {
        /// Name of the device that failed.
        device: String,
        /// Human readable description.
        message: String,
    },

    /// An internal invariant was broken (double completion, overlapping leases).
    ///
    /// **Error Type**: Permanent - indicates a programming error.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Required configuration or calibration data is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The tip tracker could not locate the pipette with enough confidence.
    #[error("Detection failed: {0}")]
    DetectionFailure(String),

    /// Arguments were rejected before any hardware was touched.
    #[error("{0}")]
    InvalidInput(String),

    /// More than one child task of a composite failed.
    #[error("{} sub-tasks failed", .0.errors.len())]
    MultipleFailures(#[source] MultiError),

    /// Any other error, kept intact for its chain and backtrace.
    #[error("{0:#}")]
    Other(Arc<anyhow::Error>),
}

impl EphysError {
    /// Build a `Stopped` error.
    pub fn stopped(reason: impl Into<String>) -> Self {
        Self::Stopped {
            reason: reason.into(),
        }
    }

    /// Build a `HardwareFault` for `device`.
    pub fn hardware(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HardwareFault {
            device: device.into(),
            message: message.into(),
        }
    }

    /// True for cooperative cancellation.
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }

    /// The aggregated errors when this is a `MultipleFailures`.
    pub fn multi(&self) -> Option<&MultiError> {
        match self {
            Self::MultipleFailures(multi) => Some(multi),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for EphysError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(Arc::new(err))
    }
}

impl From<std::io::Error> for EphysError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Arc::new(anyhow::Error::new(err)))
    }
}

/// Every failure collected from the children of a composite task.
///
/// The first entry is the primary error; the rest are kept so nothing is lost.
#[derive(Error, Debug, Clone)]
#[error("multiple failures: {}", summarize(.errors))]
pub struct MultiError {
    /// Child errors in the order the children were registered.
    pub errors: Vec<EphysError>,
}

impl MultiError {
    /// Wrap a list of child failures.
    pub fn new(errors: Vec<EphysError>) -> Self {
        Self { errors }
    }

    /// The first failure.
    pub fn primary(&self) -> Option<&EphysError> {
        self.errors.first()
    }
}

fn summarize(errors: &[EphysError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
