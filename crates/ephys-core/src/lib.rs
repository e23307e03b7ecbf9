//! `ephys-core`
//!
//! Core task and notification primitives for rig automation.
//!
//! Every long-running hardware operation in the rig (a stage move, a z-stack, a
//! state of the patch state machine) is represented by a [`Future`] running on
//! its own worker thread. Devices publish changes through [`Signal`]s and
//! [`Observable`]s, and place themselves in space through a tree of
//! [`TransformNode`]s.
//!
//! ## Key Types
//!
//! - [`Future`], [`TaskBuilder`], [`MultiFuture`]: cooperative tasks with cancellation
//! - [`Signal`], [`Observable`]: thread-safe publish/subscribe
//! - [`Transform3`], [`TransformNode`]: affine transforms and the device tree
//! - [`Frame`]: one acquired image with depth and frame-to-global mapping
//! - [`EphysError`]: the shared error type
//!
//! ## Example
//!
//! ```rust,no_run
//! use ephys_core::{Future, Result};
//! use std::time::Duration;
//!
//! # fn example() -> Result<()> {
//! let settle = Future::spawn("settle", |f| {
//!     f.sleep(Duration::from_millis(100))?;
//!     Ok(())
//! });
//! settle.wait(None)?;
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod error;
pub mod future;
pub mod limits;
pub mod observable;
pub mod signal;
pub mod transform;

pub use data::Frame;
pub use error::{EphysError, MultiError, Result};
pub use future::{Completion, Future, FutureStatus, MultiFuture, TaskBuilder};
pub use observable::Observable;
pub use signal::{Signal, SubscriptionId};
pub use transform::{Position, Transform3, TransformNode};
