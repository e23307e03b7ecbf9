//! # Rust Ephys
//!
//! Automation core for an electrophysiology rig: motorized stages, a camera on
//! a focus drive, patch pipettes with pressure control and a patch-clamp
//! amplifier.
//!
//! The workspace is split the same way the rig is:
//!
//! - [`ephys_core`]: cancellable [`Future`](ephys_core::Future) tasks,
//!   signals, observables, coordinate transforms and the shared error type.
//! - [`ephys_hardware`]: device traits, [`Stage`](ephys_hardware::Stage)
//!   motion with [`MoveFuture`](ephys_hardware::MoveFuture)s, the pipette
//!   positioner and mock drivers.
//! - [`ephys_imaging`]: the image sequencer with linear-depth z-stacks and the
//!   pipette tracker.
//! - [`ephys_patch`]: the patch pipette state machine, patch records and the
//!   event log.
//!
//! This crate adds the pieces an application needs on top:
//!
//! - [`config`]: one [`RigConfig`] for every component, loaded with Figment.
//! - [`logging`]: tracing subscriber setup.
//! - [`sim`]: the procedures behind the `ephys-sim` binary.

pub mod config;
pub mod logging;
pub mod sim;

pub use ephys_core;
pub use ephys_hardware;
pub use ephys_imaging;
pub use ephys_patch;

pub use config::RigConfig;
pub use logging::{OutputFormat, TracingConfig};
