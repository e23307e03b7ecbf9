//! Imaging procedures built on the hardware layer.
//!
//! - [`sequencer`] - single frames, timelapse series and z-stacks
//! - [`linear_depth`] / [`assignment`] - one frame per z-step from a focus sweep
//! - [`tracker`] / [`image_ops`] - locating the pipette tip in frames
//! - [`storage`] - where sequence output goes
//! - [`config`] - sequencer and tracker settings

pub mod assignment;
pub mod config;
pub mod image_ops;
pub mod linear_depth;
pub mod sequencer;
pub mod storage;
pub mod tracker;

pub use config::{SequencerConfig, TrackerConfig};
pub use linear_depth::{enforce_linear_z_stack, expected_depths};
pub use sequencer::{ImageSequencer, SequenceEvent, SequenceResult, SequencerProtocol};
pub use storage::{FrameStorage, MemoryStorage};
pub use tracker::{PipetteTracker, ReferenceKey, ReferenceSet, TipMatch};
