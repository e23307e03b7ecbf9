//! Rig hardware layer.
//!
//! - [`capabilities`] - traits each device kind implements
//! - [`stage`] / [`move_future`] - positioning devices and their moves
//! - [`pipette`] - stage-mounted pipettes addressed by tip position
//! - [`reservation`] - exclusive device leases for long procedures
//! - [`drivers::mock`] - simulated hardware
//! - [`config`] - serde configuration for all of the above

pub mod capabilities;
pub mod config;
pub mod drivers;
pub mod move_future;
pub mod pipette;
pub mod reservation;
pub mod stage;

pub use capabilities::*;
pub use config::{
    MockCameraConfig, MockClampConfig, MockRigConfig, MockStageConfig, PipetteConfig, PollerConfig, StageConfig,
};
pub use move_future::MoveFuture;
pub use pipette::Pipette;
pub use reservation::{DeviceLease, DeviceReservations};
pub use stage::{MoveEvent, PositionUpdate, Speed, Stage};
