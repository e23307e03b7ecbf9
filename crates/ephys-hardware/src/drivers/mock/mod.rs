//! Simulated rig hardware for tests and the `ephys-sim` binary.
//!
//! Every mock is deterministic: motion is interpolated analytically from the
//! commanded segments, and camera frames are rendered from the device state at
//! their exact acquisition instants. Nothing sleeps longer than the simulated
//! hardware would.
//!
//! # Available Mock Drivers
//!
//! - [`MockStageDriver`] - motorized stage, linear interpolation, halt mid-move, stall injection
//! - [`MockCamera`] - camera with focus drive, shutter, focus hold and a rendered pipette tip
//! - [`MockPressure`] - pressure regulator with source selection
//! - [`MockClamp`] - amplifier with a test-pulse thread and scriptable resistance
//! - [`MockRig`] - all of the above wired together from one config

mod mock_camera;
mod mock_clamp;
mod mock_pressure;
mod mock_stage;
mod pattern;
mod rig;

pub use mock_camera::MockCamera;
pub use mock_clamp::MockClamp;
pub use mock_pressure::MockPressure;
pub use mock_stage::MockStageDriver;
pub use rig::MockRig;
