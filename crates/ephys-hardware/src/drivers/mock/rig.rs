//! One-call assembly of a simulated rig.

use super::{MockCamera, MockClamp, MockPressure, MockStageDriver};
use crate::capabilities::StageDriver;
use crate::config::MockRigConfig;
use crate::pipette::Pipette;
use crate::stage::Stage;
use ephys_core::Result;
use std::sync::Arc;
use tracing::info;

/// Devices of a simulated rig, wired together.
///
/// The camera renders the pipette, so frames show the tip wherever the
/// manipulator puts it.
#[derive(Debug)]
pub struct MockRig {
    /// Camera, named `camera`.
    pub camera: Arc<MockCamera>,
    /// Focus drive simulation.
    pub focus_driver: Arc<MockStageDriver>,
    /// Manipulator simulation.
    pub manipulator_driver: Arc<MockStageDriver>,
    /// Pipette on the manipulator stage, named `pipette1`.
    pub pipette: Arc<Pipette>,
    /// Pressure regulator, named `pressure`.
    pub pressure: Arc<MockPressure>,
    /// Amplifier, named `clamp`.
    pub clamp: Arc<MockClamp>,
}

impl MockRig {
    /// Build every device from `config`.
    pub fn new(config: &MockRigConfig) -> Result<Self> {
        config.validate()?;
        let focus_driver = Arc::new(MockStageDriver::new(config.focus_drive.clone()));
        let focus = Stage::new(
            "focus",
            Arc::clone(&focus_driver) as Arc<dyn StageDriver>,
            config.focus.clone(),
        )?;
        let camera = MockCamera::new("camera", config.camera.clone(), focus, Arc::clone(&focus_driver))?;

        let manipulator_driver = Arc::new(MockStageDriver::new(config.manipulator_drive.clone()));
        let manipulator = Stage::new(
            "manipulator1",
            Arc::clone(&manipulator_driver) as Arc<dyn StageDriver>,
            config.manipulator.clone(),
        )?;
        let pipette = Pipette::new("pipette1", manipulator, config.pipette.clone())?;
        camera.attach_pipette(&pipette);

        let pressure = Arc::new(MockPressure::new("pressure", config.pressure_range));
        let clamp = MockClamp::new("clamp", config.clamp.clone());
        info!("mock rig assembled");
        Ok(Self {
            camera,
            focus_driver,
            manipulator_driver,
            pipette,
            pressure,
            clamp,
        })
    }

    /// The focus stage.
    pub fn focus(&self) -> &Arc<Stage> {
        self.camera.focus_stage()
    }

    /// Stop pollers and pending moves.
    pub fn shutdown(&self) {
        self.pipette.stage().shutdown();
        self.focus().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Imager;

    #[test]
    fn test_default_rig_shows_tip_in_focus() {
        let rig = MockRig::new(&MockRigConfig::default()).unwrap();
        let tip = rig.pipette.global_tip_position();
        assert_eq!(tip, [0.0, 0.0, 0.0]);
        assert_eq!(rig.camera.focus_depth().unwrap(), 0.0);

        let frame = rig.camera.frame_at(std::time::Instant::now());
        let (row, col) = frame.map_from_global(tip).unwrap();
        assert!(frame.image[[row.round() as usize, col.round() as usize - 1]] > 100.0);
        rig.shutdown();
    }
}
