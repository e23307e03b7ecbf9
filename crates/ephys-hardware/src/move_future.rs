//! Tracking of a single commanded move.
//!
//! A [`MoveFuture`] is created by [`Stage::move_to`](crate::stage::Stage::move_to)
//! after the driver accepted the command. A monitor thread polls the driver until
//! it reports motion has ended, then compares the final position with the target:
//!
//! - within tolerance: completes with the final position
//! - anywhere else: fails with a `HardwareFault` naming both positions
//! - stop requested: halts the driver and completes interrupted

use crate::capabilities::StageDriver;
use ephys_core::limits::MOVE_MONITOR_INTERVAL;
use ephys_core::{Completion, EphysError, Future, Position, Result, TaskBuilder};
use parking_lot::ReentrantMutex;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Callback receiving every position the monitor reads.
pub type PositionSink = Box<dyn Fn(Position) + Send + Sync>;

/// A stage driver and the lock every access to its device goes through.
#[derive(Clone)]
pub(crate) struct DeviceAccess {
    pub(crate) driver: Arc<dyn StageDriver>,
    pub(crate) lock: Arc<ReentrantMutex<()>>,
}

impl DeviceAccess {
    #[cfg(test)]
    pub(crate) fn new(driver: Arc<dyn StageDriver>) -> Self {
        Self {
            driver,
            lock: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Motion flag and position, read under the device lock.
    fn poll(&self) -> Result<(bool, Position)> {
        let _lock = self.lock.lock();
        Ok((self.driver.is_moving()?, self.driver.read_position()?))
    }
}

/// Future of one stage move, resolving to the final position.
///
/// Dereferences to the underlying [`Future<Position>`].
#[derive(Clone, Debug)]
pub struct MoveFuture {
    future: Future<Position>,
    device: String,
    start_position: Position,
    target_position: Position,
    speed: f64,
}

impl MoveFuture {
    /// Spawn the monitor for a move the driver has already started.
    pub(crate) fn monitor(
        device: &str,
        access: DeviceAccess,
        start_position: Position,
        target_position: Position,
        speed: f64,
        tolerance: f64,
        on_position: PositionSink,
    ) -> Self {
        let name = device.to_string();
        let future = TaskBuilder::new(format!("{device}-move")).spawn(move |f| {
            run_monitor(
                f,
                &name,
                &access,
                start_position,
                target_position,
                tolerance,
                &on_position,
            )
        });
        Self {
            future,
            device: device.to_string(),
            start_position,
            target_position,
            speed,
        }
    }

    /// A move that is already finished at `position`.
    pub fn immediate(device: &str, position: Position, speed: f64) -> Self {
        Self {
            future: Future::immediate(position),
            device: device.to_string(),
            start_position: position,
            target_position: position,
            speed,
        }
    }

    /// The wrapped future.
    pub fn as_future(&self) -> &Future<Position> {
        &self.future
    }

    /// Name of the moving device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Position when the move was requested.
    pub fn start_position(&self) -> Position {
        self.start_position
    }

    /// Absolute target.
    pub fn target_position(&self) -> Position {
        self.target_position
    }

    /// Resolved speed in m/s.
    pub fn speed(&self) -> f64 {
        self.speed
    }
}

impl Deref for MoveFuture {
    type Target = Future<Position>;

    fn deref(&self) -> &Self::Target {
        &self.future
    }
}

impl Completion for MoveFuture {
    fn name(&self) -> &str {
        self.future.name()
    }

    fn is_done(&self) -> bool {
        self.future.is_done()
    }

    fn was_interrupted(&self) -> bool {
        self.future.was_interrupted()
    }

    fn stop(&self, reason: &str) {
        self.future.stop(reason);
    }

    fn failure(&self) -> Option<EphysError> {
        Completion::failure(&self.future)
    }

    fn wait_until_done(&self, timeout: Option<Duration>) -> bool {
        self.future.wait_until_done(timeout)
    }

    fn percent_done(&self) -> Option<f64> {
        self.future.percent_done()
    }

    fn on_done(&self, callback: Box<dyn FnOnce() + Send>) {
        Completion::on_done(&self.future, callback);
    }
}

/// Format a position for messages, in meters.
pub fn format_position(p: Position) -> String {
    format!("[{:.7}, {:.7}, {:.7}]", p[0], p[1], p[2])
}

pub(crate) fn distance(a: Position, b: Position) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn run_monitor(
    f: &Future<Position>,
    device: &str,
    access: &DeviceAccess,
    start: Position,
    target: Position,
    tolerance: f64,
    on_position: &PositionSink,
) -> Result<Position> {
    let total = distance(start, target);
    loop {
        if let Err(stop) = f.sleep(MOVE_MONITOR_INTERVAL) {
            halt_after_stop(device, access, on_position);
            return Err(stop);
        }

        let (moving, position) = access.poll()?;
        on_position(position);
        if total > 0.0 {
            f.set_percent_done(100.0 * (1.0 - distance(position, target) / total));
        }

        if !moving {
            if distance(position, target) <= tolerance {
                return Ok(position);
            }
            return Err(EphysError::hardware(
                device,
                format!(
                    "{device} stopped at {} before reaching target {}",
                    format_position(position),
                    format_position(target)
                ),
            ));
        }
    }
}

fn halt_after_stop(device: &str, access: &DeviceAccess, on_position: &PositionSink) {
    let _lock = access.lock.lock();
    if let Err(err) = access.driver.halt() {
        warn!(device = %device, error = %err, "halt after stop failed");
    }
    match access.driver.read_position() {
        Ok(position) => on_position(position),
        Err(err) => warn!(device = %device, error = %err, "position read after halt failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockStageConfig;
    use crate::drivers::mock::MockStageDriver;
    use parking_lot::Mutex;

    fn driver() -> Arc<MockStageDriver> {
        Arc::new(MockStageDriver::new(MockStageConfig {
            max_speed: 1e-2,
            ..MockStageConfig::default()
        }))
    }

    #[test]
    fn test_move_completes_within_tolerance() {
        let drv = driver();
        let target = [1e-4, 0.0, 0.0];
        drv.start_move(target, 1e-2, false).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mv = MoveFuture::monitor(
            "stage",
            DeviceAccess::new(drv),
            [0.0; 3],
            target,
            1e-2,
            1e-7,
            Box::new(move |p| sink.lock().push(p)),
        );
        let end = mv.get_result(Some(Duration::from_secs(2))).unwrap();
        assert!(distance(end, target) < 1e-7);
        assert!(!seen.lock().is_empty());
        assert_eq!(mv.percent_done(), Some(100.0));
    }

    #[test]
    fn test_stall_reports_hardware_fault() {
        let drv = driver();
        drv.inject_stall(0.5);
        let target = [2e-4, 0.0, 0.0];
        drv.start_move(target, 1e-2, false).unwrap();
        let mv = MoveFuture::monitor(
            "stage",
            DeviceAccess::new(drv),
            [0.0; 3],
            target,
            1e-2,
            1e-7,
            Box::new(|_| {}),
        );
        let err = mv.wait(Some(Duration::from_secs(2))).unwrap_err();
        assert!(matches!(err, EphysError::HardwareFault { .. }));
        assert!(err.to_string().contains("before reaching target"));
        assert!(mv.was_interrupted());
    }

    #[test]
    fn test_stop_halts_driver() {
        let drv = driver();
        let target = [1e-2, 0.0, 0.0];
        drv.start_move(target, 1e-3, false).unwrap();
        let mv = MoveFuture::monitor(
            "stage",
            DeviceAccess::new(Arc::clone(&drv) as Arc<dyn StageDriver>),
            [0.0; 3],
            target,
            1e-3,
            1e-7,
            Box::new(|_| {}),
        );
        std::thread::sleep(Duration::from_millis(20));
        mv.stop("abort");
        assert!(mv.wait_until_done(Some(Duration::from_secs(1))));
        assert!(mv.was_interrupted());
        assert!(!drv.is_moving().unwrap());
        let x = drv.read_position().unwrap()[0];
        assert!(x > 0.0 && x < target[0]);
    }

    #[test]
    fn test_monitor_polls_under_device_lock() {
        let drv = driver();
        let access = DeviceAccess::new(Arc::clone(&drv) as Arc<dyn StageDriver>);
        let target = [1e-4, 0.0, 0.0];

        let held = access.lock.lock();
        drv.start_move(target, 1e-2, false).unwrap();
        let mv = MoveFuture::monitor("stage", access.clone(), [0.0; 3], target, 1e-2, 1e-7, Box::new(|_| {}));
        // The move itself takes 10 ms; the monitor cannot observe its end while the lock is held.
        std::thread::sleep(Duration::from_millis(150));
        assert!(!mv.is_done());
        assert_eq!(mv.percent_done(), None);

        drop(held);
        let end = mv.get_result(Some(Duration::from_secs(2))).unwrap();
        assert!(distance(end, target) < 1e-7);
    }
}
