//! Exclusive device reservations.
//!
//! Long-running procedures (a z-stack, a tracker calibration) reserve the
//! devices they drive so two procedures never command the same hardware at
//! once. A [`DeviceLease`] holds its whole set of devices and releases them
//! when dropped.

use ephys_core::{EphysError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct Registry {
    reserved: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Shared reservation table. Cloning yields another handle to the same table.
#[derive(Debug, Clone, Default)]
pub struct DeviceReservations {
    registry: Arc<Registry>,
}

impl DeviceReservations {
    /// Empty reservation table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve every device in `names` atomically.
    ///
    /// Blocks while any of them is held by another lease. With a `timeout`,
    /// gives up with [`EphysError::Timeout`] once it elapses.
    pub fn reserve<I, S>(&self, names: I, timeout: Option<Duration>) -> Result<DeviceLease>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);

        let mut reserved = self.registry.reserved.lock();
        while devices.iter().any(|d| reserved.contains(d)) {
            match deadline {
                Some(deadline) => {
                    if self.registry.released.wait_until(&mut reserved, deadline).timed_out()
                        && devices.iter().any(|d| reserved.contains(d))
                    {
                        return Err(EphysError::Timeout {
                            waited: start.elapsed(),
                        });
                    }
                }
                None => self.registry.released.wait(&mut reserved),
            }
        }
        reserved.extend(devices.iter().cloned());
        drop(reserved);

        debug!(devices = ?devices, "devices reserved");
        Ok(DeviceLease {
            registry: Arc::clone(&self.registry),
            devices,
        })
    }

    /// Whether `name` is currently held by a lease.
    pub fn is_reserved(&self, name: &str) -> bool {
        self.registry.reserved.lock().contains(name)
    }
}

/// Exclusive hold on a set of devices, released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    registry: Arc<Registry>,
    devices: BTreeSet<String>,
}

impl DeviceLease {
    /// Devices held by this lease.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(String::as_str)
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        {
            let mut reserved = self.registry.reserved.lock();
            for device in &self.devices {
                reserved.remove(device);
            }
        }
        self.registry.released.notify_all();
        debug!(devices = ?self.devices, "devices released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_releases_on_drop() {
        let table = DeviceReservations::new();
        {
            let lease = table.reserve(["camera", "focus"], None).unwrap();
            assert!(table.is_reserved("camera"));
            assert_eq!(lease.devices().collect::<Vec<_>>(), vec!["camera", "focus"]);
        }
        assert!(!table.is_reserved("camera"));
        assert!(!table.is_reserved("focus"));
    }

    #[test]
    fn test_overlapping_request_times_out() {
        let table = DeviceReservations::new();
        let _held = table.reserve(["focus"], None).unwrap();
        let err = table
            .reserve(["camera", "focus"], Some(Duration::from_millis(30)))
            .unwrap_err();
        assert!(matches!(err, EphysError::Timeout { .. }));
        // The failed request must not leave "camera" behind.
        assert!(!table.is_reserved("camera"));
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let table = DeviceReservations::new();
        let held = table.reserve(["stage"], None).unwrap();
        let other = table.clone();
        let waiter = std::thread::spawn(move || other.reserve(["stage"], Some(Duration::from_secs(2))).is_ok());
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_disjoint_sets_do_not_block() {
        let table = DeviceReservations::new();
        let _a = table.reserve(["pipette1"], None).unwrap();
        let _b = table.reserve(["pipette2"], Some(Duration::ZERO)).unwrap();
    }
}
