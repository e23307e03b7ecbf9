//! Sinks for acquired frames.
//!
//! File formats are out of scope; the sequencer only needs somewhere to hand
//! frames and sequence metadata. [`MemoryStorage`] keeps everything in memory.

use ephys_core::{Frame, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Destination for sequence output.
pub trait FrameStorage: Send + Sync {
    /// Store `frames` under `name` (e.g. `"zstack_000"`).
    fn write_frames(&self, name: &str, frames: &[Frame]) -> Result<()>;

    /// Merge `info` into the sequence metadata.
    fn set_info(&self, info: Map<String, Value>) -> Result<()>;
}

/// In-memory [`FrameStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<Vec<(String, Vec<Frame>)>>,
    info: Mutex<Map<String, Value>>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of stored entries, in write order.
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Frames stored under `name`.
    pub fn frames(&self, name: &str) -> Option<Vec<Frame>> {
        self.entries
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, frames)| frames.clone())
    }

    /// Accumulated metadata.
    pub fn info(&self) -> Map<String, Value> {
        self.info.lock().clone()
    }
}

impl FrameStorage for MemoryStorage {
    fn write_frames(&self, name: &str, frames: &[Frame]) -> Result<()> {
        self.entries.lock().push((name.to_string(), frames.to_vec()));
        Ok(())
    }

    fn set_info(&self, info: Map<String, Value>) -> Result<()> {
        self.info.lock().extend(info);
        Ok(())
    }
}
