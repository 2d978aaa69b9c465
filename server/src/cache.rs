use std::collections::HashSet;
use std::sync::Mutex;

use tracing::debug;

use crate::storage::DeviceCache;

/// In-memory hot-device cache.
///
/// Holds the set of device ids that currently have a live session. The
/// session core adds a device on bind and drops it on disconnect or decay;
/// everything else only reads.
#[derive(Default)]
pub struct HotDeviceCache {
    devices: Mutex<HashSet<i64>>,
}

impl HotDeviceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceCache for HotDeviceCache {
    fn add_device(&self, device_id: i64) {
        if self.devices.lock().unwrap().insert(device_id) {
            debug!(device_id, "Device cached as hot");
        }
    }

    fn remove_device(&self, device_id: i64) {
        if self.devices.lock().unwrap().remove(&device_id) {
            debug!(device_id, "Device dropped from hot cache");
        }
    }

    fn contains(&self, device_id: i64) -> bool {
        self.devices.lock().unwrap().contains(&device_id)
    }

    fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }
}
