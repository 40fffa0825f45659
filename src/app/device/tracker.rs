use std::collections::HashMap;
use std::sync::Mutex;

use crate::app::ports::DeviceHandle;

/// Tracks devices this process holds on behalf of a remote peer, i.e.
/// devices we force-allocated at the device manager but that are actually
/// driven by another scheduler process.
#[derive(Default)]
pub struct DeviceTracker {
    devices: Mutex<HashMap<String, DeviceHandle>>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the device as remotely allocated. An existing entry for the
    /// same serial is silently replaced; the caller has already reconciled.
    pub fn allocate(&self, device: DeviceHandle) {
        let mut guard = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert(device.serial().to_string(), device);
    }

    /// Mark the serial as freed, returning the handle if it was tracked.
    pub fn free(&self, serial: &str) -> Option<DeviceHandle> {
        let mut guard = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        guard.remove(serial)
    }

    /// Drain the tracker, returning every handle it held.
    pub fn free_all(&self) -> Vec<DeviceHandle> {
        let mut guard = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        guard.drain().map(|(_, device)| device).collect()
    }

    pub fn get(&self, serial: &str) -> Option<DeviceHandle> {
        let guard = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        guard.get(serial).cloned()
    }

    pub fn contains(&self, serial: &str) -> bool {
        let guard = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        guard.contains_key(serial)
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.devices.lock().unwrap_or_else(|p| p.into_inner());
        guard.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeDevice {
        serial: String,
    }

    impl crate::app::ports::TestDevice for FakeDevice {
        fn serial(&self) -> &str {
            &self.serial
        }
    }

    fn device(serial: &str) -> DeviceHandle {
        Arc::new(FakeDevice {
            serial: serial.to_string(),
        })
    }

    #[test]
    fn allocate_then_free_returns_handle() {
        let tracker = DeviceTracker::new();
        tracker.allocate(device("s1"));
        assert!(tracker.contains("s1"));
        let freed = tracker.free("s1").expect("handle");
        assert_eq!(freed.serial(), "s1");
        assert!(tracker.is_empty());
    }

    #[test]
    fn free_unknown_serial_returns_none() {
        let tracker = DeviceTracker::new();
        assert!(tracker.free("nope").is_none());
    }

    #[test]
    fn free_all_drains_every_device() {
        let tracker = DeviceTracker::new();
        tracker.allocate(device("s1"));
        tracker.allocate(device("s2"));
        let mut serials = tracker
            .free_all()
            .iter()
            .map(|d| d.serial().to_string())
            .collect::<Vec<_>>();
        serials.sort();
        assert_eq!(serials, vec!["s1", "s2"]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn allocate_overwrites_existing_serial() {
        let tracker = DeviceTracker::new();
        tracker.allocate(device("s1"));
        tracker.allocate(device("s1"));
        assert_eq!(tracker.free_all().len(), 1);
    }
}
