use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app::models::{DeviceAllocationState, UtilizationDesc};
use crate::app::ports::DeviceManager;

/// Sliding accounting window, 24 hours.
pub const WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// How stub devices (null devices, emulator placeholders) are treated when
/// calculating host utilization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StubDeviceUtil {
    /// Never include stub device data.
    Ignore,
    /// Include stub device data only if a stub device of the same category
    /// has been allocated at least once in this process's lifetime.
    IncludeIfUsed,
    /// Always include stub device data.
    AlwaysInclude,
}

/// Clock seam so tests can drive time by hand.
pub trait TimeProvider: Send + Sync {
    fn current_time_millis(&self) -> u64;
}

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn current_time_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Start and end of one stay in a measured state. `end` is `None` while the
/// device is still in that state; at most one open record exists per device
/// across both lists.
#[derive(Debug, Clone, Copy)]
struct StateRecord {
    start: u64,
    end: Option<u64>,
}

#[derive(Debug, Default)]
struct DeviceStateRecords {
    available: VecDeque<StateRecord>,
    allocated: VecDeque<StateRecord>,
}

#[derive(Default)]
struct MonitorState {
    records: HashMap<String, DeviceStateRecords>,
    null_device_allocated: bool,
    emulator_allocated: bool,
}

/// Observes device allocation-state transitions and accumulates allocated vs
/// available time per device over [`WINDOW_MS`].
///
/// `get_utilization_stats` must be called periodically to evict expired
/// records.
pub struct DeviceUtilStatsMonitor {
    state: Mutex<MonitorState>,
    time: Arc<dyn TimeProvider>,
    device_manager: Arc<dyn DeviceManager>,
    collect_null_device: StubDeviceUtil,
    collect_emulator: StubDeviceUtil,
    start_time: u64,
}

impl DeviceUtilStatsMonitor {
    pub fn new(
        device_manager: Arc<dyn DeviceManager>,
        collect_null_device: StubDeviceUtil,
        collect_emulator: StubDeviceUtil,
    ) -> Self {
        Self::with_time_provider(
            device_manager,
            collect_null_device,
            collect_emulator,
            Arc::new(SystemTimeProvider),
        )
    }

    pub fn with_time_provider(
        device_manager: Arc<dyn DeviceManager>,
        collect_null_device: StubDeviceUtil,
        collect_emulator: StubDeviceUtil,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let start_time = time.current_time_millis();
        Self {
            state: Mutex::new(MonitorState::default()),
            time,
            device_manager,
            collect_null_device,
            collect_emulator,
            start_time,
        }
    }

    /// Records the end of the old state and the start of the new one for
    /// states that are measured (available, allocated).
    pub fn notify_device_state_change(
        &self,
        serial: &str,
        old_state: DeviceAllocationState,
        new_state: DeviceAllocationState,
    ) {
        let now = self.time.current_time_millis();
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());

        {
            let records = guard.records.entry(serial.to_string()).or_default();
            match old_state {
                DeviceAllocationState::Available => {
                    close_last_record(serial, &mut records.available, now)
                }
                DeviceAllocationState::Allocated => {
                    close_last_record(serial, &mut records.allocated, now)
                }
                _ => {}
            }

            match new_state {
                DeviceAllocationState::Available => {
                    records.available.push_back(StateRecord { start: now, end: None });
                }
                DeviceAllocationState::Allocated => {
                    records.allocated.push_back(StateRecord { start: now, end: None });
                }
                _ => {}
            }
        }

        if new_state == DeviceAllocationState::Allocated {
            if self.device_manager.is_null_device(serial) {
                guard.null_device_allocated = true;
            } else if self.device_manager.is_emulator(serial) {
                guard.emulator_allocated = true;
            }
        }
    }

    /// Device utilization over the last 24 hours, clipped to this monitor's
    /// lifetime. Also evicts records that fell out of the window.
    pub fn get_utilization_stats(&self) -> UtilizationDesc {
        let now = self.time.current_time_millis();
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        clean_expired_records(&mut guard.records, now);

        let mut window_start = now.saturating_sub(WINDOW_MS);
        if window_start < self.start_time {
            window_start = self.start_time;
        }

        let mut total_avail = 0u64;
        let mut total_alloc = 0u64;
        let mut device_util = HashMap::with_capacity(guard.records.len());
        for (serial, records) in &guard.records {
            if !self.should_track_device(serial, &guard) {
                continue;
            }
            let avail = count_time(window_start, now, &records.available);
            let alloc = count_time(window_start, now, &records.allocated);
            total_avail += avail;
            total_alloc += alloc;
            device_util.insert(serial.clone(), util_percent(avail, alloc));
        }
        UtilizationDesc {
            total_util: util_percent(total_avail, total_alloc),
            device_util,
        }
    }

    fn should_track_device(&self, serial: &str, state: &MonitorState) -> bool {
        if self.device_manager.is_null_device(serial) {
            match self.collect_null_device {
                StubDeviceUtil::AlwaysInclude => true,
                StubDeviceUtil::Ignore => false,
                StubDeviceUtil::IncludeIfUsed => state.null_device_allocated,
            }
        } else if self.device_manager.is_emulator(serial) {
            match self.collect_emulator {
                StubDeviceUtil::AlwaysInclude => true,
                StubDeviceUtil::Ignore => false,
                StubDeviceUtil::IncludeIfUsed => state.emulator_allocated,
            }
        } else {
            true
        }
    }
}

fn close_last_record(serial: &str, records: &mut VecDeque<StateRecord>, now: u64) {
    let Some(last) = records.back_mut() else {
        warn!(serial = %serial, "no state record exists to close");
        return;
    };
    if last.end.is_some() {
        warn!(serial = %serial, "last state record already closed");
        return;
    }
    last.end = Some(now);
}

/// Time in ms spent inside `[window_start, now]` across the given records.
fn count_time(window_start: u64, now: u64, records: &VecDeque<StateRecord>) -> u64 {
    let mut total = 0u64;
    for record in records {
        let start = record.start.max(window_start);
        let end = record.end.unwrap_or(now);
        if end < start {
            continue;
        }
        total += end - start;
    }
    total
}

fn util_percent(avail: u64, alloc: u64) -> u32 {
    let total = avail + alloc;
    if total == 0 {
        return 0;
    }
    ((alloc * 100) / total) as u32
}

/// Records are ordered by start time, so eviction stops at the first record
/// that is still (partly) inside the window.
fn clean_expired_records(records: &mut HashMap<String, DeviceStateRecords>, now: u64) {
    let obsolete = now.saturating_sub(WINDOW_MS);
    for device_records in records.values_mut() {
        evict_front(&mut device_records.available, obsolete);
        evict_front(&mut device_records.allocated, obsolete);
    }
}

fn evict_front(records: &mut VecDeque<StateRecord>, obsolete: u64) {
    while let Some(front) = records.front() {
        match front.end {
            Some(end) if end < obsolete => {
                records.pop_front();
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use crate::app::models::{DeviceDescriptor, FreeDeviceState};
    use crate::app::ports::{DeviceHandle, DeviceRequirements};

    struct ManualClock {
        now: AtomicU64,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: AtomicU64::new(0),
            })
        }

        fn set(&self, value: u64) {
            self.now.store(value, Ordering::SeqCst);
        }
    }

    impl TimeProvider for ManualClock {
        fn current_time_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    struct StubAwareManager {
        null_serials: Vec<String>,
    }

    impl DeviceManager for StubAwareManager {
        fn init(&self) {}
        fn allocate_device(
            &self,
            _timeout: Duration,
            _requirements: &DeviceRequirements,
        ) -> Option<DeviceHandle> {
            None
        }
        fn force_allocate_device(&self, _serial: &str) -> Option<DeviceHandle> {
            None
        }
        fn free_device(&self, _device: DeviceHandle, _state: FreeDeviceState) {}
        fn list_all_devices(&self) -> Vec<DeviceDescriptor> {
            Vec::new()
        }
        fn is_null_device(&self, serial: &str) -> bool {
            self.null_serials.iter().any(|s| s == serial)
        }
        fn is_emulator(&self, _serial: &str) -> bool {
            false
        }
        fn terminate(&self) {}
        fn terminate_hard(&self) {}
    }

    fn monitor_with_clock(
        null_serials: &[&str],
        null_policy: StubDeviceUtil,
    ) -> (DeviceUtilStatsMonitor, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let manager = Arc::new(StubAwareManager {
            null_serials: null_serials.iter().map(|s| s.to_string()).collect(),
        });
        let monitor = DeviceUtilStatsMonitor::with_time_provider(
            manager,
            null_policy,
            StubDeviceUtil::IncludeIfUsed,
            clock.clone(),
        );
        (monitor, clock)
    }

    #[test]
    fn empty_history_is_zero() {
        let (monitor, _clock) = monitor_with_clock(&[], StubDeviceUtil::IncludeIfUsed);
        let desc = monitor.get_utilization_stats();
        assert_eq!(desc.total_util, 0);
        assert!(desc.device_util.is_empty());
    }

    #[test]
    fn only_available_is_zero_percent() {
        let (monitor, clock) = monitor_with_clock(&[], StubDeviceUtil::IncludeIfUsed);
        monitor.notify_device_state_change(
            "serial",
            DeviceAllocationState::Unknown,
            DeviceAllocationState::Available,
        );
        clock.set(10);
        let desc = monitor.get_utilization_stats();
        assert_eq!(desc.total_util, 0);
        assert_eq!(desc.util_for_device("serial"), 0);
    }

    #[test]
    fn only_allocated_is_hundred_percent() {
        let (monitor, clock) = monitor_with_clock(&[], StubDeviceUtil::IncludeIfUsed);
        monitor.notify_device_state_change(
            "serial",
            DeviceAllocationState::Unknown,
            DeviceAllocationState::Allocated,
        );
        clock.set(10);
        let desc = monitor.get_utilization_stats();
        assert_eq!(desc.total_util, 100);
        assert_eq!(desc.util_for_device("serial"), 100);
    }

    #[test]
    fn half_allocated_is_fifty_percent() {
        let (monitor, clock) = monitor_with_clock(&[], StubDeviceUtil::IncludeIfUsed);
        monitor.notify_device_state_change(
            "serial",
            DeviceAllocationState::Unknown,
            DeviceAllocationState::Available,
        );
        clock.set(5);
        monitor.notify_device_state_change(
            "serial",
            DeviceAllocationState::Available,
            DeviceAllocationState::Allocated,
        );
        clock.set(10);
        let desc = monitor.get_utilization_stats();
        assert_eq!(desc.total_util, 50);
        assert_eq!(desc.util_for_device("serial"), 50);
    }

    #[test]
    fn closed_records_older_than_window_are_evicted() {
        let (monitor, clock) = monitor_with_clock(&[], StubDeviceUtil::IncludeIfUsed);
        monitor.notify_device_state_change(
            "serial",
            DeviceAllocationState::Unknown,
            DeviceAllocationState::Allocated,
        );
        clock.set(5);
        monitor.notify_device_state_change(
            "serial",
            DeviceAllocationState::Allocated,
            DeviceAllocationState::Unknown,
        );
        // Move past the window so the closed record falls out entirely.
        clock.set(WINDOW_MS + 100);
        let desc = monitor.get_utilization_stats();
        assert_eq!(desc.total_util, 0);
        assert_eq!(desc.util_for_device("serial"), 0);
    }

    #[test]
    fn null_device_ignored_by_policy() {
        let (monitor, clock) = monitor_with_clock(&["null-0"], StubDeviceUtil::Ignore);
        monitor.notify_device_state_change(
            "null-0",
            DeviceAllocationState::Unknown,
            DeviceAllocationState::Allocated,
        );
        clock.set(10);
        let desc = monitor.get_utilization_stats();
        assert_eq!(desc.total_util, 0);
        assert!(desc.device_util.is_empty());
    }

    #[test]
    fn null_device_counted_once_used() {
        let (monitor, clock) = monitor_with_clock(&["null-0"], StubDeviceUtil::IncludeIfUsed);
        monitor.notify_device_state_change(
            "null-0",
            DeviceAllocationState::Unknown,
            DeviceAllocationState::Allocated,
        );
        clock.set(10);
        let desc = monitor.get_utilization_stats();
        assert_eq!(desc.total_util, 100);
        assert_eq!(desc.util_for_device("null-0"), 100);
    }
}
