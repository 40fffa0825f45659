//! In-memory fleet used by the smoke and soak binaries: a device manager
//! over simulated serials, a flag-parsing config factory, and a runner that
//! just burns wall-clock time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::device::util_stats::DeviceUtilStatsMonitor;
use crate::app::error::{InvocationError, SchedError};
use crate::app::models::{DeviceAllocationState, DeviceDescriptor, FreeDeviceState};
use crate::app::ports::{
    CommandOptions, ConfigFactory, Configuration, DeviceHandle, DeviceManager,
    DeviceRequirements, InvocationRunner, Rescheduler, ScheduledInvocationListener, TestDevice,
};

pub struct SimDevice {
    serial: String,
}

impl TestDevice for SimDevice {
    fn serial(&self) -> &str {
        &self.serial
    }
}

pub struct SimDeviceManager {
    devices: Mutex<Vec<(String, DeviceAllocationState)>>,
    monitor: Mutex<Option<Arc<DeviceUtilStatsMonitor>>>,
}

impl SimDeviceManager {
    pub fn with_fleet(count: usize) -> Arc<Self> {
        let serials = (0..count).map(|i| format!("sim-{i:03}")).collect::<Vec<_>>();
        Self::with_serials(&serials)
    }

    pub fn with_serials(serials: &[String]) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(
                serials
                    .iter()
                    .map(|serial| (serial.clone(), DeviceAllocationState::Available))
                    .collect(),
            ),
            monitor: Mutex::new(None),
        })
    }

    /// Attach a utilization monitor and report the fleet's current states to
    /// it as if the devices had just come online.
    pub fn attach_monitor(&self, monitor: Arc<DeviceUtilStatsMonitor>) {
        {
            let devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            for (serial, state) in devices.iter() {
                monitor.notify_device_state_change(serial, DeviceAllocationState::Unknown, *state);
            }
        }
        *self.monitor.lock().unwrap_or_else(|p| p.into_inner()) = Some(monitor);
    }

    pub fn state_of(&self, serial: &str) -> Option<DeviceAllocationState> {
        self.devices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|(known, _)| known == serial)
            .map(|(_, state)| *state)
    }

    pub fn available_count(&self) -> usize {
        self.devices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, state)| *state == DeviceAllocationState::Available)
            .count()
    }

    fn transition(&self, serial: &str, new_state: DeviceAllocationState) {
        let old_state = {
            let mut devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            let Some(entry) = devices.iter_mut().find(|(known, _)| known == serial) else {
                return;
            };
            let old = entry.1;
            entry.1 = new_state;
            old
        };
        let monitor = self.monitor.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(monitor) = monitor.as_ref() {
            monitor.notify_device_state_change(serial, old_state, new_state);
        }
    }
}

impl DeviceManager for SimDeviceManager {
    fn init(&self) {}

    fn allocate_device(
        &self,
        _timeout: Duration,
        requirements: &DeviceRequirements,
    ) -> Option<DeviceHandle> {
        let serial = {
            let devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            devices
                .iter()
                .find(|(serial, state)| {
                    *state == DeviceAllocationState::Available
                        && requirements
                            .serial
                            .as_ref()
                            .map_or(true, |wanted| wanted == serial)
                })
                .map(|(serial, _)| serial.clone())?
        };
        self.transition(&serial, DeviceAllocationState::Allocated);
        Some(Arc::new(SimDevice { serial }))
    }

    fn force_allocate_device(&self, serial: &str) -> Option<DeviceHandle> {
        {
            let devices = self.devices.lock().unwrap_or_else(|p| p.into_inner());
            devices
                .iter()
                .find(|(known, state)| known == serial && *state != DeviceAllocationState::Allocated)?;
        }
        self.transition(serial, DeviceAllocationState::Allocated);
        Some(Arc::new(SimDevice {
            serial: serial.to_string(),
        }))
    }

    fn free_device(&self, device: DeviceHandle, state: FreeDeviceState) {
        let new_state = match state {
            FreeDeviceState::Available => DeviceAllocationState::Available,
            FreeDeviceState::Unresponsive | FreeDeviceState::Unavailable => {
                DeviceAllocationState::Unavailable
            }
            FreeDeviceState::Ignore => DeviceAllocationState::Unknown,
        };
        self.transition(device.serial(), new_state);
    }

    fn list_all_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(serial, state)| DeviceDescriptor {
                serial: serial.clone(),
                is_stub: false,
                state: *state,
                product: Some("sim".to_string()),
                product_variant: Some("sim".to_string()),
                sdk_version: None,
                build_id: None,
                battery_level: Some(100),
            })
            .collect()
    }

    fn is_null_device(&self, _serial: &str) -> bool {
        false
    }

    fn is_emulator(&self, _serial: &str) -> bool {
        false
    }

    fn terminate(&self) {}

    fn terminate_hard(&self) {}
}

/// Parses the handful of options the scheduler consults. The first token is
/// the config name; anything unrecognized is a parse error.
pub struct SimConfigFactory;

impl ConfigFactory for SimConfigFactory {
    fn create_configuration_from_args(&self, args: &[String]) -> Result<Configuration, SchedError> {
        let Some(name) = args.first() else {
            return Err(SchedError::config_parse("empty command line"));
        };
        let mut options = CommandOptions::default();
        let mut requirements = DeviceRequirements::default();
        let mut iter = args[1..].iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" => options.help_mode = true,
                "--full-help" => options.full_help_mode = true,
                "--dry-run" => options.dry_run_mode = true,
                "--noisy-dry-run" => {
                    options.dry_run_mode = true;
                    options.noisy_dry_run_mode = true;
                }
                "--loop" => options.loop_mode = true,
                "--min-loop-time" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| SchedError::config_parse("--min-loop-time needs a value"))?;
                    options.min_loop_time_ms = value
                        .parse()
                        .map_err(|_| SchedError::config_parse("bad --min-loop-time value"))?;
                }
                "--all-devices" => options.run_on_all_devices = true,
                "-s" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| SchedError::config_parse("-s needs a value"))?;
                    requirements.serial = Some(value.clone());
                }
                other => {
                    return Err(SchedError::config_parse(format!("unknown option {other}")));
                }
            }
        }
        Ok(Configuration {
            name: name.clone(),
            command_options: options,
            device_requirements: requirements,
        })
    }
}

/// Runner that sleeps for a fixed time per invocation, recording each run
/// as it starts and counting completions.
pub struct SimRunner {
    run_time: Duration,
    runs: Mutex<Vec<(String, String)>>,
    completed: AtomicUsize,
}

impl SimRunner {
    pub fn new(run_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            run_time,
            runs: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        })
    }

    /// `(config name, serial)` pairs in invocation start order.
    pub fn runs(&self) -> Vec<(String, String)> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl InvocationRunner for SimRunner {
    fn invoke(
        &self,
        device: &DeviceHandle,
        config: &Configuration,
        _rescheduler: &dyn Rescheduler,
        _listener: &dyn ScheduledInvocationListener,
    ) -> Result<(), InvocationError> {
        self.runs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((config.name.clone(), device.serial().to_string()));
        std::thread::sleep(self.run_time);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
