use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::app::command::CommandScheduler;
use crate::app::error::{InvocationError, SchedError};
use crate::app::models::{DeviceDescriptor, FreeDeviceState};

/// A live device borrowed from the device manager. Ownership of the
/// underlying bridge connection stays with the manager; the scheduler only
/// holds handles for the duration of an invocation or a remote allocation.
pub trait TestDevice: Send + Sync {
    fn serial(&self) -> &str;
}

pub type DeviceHandle = Arc<dyn TestDevice>;

/// Bridge to the process that owns the physical fleet (adb/fastboot side).
/// Assumed internally thread-safe.
pub trait DeviceManager: Send + Sync {
    fn init(&self);

    /// Allocate any device matching `requirements`, waiting up to `timeout`.
    fn allocate_device(
        &self,
        timeout: Duration,
        requirements: &DeviceRequirements,
    ) -> Option<DeviceHandle>;

    /// Allocate a specific serial even if it is not in `Available` state.
    fn force_allocate_device(&self, serial: &str) -> Option<DeviceHandle>;

    fn free_device(&self, device: DeviceHandle, state: FreeDeviceState);

    fn list_all_devices(&self) -> Vec<DeviceDescriptor>;

    fn is_null_device(&self, serial: &str) -> bool;

    fn is_emulator(&self, serial: &str) -> bool;

    fn terminate(&self);

    /// Terminate and tear the bridge down under running invocations, to
    /// provoke them into returning quickly.
    fn terminate_hard(&self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRequirements {
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    pub help_mode: bool,
    pub full_help_mode: bool,
    pub dry_run_mode: bool,
    pub noisy_dry_run_mode: bool,
    pub loop_mode: bool,
    pub min_loop_time_ms: u64,
    pub run_on_all_devices: bool,
}

/// A parsed test configuration. Producing one from args is the config
/// factory's job; the scheduler only consults the options and requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub name: String,
    pub command_options: CommandOptions,
    pub device_requirements: DeviceRequirements,
}

impl Configuration {
    pub fn validate_options(&self) -> Result<(), SchedError> {
        if self.command_options.run_on_all_devices && self.device_requirements.serial.is_some() {
            return Err(SchedError::config_parse(
                "--all-devices conflicts with an explicit serial requirement",
            ));
        }
        Ok(())
    }
}

pub trait ConfigFactory: Send + Sync {
    fn create_configuration_from_args(&self, args: &[String])
        -> Result<Configuration, SchedError>;

    /// Help text for the config the given args would produce.
    /// `important_only` restricts output to the commonly used options.
    fn help_for_config(&self, args: &[String], important_only: bool) -> String {
        let _ = important_only;
        format!("no help available for: {}", args.join(" "))
    }
}

/// Completion callback handed to every invocation.
pub trait ScheduledInvocationListener: Send + Sync {
    fn invocation_failed(&self, _cause: &InvocationError) {}

    /// Called exactly once when the invocation ends, successfully or not.
    fn invocation_complete(&self, device: &DeviceHandle, state: FreeDeviceState);
}

/// Callback surface the invocation runner uses to get tests re-executed
/// with a modified config, or the whole command re-run later.
pub trait Rescheduler {
    fn schedule_config(&self, config: Configuration) -> bool;

    fn reschedule_command(&self) -> bool;
}

/// Runs one invocation against one allocated device. Blocking; called on a
/// dedicated invocation thread.
pub trait InvocationRunner: Send + Sync {
    fn invoke(
        &self,
        device: &DeviceHandle,
        config: &Configuration,
        rescheduler: &dyn Rescheduler,
        listener: &dyn ScheduledInvocationListener,
    ) -> Result<(), InvocationError>;
}

/// Parses a command file and feeds each directive to the scheduler.
pub trait CommandFileParser: Send + Sync {
    fn parse_file(
        &self,
        path: &Path,
        scheduler: &CommandScheduler,
        extra_args: &[String],
    ) -> Result<(), SchedError>;
}
