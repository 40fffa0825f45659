use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Allocation state of a device as seen by the device manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceAllocationState {
    Unknown,
    CheckingAvailability,
    Available,
    Allocated,
    Unavailable,
    Ignored,
}

/// The state a device should transition into when released after an
/// invocation. Chosen by the invocation based on its outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FreeDeviceState {
    Available,
    Unresponsive,
    Unavailable,
    Ignore,
}

/// Point-in-time snapshot of one device, produced on demand by the device
/// manager and sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub is_stub: bool,
    pub state: DeviceAllocationState,
    pub product: Option<String>,
    pub product_variant: Option<String>,
    pub sdk_version: Option<String>,
    pub build_id: Option<String>,
    pub battery_level: Option<u8>,
}

/// One entry of a `LIST_DEVICES` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceListEntry {
    pub serial: String,
    pub state: DeviceAllocationState,
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResultStatus {
    NoActiveCommand,
    Executing,
    NotAllocated,
    InvocationError,
    InvocationSuccess,
}

/// Last-command execution data returned by `GET_LAST_COMMAND_RESULT`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub status: CommandResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_device_state: Option<FreeDeviceState>,
}

impl CommandResult {
    pub fn with_status(status: CommandResultStatus) -> Self {
        Self {
            status,
            error_details: None,
            free_device_state: None,
        }
    }
}

/// Utilization snapshot over the sliding 24 hour window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UtilizationDesc {
    pub total_util: u32,
    pub device_util: HashMap<String, u32>,
}

impl UtilizationDesc {
    /// Percent utilization for one device; 0 if no data exists for it.
    pub fn util_for_device(&self, serial: &str) -> u32 {
        self.device_util.get(serial).copied().unwrap_or(0)
    }
}
