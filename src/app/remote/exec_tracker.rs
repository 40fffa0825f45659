use std::sync::Mutex;

use crate::app::error::InvocationError;
use crate::app::models::{CommandResult, CommandResultStatus, FreeDeviceState};
use crate::app::ports::{DeviceHandle, ScheduledInvocationListener};

struct TrackerState {
    status: CommandResultStatus,
    error_details: Option<String>,
    free_state: Option<FreeDeviceState>,
}

/// Captures the terminal result of one remotely requested invocation so a
/// later `GET_LAST_COMMAND_RESULT` can report it.
pub struct ExecCommandTracker {
    state: Mutex<TrackerState>,
}

impl ExecCommandTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                status: CommandResultStatus::Executing,
                error_details: None,
                free_state: None,
            }),
        }
    }

    pub fn command_result(&self) -> CommandResult {
        let guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        CommandResult {
            status: guard.status,
            error_details: guard.error_details.clone(),
            free_device_state: guard.free_state,
        }
    }

    pub fn is_executing(&self) -> bool {
        let guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.status == CommandResultStatus::Executing
    }
}

impl Default for ExecCommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduledInvocationListener for ExecCommandTracker {
    fn invocation_failed(&self, cause: &InvocationError) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.error_details = Some(cause.to_string());
    }

    fn invocation_complete(&self, _device: &DeviceHandle, state: FreeDeviceState) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        guard.free_state = Some(state);
        guard.status = if guard.error_details.is_some() {
            CommandResultStatus::InvocationError
        } else {
            CommandResultStatus::InvocationSuccess
        };
    }
}
