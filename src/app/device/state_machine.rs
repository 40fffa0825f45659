use crate::app::error::SchedError;
use crate::app::models::{DeviceAllocationState, FreeDeviceState};

/// An event that can change a device's allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    ConnectedOnline,
    StateChangeOnline,
    Disconnected,
    ForceAvailable,
    AvailableCheckPassed,
    AvailableCheckFailed,
    AvailableCheckIgnored,
    AllocateRequest,
    ForceAllocateRequest,
    FreeAvailable,
    FreeUnresponsive,
    FreeUnavailable,
    FreeUnknown,
}

impl DeviceEvent {
    pub fn from_free_state(state: FreeDeviceState) -> DeviceEvent {
        match state {
            FreeDeviceState::Available => DeviceEvent::FreeAvailable,
            FreeDeviceState::Unresponsive => DeviceEvent::FreeUnresponsive,
            FreeDeviceState::Unavailable => DeviceEvent::FreeUnavailable,
            FreeDeviceState::Ignore => DeviceEvent::FreeUnknown,
        }
    }
}

/// Pure transition function over device allocation states. An unmapped
/// `(state, event)` pair is a programming error on the caller's side and is
/// reported instead of silently ignored.
pub fn transition(
    state: DeviceAllocationState,
    event: DeviceEvent,
) -> Result<DeviceAllocationState, SchedError> {
    use DeviceAllocationState::*;
    use DeviceEvent::*;

    let next = match (state, event) {
        (Unknown, ConnectedOnline) => CheckingAvailability,
        (Unknown, StateChangeOnline) => CheckingAvailability,
        // A device recovering to online gets re-checked before use.
        (Unavailable, StateChangeOnline) => CheckingAvailability,

        (CheckingAvailability, AvailableCheckPassed) => Available,
        (CheckingAvailability, AvailableCheckFailed) => Unavailable,
        (CheckingAvailability, AvailableCheckIgnored) => Ignored,

        (Available, AllocateRequest) => Allocated,

        // Force-allocate is accepted regardless of how broken the device
        // looks; only a device already held by an invocation is off-limits.
        (Unknown, ForceAllocateRequest)
        | (CheckingAvailability, ForceAllocateRequest)
        | (Available, ForceAllocateRequest)
        | (Unavailable, ForceAllocateRequest)
        | (Ignored, ForceAllocateRequest) => Allocated,

        (Unknown, ForceAvailable)
        | (CheckingAvailability, ForceAvailable)
        | (Available, ForceAvailable)
        | (Unavailable, ForceAvailable)
        | (Ignored, ForceAvailable) => Available,

        (CheckingAvailability, Disconnected)
        | (Available, Disconnected)
        | (Unavailable, Disconnected)
        | (Ignored, Disconnected) => Unknown,
        // The invocation still owns a disconnected allocated device and
        // will report the outcome through a free event.
        (Allocated, Disconnected) => Allocated,

        (Allocated, FreeAvailable) => Available,
        (Allocated, FreeUnresponsive) => Unavailable,
        (Allocated, FreeUnavailable) => Unavailable,
        (Allocated, FreeUnknown) => Unknown,

        (state, event) => {
            return Err(SchedError::state(format!(
                "no transition for device event {event:?} in state {state:?}"
            )));
        }
    };
    Ok(next)
}
