use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct SchedError {
    pub error: String,
    pub code: String,
}

impl SchedError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
        }
    }

    /// Bad args or an invalid configuration; no scheduler state was changed.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::new("ERR_CONFIG_PARSE", message)
    }

    /// Malformed wire line, protocol version mismatch, or JSON error.
    pub fn remote_wire(message: impl Into<String>) -> Self {
        Self::new("ERR_REMOTE_WIRE", message)
    }

    pub fn allocation(message: impl Into<String>) -> Self {
        Self::new("ERR_ALLOCATION", message)
    }

    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new("ERR_INVOCATION", message)
    }

    pub fn socket(message: impl Into<String>) -> Self {
        Self::new("ERR_SOCKET", message)
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::new("ERR_STATE", message)
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for SchedError {}

/// Outcome kinds an invocation run can fail with. The kind dictates the
/// free-state the device is returned in.
#[derive(Debug, Clone)]
pub enum InvocationError {
    DeviceUnresponsive(String),
    DeviceNotAvailable(String),
    FatalHostError(String),
    Other(String),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationError::DeviceUnresponsive(msg) => {
                write!(f, "device unresponsive: {msg}")
            }
            InvocationError::DeviceNotAvailable(msg) => {
                write!(f, "device not available: {msg}")
            }
            InvocationError::FatalHostError(msg) => write!(f, "fatal host error: {msg}"),
            InvocationError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for InvocationError {}
