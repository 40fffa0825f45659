use serde_json::{json, Value};

use crate::app::error::SchedError;
use crate::app::models::{CommandResult, DeviceDescriptor, DeviceListEntry};

/// Peers speaking a different version are refused outright.
pub const PROTOCOL_VERSION: u64 = 3;

/// Serial wildcard accepted by `FREE_DEVICE`.
pub const ALL_DEVICES: &str = "*";

const VERSION: &str = "version";
const TYPE: &str = "type";
const ERROR: &str = "error";
const RESULT: &str = "result";
const SERIAL: &str = "serial";
const SERIALS: &str = "serials";
const TIME: &str = "time";
const COMMAND_ARGS: &str = "commandArgs";
const PORT: &str = "port";

/// One remote operation, sent as a single JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOperation {
    AllocateDevice { serial: String },
    FreeDevice { serial: String },
    Close,
    AddCommand { time: u64, command_args: Vec<String> },
    HandoverClose { port: u16 },
    ListDevices,
    ExecCommand { serial: String, command_args: Vec<String> },
    GetLastCommandResult { serial: String },
}

impl RemoteOperation {
    pub fn op_type(&self) -> &'static str {
        match self {
            RemoteOperation::AllocateDevice { .. } => "ALLOCATE_DEVICE",
            RemoteOperation::FreeDevice { .. } => "FREE_DEVICE",
            RemoteOperation::Close => "CLOSE",
            RemoteOperation::AddCommand { .. } => "ADD_COMMAND",
            RemoteOperation::HandoverClose { .. } => "HANDOVER_CLOSE",
            RemoteOperation::ListDevices => "LIST_DEVICES",
            RemoteOperation::ExecCommand { .. } => "EXEC_COMMAND",
            RemoteOperation::GetLastCommandResult { .. } => "GET_LAST_COMMAND_RESULT",
        }
    }

    /// Wire form: the versioned envelope plus this op's payload keys.
    pub fn encode(&self) -> String {
        let mut envelope = serde_json::Map::new();
        envelope.insert(VERSION.to_string(), json!(PROTOCOL_VERSION));
        envelope.insert(TYPE.to_string(), json!(self.op_type()));
        let payload = &mut envelope;
        match self {
            RemoteOperation::AllocateDevice { serial }
            | RemoteOperation::FreeDevice { serial }
            | RemoteOperation::GetLastCommandResult { serial } => {
                payload.insert(SERIAL.to_string(), json!(serial));
            }
            RemoteOperation::Close | RemoteOperation::ListDevices => {}
            RemoteOperation::AddCommand { time, command_args } => {
                payload.insert(TIME.to_string(), json!(time));
                payload.insert(COMMAND_ARGS.to_string(), json!(command_args));
            }
            RemoteOperation::HandoverClose { port } => {
                payload.insert(PORT.to_string(), json!(port));
            }
            RemoteOperation::ExecCommand { serial, command_args } => {
                payload.insert(SERIAL.to_string(), json!(serial));
                payload.insert(COMMAND_ARGS.to_string(), json!(command_args));
            }
        }
        Value::Object(envelope).to_string()
    }

    pub fn decode(line: &str) -> Result<RemoteOperation, SchedError> {
        let data: Value = serde_json::from_str(line)
            .map_err(|err| SchedError::remote_wire(format!("malformed request line: {err}")))?;
        let version = field_u64(&data, VERSION)?;
        if version != PROTOCOL_VERSION {
            return Err(SchedError::remote_wire(format!(
                "unknown version '{version}'. Expected '{PROTOCOL_VERSION}'"
            )));
        }
        let op_type = field_str(&data, TYPE)?;
        let op = match op_type.as_str() {
            "ALLOCATE_DEVICE" => RemoteOperation::AllocateDevice {
                serial: field_str(&data, SERIAL)?,
            },
            "FREE_DEVICE" => RemoteOperation::FreeDevice {
                serial: field_str(&data, SERIAL)?,
            },
            "CLOSE" => RemoteOperation::Close,
            "ADD_COMMAND" => RemoteOperation::AddCommand {
                time: field_u64(&data, TIME)?,
                command_args: field_string_array(&data, COMMAND_ARGS)?,
            },
            "HANDOVER_CLOSE" => {
                let port = field_u64(&data, PORT)?;
                let port = u16::try_from(port).map_err(|_| {
                    SchedError::remote_wire(format!("port {port} out of range"))
                })?;
                RemoteOperation::HandoverClose { port }
            }
            "LIST_DEVICES" => RemoteOperation::ListDevices,
            "EXEC_COMMAND" => RemoteOperation::ExecCommand {
                serial: field_str(&data, SERIAL)?,
                command_args: field_string_array(&data, COMMAND_ARGS)?,
            },
            "GET_LAST_COMMAND_RESULT" => RemoteOperation::GetLastCommandResult {
                serial: field_str(&data, SERIAL)?,
            },
            other => {
                return Err(SchedError::remote_wire(format!(
                    "unknown remote operation '{other}'"
                )));
            }
        };
        Ok(op)
    }
}

pub fn encode_ack(result: bool) -> String {
    json!({ RESULT: result }).to_string()
}

pub fn encode_error(message: &str) -> String {
    json!({ ERROR: message }).to_string()
}

pub fn encode_device_list(devices: &[DeviceDescriptor]) -> String {
    let entries = devices
        .iter()
        .map(|descriptor| DeviceListEntry {
            serial: descriptor.serial.clone(),
            state: descriptor.state,
            variant: descriptor.product_variant.clone(),
        })
        .collect::<Vec<_>>();
    json!({ SERIALS: entries }).to_string()
}

pub fn encode_command_result(result: &CommandResult) -> String {
    serde_json::to_value(result)
        .unwrap_or_else(|_| json!({}))
        .to_string()
}

/// A parsed response line. `error` carries the failure reason when present;
/// its absence means the request was processed.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    value: Value,
}

impl RemoteResponse {
    pub fn parse(line: &str) -> Result<RemoteResponse, SchedError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|err| SchedError::remote_wire(format!("malformed response line: {err}")))?;
        Ok(RemoteResponse { value })
    }

    pub fn error(&self) -> Option<&str> {
        self.value.get(ERROR).and_then(Value::as_str)
    }

    pub fn result(&self) -> bool {
        self.value.get(RESULT).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn device_list(&self) -> Result<Vec<DeviceListEntry>, SchedError> {
        let serials = self
            .value
            .get(SERIALS)
            .cloned()
            .ok_or_else(|| SchedError::remote_wire("response is missing 'serials'"))?;
        serde_json::from_value(serials)
            .map_err(|err| SchedError::remote_wire(format!("bad device list payload: {err}")))
    }

    pub fn command_result(&self) -> Result<CommandResult, SchedError> {
        serde_json::from_value(self.value.clone())
            .map_err(|err| SchedError::remote_wire(format!("bad command result payload: {err}")))
    }
}

fn field_str(data: &Value, key: &str) -> Result<String, SchedError> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SchedError::remote_wire(format!("missing or non-string field '{key}'")))
}

fn field_u64(data: &Value, key: &str) -> Result<u64, SchedError> {
    data.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| SchedError::remote_wire(format!("missing or non-integer field '{key}'")))
}

fn field_string_array(data: &Value, key: &str) -> Result<Vec<String>, SchedError> {
    let items = data
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| SchedError::remote_wire(format!("missing or non-array field '{key}'")))?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                SchedError::remote_wire(format!("non-string entry in field '{key}'"))
            })
        })
        .collect()
}
