use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

use tracing::warn;

use crate::app::error::SchedError;
use crate::app::models::{CommandResult, DeviceListEntry};
use crate::app::remote::protocol::{RemoteOperation, RemoteResponse};

struct ClientInner {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

/// Client side of the remote protocol. Operations are synchronous
/// request/response pairs; sends are serialized so the client can be shared
/// across threads.
pub struct RemoteClient {
    inner: Mutex<ClientInner>,
}

impl RemoteClient {
    /// Connect to a remote manager on localhost.
    pub fn connect(port: u16) -> Result<Self, SchedError> {
        Self::connect_host("127.0.0.1", port)
    }

    pub fn connect_host(host: &str, port: u16) -> Result<Self, SchedError> {
        let writer = TcpStream::connect((host, port)).map_err(|err| {
            SchedError::socket(format!("failed to connect to {host}:{port}: {err}"))
        })?;
        let read_half = writer
            .try_clone()
            .map_err(|err| SchedError::socket(format!("failed to clone stream: {err}")))?;
        Ok(Self {
            inner: Mutex::new(ClientInner {
                writer,
                reader: BufReader::new(read_half),
            }),
        })
    }

    fn send(&self, op: &RemoteOperation) -> Result<RemoteResponse, SchedError> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let line = op.encode();
        guard
            .writer
            .write_all(line.as_bytes())
            .and_then(|_| guard.writer.write_all(b"\n"))
            .and_then(|_| guard.writer.flush())
            .map_err(|err| SchedError::socket(format!("failed to send request: {err}")))?;

        let mut response = String::new();
        let read = guard
            .reader
            .read_line(&mut response)
            .map_err(|err| SchedError::socket(format!("failed to read response: {err}")))?;
        if read == 0 {
            return Err(SchedError::socket("connection closed by remote manager"));
        }
        RemoteResponse::parse(response.trim_end())
    }

    /// Send an op whose response is a plain ack. An `error` in the response
    /// is surfaced as `Err`; otherwise the ack bool is returned.
    fn send_for_ack(&self, op: &RemoteOperation) -> Result<bool, SchedError> {
        let response = self.send(op)?;
        if let Some(message) = response.error() {
            return Err(SchedError::remote_wire(message));
        }
        Ok(response.result())
    }

    pub fn send_allocate_device(&self, serial: &str) -> Result<bool, SchedError> {
        self.send_for_ack(&RemoteOperation::AllocateDevice {
            serial: serial.to_string(),
        })
    }

    pub fn send_free_device(&self, serial: &str) -> Result<bool, SchedError> {
        self.send_for_ack(&RemoteOperation::FreeDevice {
            serial: serial.to_string(),
        })
    }

    pub fn send_add_command(&self, total_time_ms: u64, args: &[String]) -> Result<bool, SchedError> {
        self.send_for_ack(&RemoteOperation::AddCommand {
            time: total_time_ms,
            command_args: args.to_vec(),
        })
    }

    pub fn send_close(&self) -> Result<bool, SchedError> {
        self.send_for_ack(&RemoteOperation::Close)
    }

    pub fn send_handover_close(&self, port: u16) -> Result<bool, SchedError> {
        self.send_for_ack(&RemoteOperation::HandoverClose { port })
    }

    pub fn send_list_devices(&self) -> Result<Vec<DeviceListEntry>, SchedError> {
        let response = self.send(&RemoteOperation::ListDevices)?;
        if let Some(message) = response.error() {
            return Err(SchedError::remote_wire(message));
        }
        response.device_list()
    }

    pub fn send_exec_command(&self, serial: &str, args: &[String]) -> Result<bool, SchedError> {
        self.send_for_ack(&RemoteOperation::ExecCommand {
            serial: serial.to_string(),
            command_args: args.to_vec(),
        })
    }

    pub fn send_get_last_command_result(&self, serial: &str) -> Result<CommandResult, SchedError> {
        let response = self.send(&RemoteOperation::GetLastCommandResult {
            serial: serial.to_string(),
        })?;
        if let Some(message) = response.error() {
            return Err(SchedError::remote_wire(message));
        }
        response.command_result()
    }

    pub fn close(&self) {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(err) = guard.writer.shutdown(Shutdown::Both) {
            warn!(error = %err, "failed to shut down remote client socket");
        }
    }
}
