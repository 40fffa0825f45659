use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::app::command::CommandScheduler;
use crate::app::config::RemoteSettings;
use crate::app::device::tracker::DeviceTracker;
use crate::app::models::{CommandResult, CommandResultStatus, FreeDeviceState};
use crate::app::ports::{DeviceManager, ScheduledInvocationListener};
use crate::app::remote::exec_tracker::ExecCommandTracker;
use crate::app::remote::protocol::{self, RemoteOperation, ALL_DEVICES};

struct ManagerInner {
    device_manager: Arc<dyn DeviceManager>,
    device_tracker: Arc<DeviceTracker>,
    scheduler: CommandScheduler,
    settings: RemoteSettings,
    cancel: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
    exec_trackers: Mutex<HashMap<String, Arc<ExecCommandTracker>>>,
}

impl ManagerInner {
    fn port(&self) -> Option<u16> {
        let guard = self.listener.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    fn cancel(&self) {
        if !self.cancel.swap(true, Ordering::SeqCst) {
            info!(port = ?self.port(), "closing remote manager");
        }
    }
}

/// Receives remote operations over a socket. Accepts one client at a time
/// and processes its requests serially, one response line per request line.
pub struct RemoteManager {
    inner: Arc<ManagerInner>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteManager {
    pub fn new(
        device_manager: Arc<dyn DeviceManager>,
        device_tracker: Arc<DeviceTracker>,
        scheduler: CommandScheduler,
        settings: RemoteSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                device_manager,
                device_tracker,
                scheduler,
                settings,
                cancel: AtomicBool::new(false),
                listener: Mutex::new(None),
                exec_trackers: Mutex::new(HashMap::new()),
            }),
            join: Mutex::new(None),
        }
    }

    /// Bind the configured port. Returns whether the bind succeeded.
    pub fn connect(&self) -> bool {
        self.bind(self.inner.settings.remote_mgr_port)
    }

    /// Bind any free port.
    pub fn connect_any_port(&self) -> bool {
        self.bind(0)
    }

    fn bind(&self, port: u16) -> bool {
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                if let Err(err) = listener.set_nonblocking(true) {
                    error!(error = %err, "failed to configure server socket");
                    return false;
                }
                *self
                    .inner
                    .listener
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(listener);
                true
            }
            Err(err) => {
                error!(port, error = %err, "failed to open server socket");
                false
            }
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.port()
    }

    /// Start the accept loop on its own thread. `connect` (or
    /// `connect_any_port`) must have succeeded first.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let join = thread::spawn(move || accept_loop(inner));
        *self.join.lock().unwrap_or_else(|p| p.into_inner()) = Some(join);
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    pub fn join(&self) {
        let join = self.join.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

fn accept_loop(inner: Arc<ManagerInner>) {
    let accept_timeout = Duration::from_millis(inner.settings.accept_timeout_ms.max(1));
    loop {
        if inner.cancel.load(Ordering::SeqCst) {
            break;
        }
        let accepted = {
            let guard = inner.listener.lock().unwrap_or_else(|p| p.into_inner());
            match guard.as_ref() {
                Some(listener) => listener.accept(),
                None => {
                    error!("remote manager started without a bound socket");
                    break;
                }
            }
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "accepted remote client");
                if let Err(err) = handle_session(&inner, stream) {
                    warn!(error = %err, "remote session abandoned");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(accept_timeout);
            }
            Err(err) => {
                error!(error = %err, "failed to accept connection");
                thread::sleep(accept_timeout);
            }
        }
    }
    // The devices we held for the remote peer go back to the pool.
    free_all_devices(&inner);
    *inner.listener.lock().unwrap_or_else(|p| p.into_inner()) = None;
}

fn handle_session(inner: &Arc<ManagerInner>, stream: TcpStream) -> io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(
        inner.settings.socket_timeout_ms.max(1),
    )))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    while !inner.cancel.load(Ordering::SeqCst) {
        let Some(line) = read_line_with_cancel(&mut reader, &inner.cancel)? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match RemoteOperation::decode(line.trim_end()) {
            Ok(op) => process_operation(inner, op),
            Err(err) => {
                error!(error = %err, "failed to handle remote command");
                protocol::encode_error(&err.error)
            }
        };
        writer.write_all(response.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    Ok(())
}

/// Read one newline-terminated line, waking up on every read timeout to
/// observe the cancel flag. `None` means the peer closed the connection or
/// the manager was cancelled mid-read.
fn read_line_with_cancel(
    reader: &mut BufReader<TcpStream>,
    cancel: &AtomicBool,
) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => {
                if line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
                line.push(byte[0]);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

fn process_operation(inner: &Arc<ManagerInner>, op: RemoteOperation) -> String {
    match op {
        RemoteOperation::AllocateDevice { serial } => {
            match inner.device_manager.force_allocate_device(&serial) {
                Some(device) => {
                    info!(serial = %serial, "allocating device still in use by remote peer");
                    inner.device_tracker.allocate(device);
                    protocol::encode_ack(true)
                }
                None => {
                    error!(serial = %serial, "failed to allocate device");
                    protocol::encode_ack(false)
                }
            }
        }
        RemoteOperation::FreeDevice { serial } => {
            if serial == ALL_DEVICES {
                protocol::encode_ack(free_all_devices(inner))
            } else {
                match inner.device_tracker.free(&serial) {
                    Some(device) => {
                        info!(serial = %serial, "freeing device no longer in use by remote peer");
                        inner
                            .device_manager
                            .free_device(device, FreeDeviceState::Available);
                        protocol::encode_ack(true)
                    }
                    None => {
                        warn!(serial = %serial, "could not find device to free");
                        protocol::encode_ack(false)
                    }
                }
            }
        }
        RemoteOperation::Close => {
            inner.cancel();
            protocol::encode_ack(true)
        }
        RemoteOperation::AddCommand { time, command_args } => {
            info!(args = %command_args.join(" "), "adding command from remote peer");
            match inner.scheduler.add_command_with_time(&command_args, time) {
                Ok(accepted) => protocol::encode_ack(accepted),
                Err(err) => {
                    error!(error = %err, "failed to add command");
                    protocol::encode_ack(false)
                }
            }
        }
        RemoteOperation::HandoverClose { port } => {
            info!(port, "handling handover close");
            protocol::encode_ack(inner.scheduler.handover_shutdown(port))
        }
        RemoteOperation::ListDevices => {
            protocol::encode_device_list(&inner.device_manager.list_all_devices())
        }
        RemoteOperation::ExecCommand { serial, command_args } => {
            let Some(device) = inner.device_tracker.get(&serial) else {
                return protocol::encode_error(&format!(
                    "device {serial} is not allocated in this session"
                ));
            };
            {
                let trackers = inner
                    .exec_trackers
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                if let Some(tracker) = trackers.get(&serial) {
                    if tracker.is_executing() {
                        return protocol::encode_error(&format!(
                            "a command is already executing on device {serial}"
                        ));
                    }
                }
            }
            let tracker = Arc::new(ExecCommandTracker::new());
            let listener: Arc<dyn ScheduledInvocationListener> = tracker.clone();
            match inner.scheduler.exec_command(listener, device, &command_args) {
                Ok(()) => {
                    inner
                        .exec_trackers
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(serial, tracker);
                    protocol::encode_ack(true)
                }
                Err(err) => protocol::encode_error(&err.error),
            }
        }
        RemoteOperation::GetLastCommandResult { serial } => {
            let result = if !inner.device_tracker.contains(&serial) {
                CommandResult::with_status(CommandResultStatus::NotAllocated)
            } else {
                let trackers = inner
                    .exec_trackers
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                match trackers.get(&serial) {
                    Some(tracker) => tracker.command_result(),
                    None => CommandResult::with_status(CommandResultStatus::NoActiveCommand),
                }
            };
            protocol::encode_command_result(&result)
        }
    }
}

fn free_all_devices(inner: &Arc<ManagerInner>) -> bool {
    let mut freed_any = false;
    for device in inner.device_tracker.free_all() {
        info!(serial = %device.serial(), "freeing device no longer in use by remote peer");
        inner
            .device_manager
            .free_device(device, FreeDeviceState::Available);
        freed_any = true;
    }
    freed_any
}
