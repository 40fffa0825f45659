mod queue;
mod timer;
pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::config::{GlobalConfig, RemoteSettings, SchedulerSettings};
use crate::app::device::tracker::DeviceTracker;
use crate::app::error::{InvocationError, SchedError};
use crate::app::models::{DeviceAllocationState, FreeDeviceState};
use crate::app::ports::{
    ConfigFactory, Configuration, DeviceHandle, DeviceManager, InvocationRunner, Rescheduler,
    ScheduledInvocationListener,
};
use crate::app::remote::client::RemoteClient;
use crate::app::remote::manager::RemoteManager;

use queue::CommandQueue;
use timer::CommandTimer;

/// The identity of a command across all its executions. The accumulated
/// execution time doubles as the scheduling priority key: commands that have
/// consumed less machine time run first.
pub struct CommandTracker {
    id: u32,
    args: Vec<String>,
    total_exec_time_ms: Mutex<u64>,
}

impl CommandTracker {
    fn new(id: u32, args: Vec<String>) -> Self {
        Self {
            id,
            args,
            total_exec_time_ms: Mutex::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn increment_exec_time(&self, ms: u64) {
        let mut guard = self
            .total_exec_time_ms
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        *guard += ms;
    }

    pub fn total_exec_time(&self) -> u64 {
        *self
            .total_exec_time_ms
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    WaitingForDevice,
    Executing,
    Sleeping,
}

impl CommandState {
    pub fn display_name(&self) -> &'static str {
        match self {
            CommandState::WaitingForDevice => "Wait_for_device",
            CommandState::Executing => "Executing",
            CommandState::Sleeping => "Sleeping",
        }
    }
}

struct ExecState {
    state: CommandState,
    sleep_ms: Option<u64>,
}

/// One concrete queued execution of a tracker. Created at enqueue time and
/// dropped from the active set when its invocation reports completion.
pub struct ExecutableCommand {
    tracker: Arc<CommandTracker>,
    config: Configuration,
    rescheduled: bool,
    created_at: Instant,
    exec_state: Mutex<ExecState>,
}

impl ExecutableCommand {
    fn new(tracker: Arc<CommandTracker>, config: Configuration, rescheduled: bool) -> Self {
        Self {
            tracker,
            config,
            rescheduled,
            created_at: Instant::now(),
            exec_state: Mutex::new(ExecState {
                state: CommandState::WaitingForDevice,
                sleep_ms: None,
            }),
        }
    }

    pub fn tracker(&self) -> &Arc<CommandTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn is_rescheduled(&self) -> bool {
        self.rescheduled
    }

    pub fn is_loop_mode(&self) -> bool {
        self.config.command_options.loop_mode
    }

    pub fn state(&self) -> CommandState {
        self.exec_state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .state
    }

    fn total_exec_time(&self) -> u64 {
        self.tracker.total_exec_time()
    }

    fn command_started(&self) {
        let mut guard = self.exec_state.lock().unwrap_or_else(|p| p.into_inner());
        guard.state = CommandState::Executing;
        guard.sleep_ms = None;
    }

    fn set_sleep_state(&self, sleep_ms: u64) {
        let mut guard = self.exec_state.lock().unwrap_or_else(|p| p.into_inner());
        guard.state = CommandState::Sleeping;
        guard.sleep_ms = Some(sleep_ms);
    }

    fn set_wait_state(&self) {
        let mut guard = self.exec_state.lock().unwrap_or_else(|p| p.into_inner());
        guard.state = CommandState::WaitingForDevice;
        guard.sleep_ms = None;
    }

    fn sleep_ms(&self) -> Option<u64> {
        self.exec_state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .sleep_ms
    }
}

/// One-shot latch released once the scheduler main loop is live.
struct RunLatch {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl RunLatch {
    fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut guard = self.ready.lock().unwrap_or_else(|p| p.into_inner());
        *guard = true;
        self.cv.notify_all();
    }

    fn wait_open(&self) {
        let mut guard = self.ready.lock().unwrap_or_else(|p| p.into_inner());
        while !*guard {
            guard = self.cv.wait(guard).unwrap_or_else(|p| p.into_inner());
        }
    }
}

#[derive(Clone)]
struct InvocationInfo {
    command_id: u32,
    config_name: String,
    started_at: Instant,
    started_wall: DateTime<Local>,
}

/// Scheduler for running commands across the device fleet.
///
/// Commands with lower accumulated execution time are dispatched first, so
/// infrequent or fast-running commands take priority over long runners.
/// Runs in the background until one of the shutdown modes is requested.
#[derive(Clone)]
pub struct CommandScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    device_manager: Arc<dyn DeviceManager>,
    config_factory: Arc<dyn ConfigFactory>,
    runner: Arc<dyn InvocationRunner>,
    device_tracker: Arc<DeviceTracker>,
    settings: SchedulerSettings,
    remote_settings: RemoteSettings,
    queue: CommandQueue,
    all_commands: Mutex<Vec<Arc<ExecutableCommand>>>,
    invocations: Mutex<HashMap<String, InvocationInfo>>,
    invocation_joins: Mutex<Vec<JoinHandle<()>>>,
    timer: CommandTimer,
    next_command_id: Mutex<u32>,
    shutdown_on_empty: AtomicBool,
    started: AtomicBool,
    run_latch: RunLatch,
    handover_client: Mutex<Option<RemoteClient>>,
    remote_manager: Mutex<Option<RemoteManager>>,
    main_join: Mutex<Option<JoinHandle<()>>>,
}

impl CommandScheduler {
    pub fn new(
        device_manager: Arc<dyn DeviceManager>,
        config_factory: Arc<dyn ConfigFactory>,
        runner: Arc<dyn InvocationRunner>,
        device_tracker: Arc<DeviceTracker>,
        config: &GlobalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                device_manager,
                config_factory,
                runner,
                device_tracker,
                settings: config.scheduler.clone(),
                remote_settings: config.remote.clone(),
                queue: CommandQueue::new(),
                all_commands: Mutex::new(Vec::new()),
                invocations: Mutex::new(HashMap::new()),
                invocation_joins: Mutex::new(Vec::new()),
                timer: CommandTimer::new(),
                next_command_id: Mutex::new(0),
                shutdown_on_empty: AtomicBool::new(false),
                started: AtomicBool::new(false),
                run_latch: RunLatch::new(),
                handover_client: Mutex::new(None),
                remote_manager: Mutex::new(None),
                main_join: Mutex::new(None),
            }),
        }
    }

    /// Start the scheduler main loop on its own thread. Must be called
    /// exactly once before commands are added.
    pub fn start(&self) -> Result<(), SchedError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedError::state("scheduler has already been started"));
        }
        self.inner.device_manager.init();
        let inner = Arc::clone(&self.inner);
        let join = thread::spawn(move || run_loop(inner));
        *self
            .inner
            .main_join
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(join);
        Ok(())
    }

    /// Block until the main loop has come up.
    pub fn await_running(&self) {
        self.inner.run_latch.wait_open();
    }

    /// Block until the scheduler has fully terminated.
    pub fn join(&self) {
        let join = self
            .inner
            .main_join
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }

    pub fn add_command(&self, args: &[String]) -> Result<bool, SchedError> {
        self.add_command_with_time(args, 0)
    }

    /// Add a command with an initial accumulated execution time, used during
    /// handover so a loaded command does not restart at top priority.
    pub fn add_command_with_time(
        &self,
        args: &[String],
        total_exec_time_ms: u64,
    ) -> Result<bool, SchedError> {
        self.inner.assert_started()?;
        let config = self.inner.config_factory.create_configuration_from_args(args)?;
        let options = &config.command_options;
        if options.help_mode {
            println!("{}", self.inner.config_factory.help_for_config(args, true));
            return Ok(false);
        }
        if options.full_help_mode {
            println!("{}", self.inner.config_factory.help_for_config(args, false));
            return Ok(false);
        }
        if options.dry_run_mode {
            config.validate_options()?;
            let cmd_line = combine_tokens(args);
            debug!(command = %cmd_line, "dry run mode; skipping adding command");
            if options.noisy_dry_run_mode {
                println!("{}", strip_noisy_dry_run(args));
                println!();
            }
            return Ok(true);
        }
        config.validate_options()?;

        if options.run_on_all_devices {
            add_command_for_all_devices(&self.inner, total_exec_time_ms, args)?;
        } else {
            let tracker = self.inner.create_command_tracker(args.to_vec());
            tracker.increment_exec_time(total_exec_time_ms);
            let cmd = self.inner.create_executable_command(&tracker, config, false);
            add_exec_command_to_queue(&self.inner, cmd, Duration::ZERO);
        }
        Ok(true)
    }

    /// Run a command immediately on an already-allocated device, bypassing
    /// the queue. The caller keeps responsibility for freeing the device.
    pub fn exec_command(
        &self,
        listener: Arc<dyn ScheduledInvocationListener>,
        device: DeviceHandle,
        args: &[String],
    ) -> Result<(), SchedError> {
        self.inner.assert_started()?;
        let tracker = self.inner.create_command_tracker(args.to_vec());
        let config = self
            .inner
            .config_factory
            .create_configuration_from_args(tracker.args())?;
        config.validate_options()?;
        info!(
            config = %config.name,
            serial = %device.serial(),
            "executing command on device"
        );
        let cmd = self.inner.create_executable_command(&tracker, config, false);
        start_invocation(&self.inner, listener, device, cmd)
    }

    /// Stop accepting work, discard waiting commands, and terminate once
    /// in-flight invocations finish.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Drain semantics: behave like `shutdown` once the last command leaves
    /// the active set.
    pub fn shutdown_on_empty(&self) {
        if !self.inner.is_shutting_down() {
            debug!("initiating shutdown on empty");
            self.inner.shutdown_on_empty.store(true, Ordering::SeqCst);
        }
    }

    /// `shutdown` plus a hard bridge termination to cut running invocations
    /// short.
    pub fn shutdown_hard(&self) {
        self.inner.shutdown();
        warn!("force terminating the device manager bridge");
        self.inner.device_manager.terminate_hard();
    }

    /// Discard every waiting and sleeping command; executing commands are
    /// untouched.
    pub fn remove_all_commands(&self) {
        debug!("removing all commands");
        self.inner.timer.drain();
        self.inner.clear_waiting_commands();
    }

    /// Transfer allocated devices and pending commands to the scheduler
    /// process listening on `port`, then initiate local shutdown.
    pub fn handover_shutdown(&self, port: u16) -> bool {
        handover_shutdown(&self.inner, port)
    }

    /// Port of the running remote manager, if one was started.
    pub fn remote_manager_port(&self) -> Option<u16> {
        self.inner
            .remote_manager
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|manager| manager.port())
    }

    pub fn display_invocations_info(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let invocations = {
            let guard = self
                .inner
                .invocations
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            guard
                .iter()
                .map(|(serial, info)| (serial.clone(), info.clone()))
                .collect::<Vec<_>>()
        };
        if invocations.is_empty() {
            return Ok(());
        }
        let mut rows = vec![vec![
            "Command Id".to_string(),
            "Exec Time".to_string(),
            "Device".to_string(),
            "Config".to_string(),
            "Started".to_string(),
        ]];
        for (serial, info) in invocations {
            rows.push(vec![
                info.command_id.to_string(),
                time_string(info.started_at.elapsed().as_millis() as u64),
                serial,
                info.config_name,
                info.started_wall.format("%H:%M:%S").to_string(),
            ]);
        }
        write!(out, "{}", format_table(&rows))
    }

    pub fn display_commands_info(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let mut trackers = self.inner.command_trackers();
        trackers.sort_by_key(|tracker| tracker.id());
        for tracker in trackers {
            writeln!(
                out,
                "Command {}: [{}] {}",
                tracker.id(),
                time_string(tracker.total_exec_time()),
                combine_tokens(tracker.args())
            )?;
        }
        Ok(())
    }

    pub fn display_command_queue(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let commands = {
            let guard = self
                .inner
                .all_commands
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        if commands.is_empty() {
            return Ok(());
        }
        let mut rows = vec![vec![
            "Id".to_string(),
            "Config".to_string(),
            "Created".to_string(),
            "State".to_string(),
            "Sleep time".to_string(),
            "Rescheduled".to_string(),
            "Loop".to_string(),
        ]];
        for cmd in commands {
            let sleep = cmd
                .sleep_ms()
                .map(time_string)
                .unwrap_or_else(|| "N/A".to_string());
            rows.push(vec![
                cmd.tracker().id().to_string(),
                cmd.config().name.clone(),
                time_string(cmd.created_at.elapsed().as_millis() as u64),
                cmd.state().display_name().to_string(),
                sleep,
                cmd.is_rescheduled().to_string(),
                cmd.is_loop_mode().to_string(),
            ]);
        }
        write!(out, "{}", format_table(&rows))
    }

    #[cfg(test)]
    pub(crate) fn queued_command_count(&self) -> usize {
        self.inner.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn active_command_count(&self) -> usize {
        self.inner
            .all_commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

impl SchedulerInner {
    fn assert_started(&self) -> Result<(), SchedError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(SchedError::state(
                "start() must be called before this operation",
            ));
        }
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        if self.timer.is_shutdown() {
            return true;
        }
        self.shutdown_on_empty.load(Ordering::SeqCst)
            && self
                .all_commands
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .is_empty()
    }

    fn is_shutting_down(&self) -> bool {
        self.timer.is_shutdown() || self.shutdown_on_empty.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.is_shutting_down() {
            return;
        }
        debug!("initiating shutdown");
        self.clear_waiting_commands();
        self.timer.shutdown();
    }

    fn clear_waiting_commands(&self) {
        self.queue.clear();
        let mut guard = self.all_commands.lock().unwrap_or_else(|p| p.into_inner());
        guard.retain(|cmd| cmd.state() == CommandState::Executing);
    }

    fn create_command_tracker(&self, args: Vec<String>) -> Arc<CommandTracker> {
        let mut guard = self
            .next_command_id
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        *guard += 1;
        let id = *guard;
        debug!(command_id = id, args = %combine_tokens(&args), "creating command tracker");
        Arc::new(CommandTracker::new(id, args))
    }

    fn create_executable_command(
        &self,
        tracker: &Arc<CommandTracker>,
        config: Configuration,
        rescheduled: bool,
    ) -> Arc<ExecutableCommand> {
        let cmd = Arc::new(ExecutableCommand::new(
            Arc::clone(tracker),
            config,
            rescheduled,
        ));
        debug!(command_id = tracker.id(), "creating exec command");
        self.all_commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::clone(&cmd));
        cmd
    }

    /// Active trackers in insertion order: everything added to the scheduler
    /// that is executing, waiting for a device, or looping.
    fn command_trackers(&self) -> Vec<Arc<CommandTracker>> {
        let commands = {
            let guard = self.all_commands.lock().unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        let mut seen = HashSet::new();
        let mut trackers = Vec::new();
        for cmd in commands {
            if seen.insert(cmd.tracker().id()) {
                trackers.push(Arc::clone(cmd.tracker()));
            }
        }
        trackers
    }

    fn remote_free_device(&self, serial: &str) {
        let guard = self
            .handover_client
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(client) = guard.as_ref() {
            if let Err(err) = client.send_free_device(serial) {
                error!(serial = %serial, error = %err, "failed to notify remote manager of freed device");
            }
        }
    }

    fn close_handover_client(&self) {
        let client = self
            .handover_client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(client) = client {
            if let Err(err) = client.send_close() {
                warn!(error = %err, "failed to send close to handover peer");
            }
            client.close();
        }
    }
}

fn add_exec_command_to_queue(
    inner: &Arc<SchedulerInner>,
    cmd: Arc<ExecutableCommand>,
    delay: Duration,
) -> bool {
    if inner.is_shutdown() {
        return false;
    }
    if delay > Duration::ZERO {
        cmd.set_sleep_state(delay.as_millis() as u64);
        let timer_inner = Arc::clone(inner);
        let sleeping = Arc::clone(&cmd);
        inner.timer.schedule(delay, move || {
            sleeping.set_wait_state();
            timer_inner.queue.add(sleeping);
        });
    } else {
        inner.queue.add(cmd);
    }
    true
}

fn add_command_for_all_devices(
    inner: &Arc<SchedulerInner>,
    total_exec_time_ms: u64,
    args: &[String],
) -> Result<(), SchedError> {
    for descriptor in inner.device_manager.list_all_devices() {
        let serial = descriptor.serial;
        let mut args_with_device = args.to_vec();
        args_with_device.push("-s".to_string());
        args_with_device.push(serial.clone());
        let tracker = inner.create_command_tracker(args_with_device);
        tracker.increment_exec_time(total_exec_time_ms);
        let mut config = inner
            .config_factory
            .create_configuration_from_args(tracker.args())?;
        info!(config = %config.name, serial = %serial, "scheduling command on device");
        config.device_requirements.serial = Some(serial);
        let cmd = inner.create_executable_command(&tracker, config, false);
        add_exec_command_to_queue(inner, cmd, Duration::ZERO);
    }
    Ok(())
}

/// Re-parse the tracker's args and enqueue a fresh execution after the
/// configured minimum loop time.
fn add_new_exec_command_to_queue(inner: &Arc<SchedulerInner>, tracker: Arc<CommandTracker>) {
    match inner
        .config_factory
        .create_configuration_from_args(tracker.args())
    {
        Ok(config) => {
            let delay = Duration::from_millis(config.command_options.min_loop_time_ms);
            let cmd = inner.create_executable_command(&tracker, config, false);
            add_exec_command_to_queue(inner, cmd, delay);
        }
        Err(err) => {
            error!(command_id = tracker.id(), error = %err, "failed to re-parse loop command");
        }
    }
}

fn start_invocation(
    inner: &Arc<SchedulerInner>,
    listener: Arc<dyn ScheduledInvocationListener>,
    device: DeviceHandle,
    cmd: Arc<ExecutableCommand>,
) -> Result<(), SchedError> {
    {
        let mut invocations = inner.invocations.lock().unwrap_or_else(|p| p.into_inner());
        if invocations.contains_key(device.serial()) {
            return Err(SchedError::state(format!(
                "attempting invocation on device {} when one is already running",
                device.serial()
            )));
        }
        invocations.insert(
            device.serial().to_string(),
            InvocationInfo {
                command_id: cmd.tracker().id(),
                config_name: cmd.config().name.clone(),
                started_at: Instant::now(),
                started_wall: Local::now(),
            },
        );
    }
    let thread_inner = Arc::clone(inner);
    let join = thread::spawn(move || invocation_body(thread_inner, listener, device, cmd));
    let mut joins = inner
        .invocation_joins
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    joins.retain(|join| !join.is_finished());
    joins.push(join);
    Ok(())
}

fn handover_shutdown(inner: &Arc<SchedulerInner>, port: u16) -> bool {
    let mut client_guard = inner
        .handover_client
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    if client_guard.is_some() {
        error!("a handover has already been initiated");
        return false;
    }
    let client = match RemoteClient::connect(port) {
        Ok(client) => client,
        Err(err) => {
            error!(port, error = %err, "failed to connect handover client");
            return false;
        }
    };
    debug!(port, "connected to remote manager for handover");

    // Devices first, so the receiving scheduler can match incoming
    // commands to devices already attributed to this process.
    for descriptor in inner.device_manager.list_all_devices() {
        if descriptor.state != DeviceAllocationState::Allocated {
            continue;
        }
        match client.send_allocate_device(&descriptor.serial) {
            Ok(_) => debug!(serial = %descriptor.serial, "sent allocate for in-use device"),
            Err(err) => {
                error!(serial = %descriptor.serial, error = %err, "handover allocate failed");
                return false;
            }
        }
    }

    // Highest-priority (lowest time) commands first so the final queue
    // order on the receiving side matches ours.
    let mut trackers = inner.command_trackers();
    trackers.sort_by_key(|tracker| tracker.total_exec_time());
    for tracker in trackers {
        if let Err(err) = client.send_add_command(tracker.total_exec_time(), tracker.args()) {
            error!(command_id = tracker.id(), error = %err, "handover add-command failed");
            return false;
        }
    }

    // Keep the client open: completing invocations still notify the new
    // process of each freed device before we terminate.
    *client_guard = Some(client);
    drop(client_guard);
    inner.shutdown();
    true
}

/// Returns the device to the device manager and forwards the free to any
/// handover peer.
struct FreeDeviceHandler {
    inner: Arc<SchedulerInner>,
}

impl ScheduledInvocationListener for FreeDeviceHandler {
    fn invocation_complete(&self, device: &DeviceHandle, state: FreeDeviceState) {
        self.inner
            .device_manager
            .free_device(Arc::clone(device), state);
        self.inner.remote_free_device(device.serial());
    }
}

/// Adds executions of an existing tracker back onto the queue on behalf of
/// the invocation runner.
struct TrackerRescheduler {
    inner: Arc<SchedulerInner>,
    tracker: Arc<CommandTracker>,
}

impl Rescheduler for TrackerRescheduler {
    fn schedule_config(&self, mut config: Configuration) -> bool {
        // Force loop mode off, otherwise each rescheduled config would be
        // treated as a new command and added back to the queue.
        config.command_options.loop_mode = false;
        let cmd = self
            .inner
            .create_executable_command(&self.tracker, config, true);
        add_exec_command_to_queue(&self.inner, cmd, Duration::ZERO)
    }

    fn reschedule_command(&self) -> bool {
        debug!(command_id = self.tracker.id(), "rescheduling command");
        match self
            .inner
            .config_factory
            .create_configuration_from_args(self.tracker.args())
        {
            Ok(config) => {
                let delay = Duration::from_millis(config.command_options.min_loop_time_ms);
                let cmd = self
                    .inner
                    .create_executable_command(&self.tracker, config, true);
                add_exec_command_to_queue(&self.inner, cmd, delay)
            }
            Err(err) => {
                // Args may contain credentials; keep them out of the record.
                warn!(command_id = self.tracker.id(), error = %err, "error while re-parsing command args");
                false
            }
        }
    }
}

fn run_loop(inner: Arc<SchedulerInner>) {
    inner.run_latch.open();

    if inner.remote_settings.start_remote_mgr_on_boot {
        match start_remote_manager(&inner) {
            Some(port) => info!(port = port, "remote manager is up and running"),
            None => warn!("remote manager could not be started"),
        }
    }

    let poll_time = Duration::from_millis(inner.settings.command_poll_time_ms);
    let no_device_delay = Duration::from_millis(inner.settings.no_device_delay_ms);
    while !inner.is_shutdown() {
        let Some(cmd) = inner.queue.poll(poll_time) else {
            continue;
        };
        let device = inner
            .device_manager
            .allocate_device(Duration::ZERO, &cmd.config().device_requirements);
        match device {
            Some(device) => {
                let listener = Arc::new(FreeDeviceHandler {
                    inner: Arc::clone(&inner),
                });
                let serial = device.serial().to_string();
                if let Err(err) =
                    start_invocation(&inner, listener, Arc::clone(&device), Arc::clone(&cmd))
                {
                    error!(serial = %serial, error = %err, "failed to start invocation");
                    inner
                        .device_manager
                        .free_device(device, FreeDeviceState::Available);
                    cmd.tracker().increment_exec_time(1);
                    add_exec_command_to_queue(&inner, cmd, no_device_delay);
                    continue;
                }
                if cmd.is_loop_mode() {
                    add_new_exec_command_to_queue(&inner, Arc::clone(cmd.tracker()));
                }
            }
            None => {
                // No device for this command right now. Nudge its exec time
                // so device-starved commands rotate fairly, then retry.
                cmd.tracker().increment_exec_time(1);
                add_exec_command_to_queue(&inner, cmd, no_device_delay);
            }
        }
    }

    inner.timer.shutdown();
    info!("waiting for invocation threads to complete");
    let joins = {
        let mut guard = inner
            .invocation_joins
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        guard.drain(..).collect::<Vec<_>>()
    };
    for join in joins {
        let _ = join.join();
    }

    inner.close_handover_client();
    let manager = inner
        .remote_manager
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take();
    if let Some(manager) = manager {
        manager.cancel();
        manager.join();
    }
    inner.device_manager.terminate();
    info!("all done");
}

fn invocation_body(
    inner: Arc<SchedulerInner>,
    listener: Arc<dyn ScheduledInvocationListener>,
    device: DeviceHandle,
    cmd: Arc<ExecutableCommand>,
) {
    let trace_id = Uuid::new_v4().to_string();
    let start = Instant::now();
    let mut free_state = FreeDeviceState::Available;
    cmd.command_started();
    let rescheduler = TrackerRescheduler {
        inner: Arc::clone(&inner),
        tracker: Arc::clone(cmd.tracker()),
    };
    let result = inner
        .runner
        .invoke(&device, cmd.config(), &rescheduler, listener.as_ref());
    if let Err(err) = result {
        listener.invocation_failed(&err);
        match &err {
            InvocationError::DeviceUnresponsive(reason) => {
                warn!(
                    trace_id = %trace_id,
                    serial = %device.serial(),
                    reason = %reason,
                    "device is unresponsive"
                );
                free_state = FreeDeviceState::Unresponsive;
            }
            InvocationError::DeviceNotAvailable(reason) => {
                warn!(
                    trace_id = %trace_id,
                    serial = %device.serial(),
                    reason = %reason,
                    "device is not available"
                );
                free_state = FreeDeviceState::Unavailable;
            }
            InvocationError::FatalHostError(reason) => {
                error!(trace_id = %trace_id, reason = %reason, "fatal host error; shutting down");
                inner.shutdown();
            }
            InvocationError::Other(reason) => {
                error!(
                    trace_id = %trace_id,
                    serial = %device.serial(),
                    reason = %reason,
                    "invocation failed"
                );
            }
        }
    }
    let elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        command_id = cmd.tracker().id(),
        elapsed_ms, "updating command with elapsed time"
    );
    // Remove the invocation record first so the freed device can host a new
    // invocation immediately.
    inner
        .invocations
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove(device.serial());
    cmd.tracker().increment_exec_time(elapsed_ms);
    inner
        .all_commands
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .retain(|active| !Arc::ptr_eq(active, &cmd));
    listener.invocation_complete(&device, free_state);
}

/// Bring up the remote manager per the configured policy: bind the default
/// port, fall back to an ephemeral port, or hand work over from the process
/// currently occupying the port.
fn start_remote_manager(inner: &Arc<SchedulerInner>) -> Option<u16> {
    let settings = inner.remote_settings.clone();
    let scheduler = CommandScheduler {
        inner: Arc::clone(inner),
    };
    let manager = RemoteManager::new(
        Arc::clone(&inner.device_manager),
        Arc::clone(&inner.device_tracker),
        scheduler.clone(),
        settings.clone(),
    );
    if manager.connect() {
        manager.start();
        let port = manager.port();
        *inner
            .remote_manager
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(manager);
        return port;
    }
    info!(
        port = settings.remote_mgr_port,
        "default remote manager port is busy"
    );
    if !settings.auto_handover {
        if manager.connect_any_port() {
            manager.start();
            let port = manager.port();
            info!(port = ?port, "started remote manager on ephemeral port, no handover");
            *inner
                .remote_manager
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = Some(manager);
            return port;
        }
        error!("failed to start a remote manager on boot");
        return None;
    }

    // Auto handover: stand up a temporary manager on an ephemeral port, ask
    // the occupant to hand its devices and commands over to it, then capture
    // the default port once the occupant shuts down.
    if !manager.connect_any_port() {
        error!("failed to open a temporary handover port");
        return None;
    }
    manager.start();
    let tmp_port = manager.port()?;
    let client = match RemoteClient::connect(settings.remote_mgr_port) {
        Ok(client) => client,
        Err(err) => {
            error!(port = settings.remote_mgr_port, error = %err, "failed to reach occupant for handover");
            manager.cancel();
            manager.join();
            return None;
        }
    };
    info!(
        port = settings.remote_mgr_port,
        "connecting to existing scheduler process; attempting takeover"
    );
    match client.send_handover_close(tmp_port) {
        Ok(true) => {}
        Ok(false) => warn!("occupant refused handover close"),
        Err(err) => error!(error = %err, "handover close failed"),
    }
    client.close();

    let replacement = RemoteManager::new(
        Arc::clone(&inner.device_manager),
        Arc::clone(&inner.device_tracker),
        scheduler,
        settings.clone(),
    );
    while !replacement.connect() {
        if inner.is_shutdown() {
            manager.cancel();
            manager.join();
            return None;
        }
        thread::sleep(Duration::from_secs(2));
    }
    // The temporary manager has received the occupant's state by the time
    // the default port frees up.
    manager.cancel();
    manager.join();
    replacement.start();
    let port = replacement.port();
    *inner
        .remote_manager
        .lock()
        .unwrap_or_else(|p| p.into_inner()) = Some(replacement);
    info!(port = ?port, "started remote manager after handover");
    port
}

/// Join args into a display line, re-quoting tokens containing whitespace.
fn combine_tokens(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.chars().any(char::is_whitespace) {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_noisy_dry_run(args: &[String]) -> String {
    let remaining = args
        .iter()
        .filter(|arg| arg.as_str() != "--noisy-dry-run")
        .cloned()
        .collect::<Vec<_>>();
    combine_tokens(&remaining)
}

fn time_string(elapsed_ms: u64) -> String {
    let duration = elapsed_ms / 1000;
    let secs = duration % 60;
    let mins = (duration / 60) % 60;
    let hrs = duration / (60 * 60);
    if hrs > 0 {
        format!("{hrs}h{mins:02}:{secs:02}")
    } else {
        format!("{mins}m:{secs:02}")
    }
}

fn format_table(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; columns];
    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            widths[index] = widths[index].max(cell.len());
        }
    }
    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for (index, cell) in row.iter().enumerate() {
            line.push_str(cell);
            if index + 1 < row.len() {
                for _ in cell.len()..widths[index] + 2 {
                    line.push(' ');
                }
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
