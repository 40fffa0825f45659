use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use tracing::{error, warn};

use crate::app::command::CommandScheduler;
use crate::app::config::WatcherSettings;
use crate::app::ports::CommandFileParser;

/// A watched command file: the primary file that gets re-parsed, its extra
/// args, and dependency files that trigger a reload without being re-parsed
/// themselves.
pub struct CommandFile {
    pub path: PathBuf,
    pub extra_args: Vec<String>,
    pub dependencies: Vec<CommandFile>,
    mtime: Option<SystemTime>,
}

impl CommandFile {
    pub fn new(path: PathBuf) -> Self {
        Self::with_args(path, Vec::new(), Vec::new())
    }

    pub fn with_args(path: PathBuf, extra_args: Vec<String>, dependencies: Vec<PathBuf>) -> Self {
        let mtime = read_mtime(&path);
        Self {
            path,
            extra_args,
            dependencies: dependencies.into_iter().map(CommandFile::new).collect(),
            mtime,
        }
    }
}

fn read_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

struct WatcherInner {
    files: Mutex<Vec<CommandFile>>,
    scheduler: CommandScheduler,
    parser: Arc<dyn CommandFileParser>,
    poll_interval: Duration,
    cancel: AtomicBool,
}

/// Watches a set of command files for changes and triggers a reload of all
/// of them when any primary file or dependency changes on disk.
pub struct CommandFileWatcher {
    inner: Arc<WatcherInner>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl CommandFileWatcher {
    pub fn new(
        scheduler: CommandScheduler,
        parser: Arc<dyn CommandFileParser>,
        settings: &WatcherSettings,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                files: Mutex::new(Vec::new()),
                scheduler,
                parser,
                poll_interval: Duration::from_millis(settings.poll_interval_ms),
                cancel: AtomicBool::new(false),
            }),
            join: Mutex::new(None),
        }
    }

    /// Watch a command file and its dependencies. A change in any of them
    /// reloads every watched primary file.
    pub fn add_command_file(
        &self,
        path: PathBuf,
        extra_args: Vec<String>,
        dependencies: Vec<PathBuf>,
    ) {
        let mut files = self.inner.files.lock().unwrap_or_else(|p| p.into_inner());
        files.push(CommandFile::with_args(path, extra_args, dependencies));
    }

    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let join = thread::spawn(move || poll_loop(inner));
        *self.join.lock().unwrap_or_else(|p| p.into_inner()) = Some(join);
    }

    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    pub fn join(&self) {
        let join = self.join.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

fn poll_loop(inner: Arc<WatcherInner>) {
    while !inner.cancel.load(Ordering::SeqCst) {
        if check_for_updates(&inner) {
            reload_command_files(&inner);
        }
        // Sleep in short steps so cancellation is observed promptly.
        let mut remaining = inner.poll_interval;
        while remaining > Duration::ZERO && !inner.cancel.load(Ordering::SeqCst) {
            let step = remaining.min(Duration::from_millis(100));
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}

fn check_for_updates(inner: &WatcherInner) -> bool {
    let files = inner.files.lock().unwrap_or_else(|p| p.into_inner());
    let mut checked = HashSet::new();
    files
        .iter()
        .any(|file| command_file_updated(file, &mut checked))
}

fn command_file_updated(cmd: &CommandFile, checked: &mut HashSet<PathBuf>) -> bool {
    if !checked.insert(cmd.path.clone()) {
        return false;
    }
    // A missing file (or stat error) is not a change; if something real
    // happens to it later, the new mtime will differ from the stored one.
    if let Some(current) = read_mtime(&cmd.path) {
        if cmd.mtime != Some(current) {
            warn!(path = %cmd.path.display(), "found update in monitored command file");
            return true;
        }
    }
    cmd.dependencies
        .iter()
        .any(|dep| command_file_updated(dep, checked))
}

/// Drop all queued commands, forget the watchset, and re-parse every primary
/// file. Parsing repopulates the scheduler (and, through the parser, the
/// watchset).
fn reload_command_files(inner: &WatcherInner) {
    warn!("auto-reloading all command files");
    inner.scheduler.remove_all_commands();

    let files = {
        let mut guard = inner.files.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *guard)
    };
    for cmd in files {
        if let Err(err) = inner
            .parser
            .parse_file(&cmd.path, &inner.scheduler, &cmd.extra_args)
        {
            error!(
                path = %cmd.path.display(),
                error = %err,
                "failed to automatically reload command file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    use crate::app::config::GlobalConfig;
    use crate::app::device::tracker::DeviceTracker;
    use crate::app::error::{InvocationError, SchedError};
    use crate::app::models::{DeviceDescriptor, FreeDeviceState};
    use crate::app::ports::{
        ConfigFactory, Configuration, DeviceHandle, DeviceManager, DeviceRequirements,
        InvocationRunner, Rescheduler, ScheduledInvocationListener,
    };

    struct EmptyDeviceManager;

    impl DeviceManager for EmptyDeviceManager {
        fn init(&self) {}
        fn allocate_device(
            &self,
            _timeout: Duration,
            _requirements: &DeviceRequirements,
        ) -> Option<DeviceHandle> {
            None
        }
        fn force_allocate_device(&self, _serial: &str) -> Option<DeviceHandle> {
            None
        }
        fn free_device(&self, _device: DeviceHandle, _state: FreeDeviceState) {}
        fn list_all_devices(&self) -> Vec<DeviceDescriptor> {
            Vec::new()
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

    struct PlainConfigFactory;

    impl ConfigFactory for PlainConfigFactory {
        fn create_configuration_from_args(
            &self,
            args: &[String],
        ) -> Result<Configuration, SchedError> {
            Ok(Configuration {
                name: args.first().cloned().unwrap_or_default(),
                ..Configuration::default()
            })
        }
    }

    struct NoopRunner;

    impl InvocationRunner for NoopRunner {
        fn invoke(
            &self,
            _device: &DeviceHandle,
            _config: &Configuration,
            _rescheduler: &dyn Rescheduler,
            _listener: &dyn ScheduledInvocationListener,
        ) -> Result<(), InvocationError> {
            Ok(())
        }
    }

    struct RecordingParser {
        parsed: Mutex<Vec<PathBuf>>,
    }

    impl CommandFileParser for RecordingParser {
        fn parse_file(
            &self,
            path: &Path,
            _scheduler: &CommandScheduler,
            _extra_args: &[String],
        ) -> Result<(), SchedError> {
            self.parsed
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(path.to_path_buf());
            Ok(())
        }
    }

    fn test_scheduler() -> CommandScheduler {
        let mut config = GlobalConfig::default();
        config.scheduler.command_poll_time_ms = 50;
        CommandScheduler::new(
            Arc::new(EmptyDeviceManager),
            Arc::new(PlainConfigFactory),
            Arc::new(NoopRunner),
            Arc::new(DeviceTracker::new()),
            &config,
        )
    }

    fn test_watcher(scheduler: CommandScheduler, parser: Arc<RecordingParser>) -> CommandFileWatcher {
        let settings = WatcherSettings {
            poll_interval_ms: 1000,
        };
        CommandFileWatcher::new(scheduler, parser, &settings)
    }

    fn write_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).expect("create command file");
        writeln!(file, "run stub-config").expect("write");
        path
    }

    fn bump_mtime(path: &Path) {
        let file = fs::OpenOptions::new()
            .append(true)
            .open(path)
            .expect("open command file");
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .expect("set mtime");
    }

    #[test]
    fn no_change_reports_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(&dir, "primary.txt");
        let parser = Arc::new(RecordingParser {
            parsed: Mutex::new(Vec::new()),
        });
        let watcher = test_watcher(test_scheduler(), Arc::clone(&parser));
        watcher.add_command_file(path, Vec::new(), Vec::new());
        assert!(!check_for_updates(&watcher.inner));
    }

    #[test]
    fn primary_file_change_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(&dir, "primary.txt");
        let parser = Arc::new(RecordingParser {
            parsed: Mutex::new(Vec::new()),
        });
        let watcher = test_watcher(test_scheduler(), Arc::clone(&parser));
        watcher.add_command_file(path.clone(), Vec::new(), Vec::new());
        bump_mtime(&path);
        assert!(check_for_updates(&watcher.inner));
    }

    #[test]
    fn dependency_change_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let primary = write_file(&dir, "primary.txt");
        let dep = write_file(&dir, "dep.txt");
        let parser = Arc::new(RecordingParser {
            parsed: Mutex::new(Vec::new()),
        });
        let watcher = test_watcher(test_scheduler(), Arc::clone(&parser));
        watcher.add_command_file(primary, Vec::new(), vec![dep.clone()]);
        bump_mtime(&dep);
        assert!(check_for_updates(&watcher.inner));
    }

    #[test]
    fn missing_file_is_not_a_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parser = Arc::new(RecordingParser {
            parsed: Mutex::new(Vec::new()),
        });
        let watcher = test_watcher(test_scheduler(), Arc::clone(&parser));
        watcher.add_command_file(dir.path().join("not-there.txt"), Vec::new(), Vec::new());
        assert!(!check_for_updates(&watcher.inner));
    }

    #[test]
    fn shared_dependency_is_checked_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = write_file(&dir, "first.txt");
        let second = write_file(&dir, "second.txt");
        let shared = write_file(&dir, "shared.txt");
        let parser = Arc::new(RecordingParser {
            parsed: Mutex::new(Vec::new()),
        });
        let watcher = test_watcher(test_scheduler(), Arc::clone(&parser));
        watcher.add_command_file(first, Vec::new(), vec![shared.clone()]);
        watcher.add_command_file(second, Vec::new(), vec![shared.clone()]);

        let files = watcher.inner.files.lock().expect("files");
        let mut checked = HashSet::new();
        for file in files.iter() {
            command_file_updated(file, &mut checked);
        }
        // first, second, shared: the shared dependency appears once.
        assert_eq!(checked.len(), 3);
    }

    #[test]
    fn reload_clears_commands_and_reparses_primary_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let primary = write_file(&dir, "primary.txt");
        let dep = write_file(&dir, "dep.txt");
        let parser = Arc::new(RecordingParser {
            parsed: Mutex::new(Vec::new()),
        });
        let scheduler = test_scheduler();
        scheduler.start().expect("start scheduler");
        scheduler.await_running();
        scheduler
            .add_command(&["stub-config".to_string()])
            .expect("add command");
        assert_eq!(scheduler.active_command_count(), 1);

        let watcher = test_watcher(scheduler.clone(), Arc::clone(&parser));
        watcher.add_command_file(primary.clone(), Vec::new(), vec![dep]);
        reload_command_files(&watcher.inner);

        // Queued work was dropped, the primary file re-parsed, and the
        // dependency left alone.
        assert_eq!(scheduler.active_command_count(), 0);
        let parsed = parser.parsed.lock().expect("parsed").clone();
        assert_eq!(parsed, vec![primary]);

        scheduler.shutdown();
        scheduler.join();
    }
}
