use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::app::device::util_stats::StubDeviceUtil;
use crate::app::error::SchedError;

fn default_command_poll_time_ms() -> u64 {
    1000
}

fn default_no_device_delay_ms() -> u64 {
    20
}

fn default_remote_mgr_port() -> u16 {
    30103
}

fn default_socket_timeout_ms() -> u64 {
    5000
}

fn default_accept_timeout_ms() -> u64 {
    5000
}

fn default_watcher_poll_ms() -> u64 {
    20_000
}

fn default_stub_policy() -> StubDeviceUtil {
    StubDeviceUtil::IncludeIfUsed
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    /// How long one queue poll blocks; bounds shutdown latency.
    #[serde(default = "default_command_poll_time_ms")]
    pub command_poll_time_ms: u64,
    /// Re-queue delay for a command that could not get a device.
    #[serde(default = "default_no_device_delay_ms")]
    pub no_device_delay_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            command_poll_time_ms: default_command_poll_time_ms(),
            no_device_delay_ms: default_no_device_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteSettings {
    #[serde(default)]
    pub start_remote_mgr_on_boot: bool,
    /// Whether to hand work over when another scheduler process already
    /// occupies the remote manager port.
    #[serde(default)]
    pub auto_handover: bool,
    #[serde(default = "default_remote_mgr_port")]
    pub remote_mgr_port: u16,
    /// Read timeout for an accepted client session.
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// How long one accept wait lasts; bounds cancel latency.
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            start_remote_mgr_on_boot: false,
            auto_handover: false,
            remote_mgr_port: default_remote_mgr_port(),
            socket_timeout_ms: default_socket_timeout_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherSettings {
    #[serde(default = "default_watcher_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_watcher_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UtilStatsSettings {
    #[serde(default = "default_stub_policy")]
    pub collect_null_device: StubDeviceUtil,
    #[serde(default = "default_stub_policy")]
    pub collect_emulator: StubDeviceUtil,
}

impl Default for UtilStatsSettings {
    fn default() -> Self {
        Self {
            collect_null_device: default_stub_policy(),
            collect_emulator: default_stub_policy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub util_stats: UtilStatsSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLEETSCHED_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetsched.json")
}

pub fn backup_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetsched.backup.json")
}

pub fn load_config() -> Result<GlobalConfig, SchedError> {
    load_config_from_path(&config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<GlobalConfig, SchedError> {
    if !path.exists() {
        return Ok(GlobalConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| SchedError::config_parse(format!("Failed to read config: {err}")))?;
    let config: GlobalConfig = serde_json::from_str(&raw)
        .map_err(|err| SchedError::config_parse(format!("Config file is invalid: {err}")))?;
    Ok(validate_config(config))
}

pub fn save_config(config: &GlobalConfig) -> Result<(), SchedError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn save_config_to_path(
    config: &GlobalConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), SchedError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| SchedError::config_parse(format!("Failed to create config dir: {err}")))?;
    }
    if path.exists() {
        if let Err(err) = fs::copy(path, backup_path) {
            warn!(error = %err, "Failed to backup config file");
        }
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| SchedError::config_parse(format!("Failed to serialize config: {err}")))?;
    fs::write(path, payload)
        .map_err(|err| SchedError::config_parse(format!("Failed to write config: {err}")))?;
    Ok(())
}

fn validate_config(mut config: GlobalConfig) -> GlobalConfig {
    if config.scheduler.command_poll_time_ms < 50 {
        config.scheduler.command_poll_time_ms = default_command_poll_time_ms();
    }
    if config.remote.socket_timeout_ms < 100 {
        config.remote.socket_timeout_ms = default_socket_timeout_ms();
    }
    if config.remote.accept_timeout_ms < 100 {
        config.remote.accept_timeout_ms = default_accept_timeout_ms();
    }
    if config.watcher.poll_interval_ms < 1000 {
        config.watcher.poll_interval_ms = default_watcher_poll_ms();
    }
    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = default_log_level();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from_path(&dir.path().join("nope.json")).expect("load");
        assert_eq!(config, GlobalConfig::default());
        assert_eq!(config.remote.remote_mgr_port, 30103);
        assert_eq!(config.scheduler.command_poll_time_ms, 1000);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleetsched.json");
        let backup = dir.path().join("fleetsched.backup.json");

        let mut config = GlobalConfig::default();
        config.remote.remote_mgr_port = 40100;
        config.remote.auto_handover = true;
        save_config_to_path(&config, &path, &backup).expect("save");

        let loaded = load_config_from_path(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleetsched.json");
        fs::write(&path, r#"{"remote":{"remote_mgr_port":31000}}"#).expect("write");

        let loaded = load_config_from_path(&path).expect("load");
        assert_eq!(loaded.remote.remote_mgr_port, 31000);
        assert_eq!(loaded.remote.socket_timeout_ms, 5000);
        assert_eq!(loaded.remote.accept_timeout_ms, 5000);
        assert_eq!(loaded.watcher.poll_interval_ms, 20_000);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleetsched.json");
        fs::write(
            &path,
            r#"{"scheduler":{"command_poll_time_ms":1},"watcher":{"poll_interval_ms":5}}"#,
        )
        .expect("write");

        let loaded = load_config_from_path(&path).expect("load");
        assert_eq!(loaded.scheduler.command_poll_time_ms, 1000);
        assert_eq!(loaded.watcher.poll_interval_ms, 20_000);
    }

    #[test]
    fn bad_json_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fleetsched.json");
        fs::write(&path, "{not json").expect("write");
        let err = load_config_from_path(&path).expect_err("expected parse error");
        assert_eq!(err.code, "ERR_CONFIG_PARSE");
    }
}
