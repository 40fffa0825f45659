use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use fleetsched::app::command::CommandScheduler;
use fleetsched::app::config::GlobalConfig;
use fleetsched::app::device::tracker::DeviceTracker;
use fleetsched::app::device::util_stats::{DeviceUtilStatsMonitor, StubDeviceUtil};
use fleetsched::app::logging::init_logging;
use fleetsched::app::sim::{SimConfigFactory, SimDeviceManager, SimRunner};

#[derive(Debug, Clone)]
struct Args {
    devices: usize,
    commands: usize,
    duration_secs: u64,
    json: bool,
}

#[derive(Serialize)]
struct SoakSummary {
    tool: &'static str,
    trace_id: String,
    devices: usize,
    commands: usize,
    duration_secs: u64,
    completed_invocations: usize,
    total_util_percent: u32,
    device_util_percent: Vec<(String, u32)>,
}

fn parse_args() -> Result<Args, String> {
    let mut devices = 4usize;
    let mut commands = 3usize;
    let mut duration_secs = 10u64;
    let mut json = false;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--devices" => {
                devices = iter
                    .next()
                    .ok_or("--devices requires a value")?
                    .parse()
                    .map_err(|_| "--devices must be a number")?;
            }
            "--commands" => {
                commands = iter
                    .next()
                    .ok_or("--commands requires a value")?
                    .parse()
                    .map_err(|_| "--commands must be a number")?;
            }
            "--duration-secs" => {
                duration_secs = iter
                    .next()
                    .ok_or("--duration-secs requires a value")?
                    .parse()
                    .map_err(|_| "--duration-secs must be a number")?;
            }
            "--json" => json = true,
            "-h" | "--help" => {
                return Err(
                    "Usage: cargo run --bin soak -- [--devices N] [--commands M] [--duration-secs S] [--json]\n"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    if devices == 0 || commands == 0 {
        return Err("--devices and --commands must be at least 1".to_string());
    }
    Ok(Args {
        devices,
        commands,
        duration_secs,
        json,
    })
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    init_logging();
    let trace_id = Uuid::new_v4().to_string();

    let device_manager = SimDeviceManager::with_fleet(args.devices);
    let monitor = Arc::new(DeviceUtilStatsMonitor::new(
        device_manager.clone(),
        StubDeviceUtil::IncludeIfUsed,
        StubDeviceUtil::IncludeIfUsed,
    ));
    device_manager.attach_monitor(Arc::clone(&monitor));

    let runner = SimRunner::new(Duration::from_millis(150));
    let mut config = GlobalConfig::default();
    config.scheduler.command_poll_time_ms = 100;
    let scheduler = CommandScheduler::new(
        device_manager.clone(),
        Arc::new(SimConfigFactory),
        runner.clone(),
        Arc::new(DeviceTracker::new()),
        &config,
    );
    if let Err(err) = scheduler.start() {
        eprintln!("failed to start scheduler: {err}");
        std::process::exit(1);
    }
    scheduler.await_running();

    for index in 0..args.commands {
        let name = format!("soak-{index}");
        let command = vec![
            name,
            "--loop".to_string(),
            "--min-loop-time".to_string(),
            "100".to_string(),
        ];
        if let Err(err) = scheduler.add_command(&command) {
            eprintln!("failed to add command: {err}");
            std::process::exit(1);
        }
    }

    thread::sleep(Duration::from_secs(args.duration_secs));
    scheduler.shutdown();
    scheduler.join();

    let stats = monitor.get_utilization_stats();
    let mut device_util = stats.device_util.into_iter().collect::<Vec<_>>();
    device_util.sort();

    let summary = SoakSummary {
        tool: "fleetsched_soak",
        trace_id,
        devices: args.devices,
        commands: args.commands,
        duration_secs: args.duration_secs,
        completed_invocations: runner.completed(),
        total_util_percent: stats.total_util,
        device_util_percent: device_util,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        println!(
            "completed {} invocations across {} devices in {}s (total utilization {}%)",
            summary.completed_invocations,
            summary.devices,
            summary.duration_secs,
            summary.total_util_percent
        );
        for (serial, util) in &summary.device_util_percent {
            println!("  {serial}: {util}%");
        }
    }
}
