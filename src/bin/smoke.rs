use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use fleetsched::app::command::CommandScheduler;
use fleetsched::app::config::{GlobalConfig, RemoteSettings};
use fleetsched::app::device::tracker::DeviceTracker;
use fleetsched::app::logging::init_logging;
use fleetsched::app::models::{CommandResultStatus, DeviceAllocationState, FreeDeviceState};
use fleetsched::app::ports::DeviceManager;
use fleetsched::app::remote::client::RemoteClient;
use fleetsched::app::remote::manager::RemoteManager;
use fleetsched::app::sim::{SimConfigFactory, SimDeviceManager, SimRunner};

#[derive(Debug, Clone)]
struct Args {
    json: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut json = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            "-h" | "--help" => {
                return Err("Usage: cargo run --bin smoke -- [--json]\n".to_string());
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(Args { json })
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> bool
where
    F: FnOnce() -> Result<(), String>,
{
    let start = Instant::now();
    match f() {
        Ok(()) => {
            checks.push(SmokeCheck {
                name,
                status: "pass",
                duration_ms: start.elapsed().as_millis(),
                error: None,
            });
            true
        }
        Err(err) => {
            checks.push(SmokeCheck {
                name,
                status: "fail",
                duration_ms: start.elapsed().as_millis(),
                error: Some(err),
            });
            false
        }
    }
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn sim_config() -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.scheduler.command_poll_time_ms = 50;
    config.scheduler.no_device_delay_ms = 10;
    config
}

fn sim_scheduler(
    device_manager: &Arc<SimDeviceManager>,
    runner: &Arc<SimRunner>,
    tracker: &Arc<DeviceTracker>,
) -> Result<CommandScheduler, String> {
    let scheduler = CommandScheduler::new(
        device_manager.clone(),
        Arc::new(SimConfigFactory),
        runner.clone(),
        Arc::clone(tracker),
        &sim_config(),
    );
    scheduler.start().map_err(|err| err.to_string())?;
    scheduler.await_running();
    Ok(scheduler)
}

fn sim_manager(
    device_manager: &Arc<SimDeviceManager>,
    tracker: &Arc<DeviceTracker>,
    scheduler: &CommandScheduler,
) -> Result<(RemoteManager, u16), String> {
    let settings = RemoteSettings {
        start_remote_mgr_on_boot: false,
        auto_handover: false,
        remote_mgr_port: 0,
        socket_timeout_ms: 200,
        accept_timeout_ms: 100,
    };
    let manager = RemoteManager::new(
        device_manager.clone(),
        Arc::clone(tracker),
        scheduler.clone(),
        settings,
    );
    if !manager.connect_any_port() {
        return Err("failed to bind an ephemeral port".to_string());
    }
    manager.start();
    let port = manager.port().ok_or("manager has no port")?;
    Ok((manager, port))
}

fn svec(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn check_dispatch() -> Result<(), String> {
    let device_manager = SimDeviceManager::with_fleet(2);
    let runner = SimRunner::new(Duration::from_millis(200));
    let tracker = Arc::new(DeviceTracker::new());
    let scheduler = sim_scheduler(&device_manager, &runner, &tracker)?;

    scheduler
        .add_command(&svec(&["alpha"]))
        .map_err(|err| err.to_string())?;
    scheduler
        .add_command(&svec(&["beta"]))
        .map_err(|err| err.to_string())?;

    if !wait_until(Duration::from_secs(5), || runner.completed() == 2) {
        return Err(format!("expected 2 completions, saw {}", runner.completed()));
    }
    let runs = runner.runs();
    if runs[0].1 == runs[1].1 {
        return Err(format!("both commands ran on {}", runs[0].1));
    }
    if !wait_until(Duration::from_secs(5), || {
        device_manager.available_count() == 2
    }) {
        return Err("devices did not return to the available pool".to_string());
    }
    scheduler.shutdown();
    scheduler.join();
    Ok(())
}

fn check_fair_scheduling() -> Result<(), String> {
    let device_manager = SimDeviceManager::with_fleet(1);
    let runner = SimRunner::new(Duration::from_millis(50));
    let tracker = Arc::new(DeviceTracker::new());
    let scheduler = sim_scheduler(&device_manager, &runner, &tracker)?;

    // Hold the only device while both commands enter the queue.
    let pinned = device_manager
        .force_allocate_device("sim-000")
        .ok_or("failed to pin device")?;
    scheduler
        .add_command_with_time(&svec(&["heavy"]), 60_000)
        .map_err(|err| err.to_string())?;
    scheduler
        .add_command_with_time(&svec(&["light"]), 0)
        .map_err(|err| err.to_string())?;
    device_manager.free_device(pinned, FreeDeviceState::Available);

    if !wait_until(Duration::from_secs(5), || runner.completed() == 2) {
        return Err(format!("expected 2 completions, saw {}", runner.completed()));
    }
    let order = runner
        .runs()
        .into_iter()
        .map(|(config, _)| config)
        .collect::<Vec<_>>();
    if order != vec!["light".to_string(), "heavy".to_string()] {
        return Err(format!("unexpected run order: {order:?}"));
    }
    scheduler.shutdown();
    scheduler.join();
    Ok(())
}

fn check_remote_round_trip() -> Result<(), String> {
    let device_manager = SimDeviceManager::with_fleet(2);
    let runner = SimRunner::new(Duration::from_millis(20));
    let tracker = Arc::new(DeviceTracker::new());
    let scheduler = sim_scheduler(&device_manager, &runner, &tracker)?;
    let (manager, port) = sim_manager(&device_manager, &tracker, &scheduler)?;
    let client = RemoteClient::connect(port).map_err(|err| err.to_string())?;

    if !client
        .send_allocate_device("sim-000")
        .map_err(|err| err.to_string())?
    {
        return Err("allocate sim-000 refused".to_string());
    }
    let listed = client.send_list_devices().map_err(|err| err.to_string())?;
    if listed.len() != 2 {
        return Err(format!("expected 2 devices, saw {}", listed.len()));
    }
    if listed[0].state != DeviceAllocationState::Allocated {
        return Err("sim-000 should be allocated".to_string());
    }

    if !client
        .send_exec_command("sim-000", &svec(&["remote-cfg"]))
        .map_err(|err| err.to_string())?
    {
        return Err("exec command refused".to_string());
    }
    if !wait_until(Duration::from_secs(5), || {
        client
            .send_get_last_command_result("sim-000")
            .map(|result| result.status == CommandResultStatus::InvocationSuccess)
            .unwrap_or(false)
    }) {
        return Err("exec command did not report success".to_string());
    }

    if !client
        .send_free_device("sim-000")
        .map_err(|err| err.to_string())?
    {
        return Err("free sim-000 refused".to_string());
    }
    if device_manager.state_of("sim-000") != Some(DeviceAllocationState::Available) {
        return Err("sim-000 did not return to available".to_string());
    }

    client.send_close().map_err(|err| err.to_string())?;
    manager.join();
    scheduler.shutdown();
    scheduler.join();
    Ok(())
}

fn check_handover() -> Result<(), String> {
    // Outgoing side: one device pinned by a remote peer, two commands that
    // cannot run locally.
    let dm_out = SimDeviceManager::with_serials(&svec(&["h-1"]));
    let runner_out = SimRunner::new(Duration::from_millis(20));
    let tracker_out = Arc::new(DeviceTracker::new());
    let scheduler_out = sim_scheduler(&dm_out, &runner_out, &tracker_out)?;
    dm_out
        .force_allocate_device("h-1")
        .ok_or("failed to pin h-1")?;
    scheduler_out
        .add_command_with_time(&svec(&["C1"]), 10)
        .map_err(|err| err.to_string())?;
    scheduler_out
        .add_command_with_time(&svec(&["C2"]), 20)
        .map_err(|err| err.to_string())?;

    // Incoming side with the same fleet.
    let dm_in = SimDeviceManager::with_serials(&svec(&["h-1"]));
    let runner_in = SimRunner::new(Duration::from_millis(20));
    let tracker_in = Arc::new(DeviceTracker::new());
    let scheduler_in = sim_scheduler(&dm_in, &runner_in, &tracker_in)?;
    let (manager_in, port) = sim_manager(&dm_in, &tracker_in, &scheduler_in)?;

    if !scheduler_out.handover_shutdown(port) {
        return Err("handover refused".to_string());
    }
    scheduler_out.join();
    // The outgoing side's exit closes the incoming manager, freeing h-1; the
    // handed-over commands then run in preserved priority order.
    manager_in.join();
    if !wait_until(Duration::from_secs(5), || runner_in.completed() == 2) {
        return Err(format!(
            "expected 2 handed-over completions, saw {}",
            runner_in.completed()
        ));
    }
    let order = runner_in
        .runs()
        .into_iter()
        .map(|(config, _)| config)
        .collect::<Vec<_>>();
    if order != vec!["C1".to_string(), "C2".to_string()] {
        return Err(format!("unexpected handover run order: {order:?}"));
    }
    scheduler_in.shutdown();
    scheduler_in.join();
    Ok(())
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
    let mut checks = Vec::new();
    let mut status = "pass";

    for (name, check) in [
        ("dispatch", check_dispatch as fn() -> Result<(), String>),
        ("fair_scheduling", check_fair_scheduling),
        ("remote_round_trip", check_remote_round_trip),
        ("handover", check_handover),
    ] {
        if !run_check(&mut checks, name, check) {
            status = "fail";
        }
    }

    let summary = SmokeSummary {
        tool: "fleetsched_smoke",
        status,
        trace_id,
        checks,
    };

    let output = if args.json {
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut lines = vec![format!("status: {}", summary.status)];
        for check in &summary.checks {
            lines.push(format!(
                "  {}: {} ({} ms)",
                check.name, check.status, check.duration_ms
            ));
        }
        lines.join("\n")
    };
    println!("{output}");
    if summary.status != "pass" {
        std::process::exit(1);
    }
}
