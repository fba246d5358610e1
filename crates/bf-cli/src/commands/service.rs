//! Process Supervisor commands

use bf_core::error::{exit, BfError};
use bf_core::pidfile::Termination;
use bf_core::types::ServiceInstance;

use crate::output::{format_instances, print_info, print_success, print_warning};
use crate::supervisor::{open_browser, service_url, Scope, ServiceStatus, Started, Supervisor};

/// Exit code of `status` when the port is held by a foreign process
pub const STATUS_OCCUPIED: i32 = exit::PORT_IN_USE;

/// Start an instance and report where it listens
///
/// A browser is opened only for a loopback binding.
pub async fn start_command(
    supervisor: &Supervisor,
    port: u16,
    no_browser: bool,
) -> Result<i32, BfError> {
    let config = supervisor.config();
    let started = supervisor.start(&config.host, port).await?;
    report_started(&started);

    if config.open_browser && !no_browser && config.is_loopback() {
        open_browser(&started.url);
    }
    Ok(exit::SUCCESS)
}

fn report_started(started: &Started) {
    print_success(&format!(
        "Service started (PID {}) at {}",
        started.pid, started.url
    ));
    if !started.listening {
        print_warning("The service has not bound its port yet; check the log if it does not come up");
    }
    print_info(&format!("Log: {}", started.log_path.display()));
}

/// Stop the instance on `port`; succeeds when nothing runs
pub async fn stop_command(supervisor: &Supervisor, port: u16) -> Result<i32, BfError> {
    match supervisor.stop(port).await? {
        Termination::NotRunning => print_info(&format!("No service running on port {}", port)),
        Termination::Exited => print_success(&format!("Service on port {} stopped", port)),
        Termination::Killed => {
            print_success(&format!("Service on port {} killed after the grace period", port))
        }
        Termination::Survived => print_warning(&format!(
            "Service on port {} did not exit; its PID file was removed anyway",
            port
        )),
    }
    Ok(exit::SUCCESS)
}

/// Report the status of `port`
///
/// Exit code 0 when running, 1 when not running, 3 when the port is held
/// by a process this supervisor did not start.
pub fn status_command(supervisor: &Supervisor, port: u16, json: bool) -> Result<i32, BfError> {
    let host = supervisor.config().host.as_str();
    let status = supervisor.status(host, port)?;
    let (state, pid, code) = match status {
        ServiceStatus::Running(pid) => ("running", Some(pid), exit::SUCCESS),
        ServiceStatus::StalePidfile => ("not-running", None, exit::FAILURE),
        ServiceStatus::NotRunning => ("not-running", None, exit::FAILURE),
        ServiceStatus::PortOccupiedByOther => ("port-occupied-by-other", None, STATUS_OCCUPIED),
    };

    if json {
        let body = serde_json::json!({ "port": port, "status": state, "pid": pid });
        println!("{}", body);
        return Ok(code);
    }

    match status {
        ServiceStatus::Running(pid) => print_success(&format!(
            "Service running on port {} (PID {}) at {}",
            port,
            pid,
            service_url(host, port)
        )),
        ServiceStatus::StalePidfile => {
            print_info(&format!("Service not running on port {} (removed stale PID file)", port))
        }
        ServiceStatus::NotRunning => print_info(&format!("Service not running on port {}", port)),
        ServiceStatus::PortOccupiedByOther => print_warning(&format!(
            "Port {} is in use by a process not started by service-ctl",
            port
        )),
    }
    Ok(code)
}

pub async fn restart_command(supervisor: &Supervisor, port: u16) -> Result<i32, BfError> {
    let started = supervisor.restart(&supervisor.config().host, port).await?;
    report_started(&started);
    Ok(exit::SUCCESS)
}

/// List the current user's instances
pub async fn list_command(supervisor: &Supervisor, json: bool) -> Result<i32, BfError> {
    let instances = supervisor.list().await?;
    if json {
        print_json(&instances)?;
        return Ok(exit::SUCCESS);
    }

    println!("Service instances of {}:", whoami::username());
    println!("{}", format_instances(&instances));
    Ok(exit::SUCCESS)
}

/// Terminate instances, including ones whose PID file was lost
pub async fn cleanup_command(
    supervisor: &Supervisor,
    scope: Scope,
    json: bool,
) -> Result<i32, BfError> {
    let stopped = supervisor.cleanup(scope).await?;
    if json {
        print_json(&stopped)?;
        return Ok(exit::SUCCESS);
    }

    if stopped.is_empty() {
        print_info("Nothing to clean up");
    } else {
        for instance in &stopped {
            print_success(&format!(
                "Stopped instance on port {} (PID {})",
                instance.port, instance.pid
            ));
        }
    }
    Ok(exit::SUCCESS)
}

fn print_json(instances: &[ServiceInstance]) -> Result<(), BfError> {
    let text = serde_json::to_string(instances)
        .map_err(|e| BfError::Io(std::io::Error::other(e)))?;
    println!("{}", text);
    Ok(())
}
