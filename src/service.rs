//! Windows service host.

use crate::config::Config;
use crate::logging::setup_logging;
use crate::monitor;
use crate::notifier::WebhookNotifier;
use crate::raw_socket::RawSocketFactory;
use log::{error, info};
use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use windows_service::{
    define_windows_service,
    service::{
        ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
        ServiceType,
    },
    service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle},
    service_dispatcher,
};

pub const SERVICE_NAME: &str = "RtcCallMonitor";

define_windows_service!(ffi_service_main, service_main);

pub fn start() -> Result<(), Box<dyn std::error::Error>> {
    service_dispatcher::start(SERVICE_NAME, ffi_service_main)?;
    Ok(())
}

fn service_main(arguments: Vec<OsString>) {
    if let Err(e) = run_service(arguments) {
        error!("Service failed: {}", e);
    }
}

fn report(
    handle: &ServiceStatusHandle,
    state: ServiceState,
    exit_code: u32,
) -> Result<(), windows_service::Error> {
    let controls_accepted = if state == ServiceState::Running {
        ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
    } else {
        ServiceControlAccept::empty()
    };

    handle.set_service_status(ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state: state,
        controls_accepted,
        exit_code: ServiceExitCode::Win32(exit_code),
        checkpoint: 0,
        wait_hint: Duration::default(),
        process_id: None,
    })
}

fn run_service(_arguments: Vec<OsString>) -> Result<(), Box<dyn std::error::Error>> {
    let (config, origin) = Config::locate(None)?;
    if let Err(e) = setup_logging(&config.logging, false) {
        eprintln!("Failed to setup logging: {}", e);
    }
    origin.log();
    info!("RTC call monitor service starting...");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let status_handle = service_control_handler::register(SERVICE_NAME, move |control_event| {
        match control_event {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                info!("Received stop/shutdown signal");
                let _ = shutdown_tx.send(true);
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => ServiceControlHandlerResult::NotImplemented,
        }
    })?;

    report(&status_handle, ServiceState::Running, 0)?;

    let runtime = crate::build_runtime()?;
    let observer = Arc::new(WebhookNotifier::new(&config.webhooks));
    let result = runtime.block_on(monitor::run(
        Arc::new(config),
        Arc::new(RawSocketFactory),
        observer,
        shutdown_rx,
    ));

    let exit_code = match &result {
        Ok(()) => 0,
        Err(e) => {
            error!("Call monitor failed to start: {}", e);
            1
        }
    };
    report(&status_handle, ServiceState::Stopped, exit_code)?;

    info!("RTC call monitor service stopped");
    Ok(())
}
