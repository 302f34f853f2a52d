mod call_detector;
mod cidr;
mod config;
mod error;
mod ip_header;
mod logging;
mod monitor;
mod network_watcher;
mod notifier;
mod packet_filter;
mod packet_sniffer;
mod raw_socket;
#[cfg(windows)]
mod service;
mod traffic_monitor;

use crate::config::Config;
use crate::logging::setup_logging;
use crate::notifier::WebhookNotifier;
use crate::raw_socket::RawSocketFactory;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

pub(crate) fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .thread_name("call-monitor")
        .enable_all()
        .build()
}

/// Print a merged version of a CIDR list file.
fn consolidate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let ranges = cidr::read_range_file(path)?;
    println!("IPs: {}", ranges.len());
    let merged = cidr::merge_ranges(ranges);
    println!("Consolidated IPs: {}", merged.len());
    println!("Merged IP list:");
    for net in merged {
        println!("{}", net);
    }
    Ok(())
}

fn run_console(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let (config, origin) = Config::locate(config_path.as_deref())?;
    setup_logging(&config.logging, true)?;
    origin.log();

    println!("RTC call monitor running in CONSOLE mode");
    println!("Press Ctrl+C to stop");

    let runtime = build_runtime()?;
    let result = runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        let observer = Arc::new(WebhookNotifier::new(&config.webhooks));
        monitor::run(Arc::new(config), Arc::new(RawSocketFactory), observer, shutdown_rx).await
    });

    if let Err(e) = result {
        if e.is_fatal() {
            error!("Startup failed: {}", e);
        }
        return Err(e.into());
    }

    info!("Call monitor stopped");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if let Some(file) = arg_value(&args, "--consolidate") {
        return consolidate(Path::new(&file));
    }

    let config_path = arg_value(&args, "--config").map(PathBuf::from);

    #[cfg(windows)]
    {
        if !args.iter().any(|arg| arg == "--console") {
            return service::start();
        }
    }

    run_console(config_path)
}
