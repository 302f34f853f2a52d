//! Wires capture, aggregation, detection and network watching together.

use crate::call_detector::CallDetector;
use crate::config::Config;
use crate::error::Result;
use crate::network_watcher::{initial_local_address, poll_interfaces, NetworkWatcher};
use crate::notifier::CallObserver;
use crate::packet_sniffer::{run_supervisor, PacketCapture};
use crate::raw_socket::SourceFactory;
use crate::traffic_monitor::TrafficAggregator;
use log::{info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type Task = (&'static str, JoinHandle<()>);

const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Run until `shutdown` flips to true. Only startup failures are returned.
pub async fn run(
    config: Arc<Config>,
    factory: Arc<dyn SourceFactory>,
    observer: Arc<dyn CallObserver>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_ranges = config.local_ranges()?;
    let providers = config.provider_table()?;
    if providers.is_empty() {
        warn!("No providers configured, all traffic will be reported as unknown");
    }

    let probe = config.monitoring.probe_address.clone();
    let local = initial_local_address(config.local_address, &probe, &local_ranges).await?;

    let (packet_tx, packet_rx) = mpsc::channel(config.monitoring.channel_capacity);
    let mut capture = PacketCapture::new(factory, local_ranges, packet_tx);
    capture.start(local).await?;

    let detector = CallDetector::new(providers, config.monitoring.min_packet_rate);
    let aggregator = TrafficAggregator::new(detector, observer);
    let (watcher, address_rx) = NetworkWatcher::new(local, probe.clone(), config.network_change_delay());
    let (signal_tx, signal_rx) = mpsc::channel::<()>(8);

    let mut tasks = vec![(
        "aggregator",
        tokio::spawn(aggregator.run(packet_rx, config.sample_interval(), shutdown.clone())),
    )];
    tasks.extend(spawn_address_tracking(capture, watcher, address_rx, signal_rx, &shutdown));

    if config.monitoring.network_poll_secs > 0 {
        tasks.push((
            "interface poller",
            tokio::spawn(poll_interfaces(
                probe,
                config.network_poll_interval(),
                signal_tx.clone(),
                shutdown.clone(),
            )),
        ));
    }

    #[cfg(unix)]
    tasks.push((
        "SIGHUP handler",
        tokio::spawn(crate::network_watcher::forward_hangup(signal_tx.clone(), shutdown.clone())),
    ));
    drop(signal_tx);

    info!("Call monitor running");
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!("Stopping call monitor...");
    for (name, handle) in tasks {
        match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
            Ok(Ok(())) => info!("{} stopped", name),
            Ok(Err(e)) => warn!("{} task error: {}", name, e),
            Err(_) => warn!("{} did not stop within {:?}", name, TASK_STOP_TIMEOUT),
        }
    }
    Ok(())
}

/// Capture supervisor and network watcher, linked by the published local
/// address. Both run until shutdown even if every change source goes away.
fn spawn_address_tracking(
    capture: PacketCapture,
    watcher: NetworkWatcher,
    address_rx: watch::Receiver<Ipv4Addr>,
    signal_rx: mpsc::Receiver<()>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<Task> {
    vec![
        ("capture", tokio::spawn(run_supervisor(capture, address_rx, shutdown.clone()))),
        ("network watcher", tokio::spawn(watcher.run(signal_rx, shutdown.clone()))),
    ]
}
