//! Tracks the host's outward-facing IPv4 address and publishes changes.
//!
//! The current address lives in a `watch` channel: capture reads it, only the
//! watcher writes it. Change signals come from interface polling and, on
//! Unix, `SIGHUP`.

use crate::error::{MonitorError, Result};
use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Find the local address the OS would route `probe` from. Nothing is sent;
/// connecting a datagram socket only resolves the route.
pub async fn try_resolve_local_address(probe: &str) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(MonitorError::AddressResolution)?;
    socket.connect(probe).await.map_err(MonitorError::AddressResolution)?;

    match socket.local_addr().map_err(MonitorError::AddressResolution)? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
        other => Err(MonitorError::AddressResolution(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no IPv4 route, got {}", other),
        ))),
    }
}

/// Like [`try_resolve_local_address`], falling back to loopback.
pub async fn resolve_local_address(probe: &str) -> Ipv4Addr {
    match try_resolve_local_address(probe).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!("{}, defaulting to loopback", e);
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Address to capture on at startup: the configured one, else the routed one.
pub async fn initial_local_address(
    configured: Option<Ipv4Addr>,
    probe: &str,
    local_ranges: &[Ipv4Network],
) -> Result<Ipv4Addr> {
    let addr = match configured {
        Some(addr) => addr,
        None => resolve_local_address(probe).await,
    };

    if addr.is_loopback() || addr.is_unspecified() {
        return Err(MonitorError::NoLocalAddress);
    }
    if !local_ranges.is_empty() && !local_ranges.iter().any(|r| r.contains(addr)) {
        warn!("Local address {} is outside every configured local network", addr);
    }
    Ok(addr)
}

pub struct NetworkWatcher {
    probe: String,
    settle_delay: Duration,
    current: watch::Sender<Ipv4Addr>,
}

impl NetworkWatcher {
    pub fn new(initial: Ipv4Addr, probe: String, settle_delay: Duration) -> (Self, watch::Receiver<Ipv4Addr>) {
        let (current, rx) = watch::channel(initial);
        (
            NetworkWatcher {
                probe,
                settle_delay,
                current,
            },
            rx,
        )
    }

    pub fn current(&self) -> Ipv4Addr {
        *self.current.borrow()
    }

    /// Publish `resolved` if it is a real, new address.
    pub fn apply(&self, resolved: Ipv4Addr) -> Option<Ipv4Addr> {
        if resolved.is_loopback() {
            warn!("No routable local address after network change, keeping {}", self.current());
            return None;
        }
        let previous = self.current();
        if resolved == previous {
            debug!("Network change left local address at {}", resolved);
            return None;
        }

        info!("Local address changed {} -> {}", previous, resolved);
        self.current.send_replace(resolved);
        Some(resolved)
    }

    /// Wait for the network to settle, then re-resolve and publish.
    pub async fn handle_change(&self) -> Option<Ipv4Addr> {
        tokio::time::sleep(self.settle_delay).await;
        let resolved = resolve_local_address(&self.probe).await;
        self.apply(resolved)
    }

    /// Re-resolve on change signals until shutdown. The published address
    /// stays available after every signal source is gone.
    pub async fn run(self, mut signals: mpsc::Receiver<()>, mut shutdown: watch::Receiver<bool>) {
        info!("Network watcher started on {}", self.current());
        let mut listening = true;
        loop {
            tokio::select! {
                signal = signals.recv(), if listening => {
                    if signal.is_none() {
                        warn!("No network change sources left, local address fixed at {}", self.current());
                        listening = false;
                        continue;
                    }
                    // coalesce a burst of signals into one re-resolve
                    while signals.try_recv().is_ok() {}
                    tokio::select! {
                        _ = self.handle_change() => {}
                        _ = shutdown.changed() => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Network watcher shutting down");
    }
}

/// Emit a change signal whenever the routed address differs from the last poll.
pub async fn poll_interfaces(
    probe: String,
    interval: Duration,
    signals: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last = resolve_local_address(&probe).await;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = resolve_local_address(&probe).await;
                if now != last {
                    debug!("Interface poll saw {} -> {}", last, now);
                    last = now;
                    if signals.try_send(()).is_err() {
                        debug!("Network change already pending");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(unix)]
pub async fn forward_hangup(signals: mpsc::Sender<()>, mut shutdown: watch::Receiver<bool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("SIGHUP handler unavailable: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, re-checking local address");
                let _ = signals.try_send(());
            }
            _ = shutdown.changed() => break,
        }
    }
}
