//! Per-interval traffic aggregation.
//!
//! A single actor task owns the current window and the call detector. Packets
//! arrive over a bounded channel from the capture thread and the sampling
//! timer runs in the same `select!`, so increments and window hand-off never
//! interleave.

use crate::call_detector::{CallDetector, CallEvent, CallState};
use crate::ip_header::Ipv4Header;
use crate::notifier::CallObserver;
use chrono::Local;
use log::{debug, info};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Accepted packet forwarded from capture.
#[derive(Debug, Clone, Copy)]
pub struct CapturedPacket {
    pub header: Ipv4Header,
    pub inbound: bool,
}

/// Remote address -> packet count, per direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficWindow {
    pub inbound: HashMap<Ipv4Addr, u32>,
    pub outbound: HashMap<Ipv4Addr, u32>,
}

impl TrafficWindow {
    pub fn record(&mut self, packet: &CapturedPacket) {
        let (stats, remote) = if packet.inbound {
            (&mut self.inbound, packet.header.source)
        } else {
            (&mut self.outbound, packet.header.destination)
        };
        let count = stats.entry(remote).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Hand off the current contents and leave an empty window behind.
    pub fn take(&mut self) -> TrafficWindow {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty() && self.outbound.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.inbound
            .values()
            .chain(self.outbound.values())
            .map(|c| *c as u64)
            .sum()
    }
}

pub struct TrafficAggregator {
    window: TrafficWindow,
    detector: CallDetector,
    observer: Arc<dyn CallObserver>,
}

impl TrafficAggregator {
    pub fn new(detector: CallDetector, observer: Arc<dyn CallObserver>) -> Self {
        TrafficAggregator {
            window: TrafficWindow::default(),
            detector,
            observer,
        }
    }

    pub fn record(&mut self, packet: &CapturedPacket) {
        self.window.record(packet);
    }

    /// Close the current window and run detection on it.
    pub fn tick(&mut self) -> Option<CallEvent> {
        let snapshot = self.window.take();
        if !snapshot.is_empty() {
            debug!(
                "Window: {} packets, {} inbound / {} outbound peers",
                snapshot.total(),
                snapshot.inbound.len(),
                snapshot.outbound.len()
            );
        }

        let event = self.detector.check(&snapshot, Local::now());
        if let Some(event) = &event {
            self.observer.notify(event);
        }
        event
    }

    #[cfg(test)]
    pub fn window(&self) -> &TrafficWindow {
        &self.window
    }

    #[cfg(test)]
    pub fn detector(&self) -> &CallDetector {
        &self.detector
    }

    pub async fn run(
        mut self,
        mut packets: mpsc::Receiver<CapturedPacket>,
        sample_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Traffic aggregator started, sampling every {:?}", sample_interval);
        let start = tokio::time::Instant::now() + sample_interval;
        let mut ticker = tokio::time::interval_at(start, sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(packet) = packets.recv() => {
                    self.record(&packet);
                }
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => {
                    info!("Traffic aggregator shutting down");
                    break;
                }
            }
        }
        if let CallState::Active { provider, remote, .. } = self.detector.state() {
            info!("Stopped during an active {} call with {}", provider, remote);
        }
    }
}
