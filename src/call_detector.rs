use crate::traffic_monitor::TrafficWindow;
use chrono::{DateTime, Local};
use ipnetwork::Ipv4Network;
use log::{debug, info};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Provider name -> networks, searched in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ProviderTable {
    providers: Vec<(String, Vec<Ipv4Network>)>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the ranges for `name`.
    pub fn insert(&mut self, name: String, ranges: Vec<Ipv4Network>) {
        match self.providers.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = ranges,
            None => self.providers.push((name, ranges)),
        }
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<&str> {
        self.providers
            .iter()
            .find(|(_, ranges)| ranges.iter().any(|r| r.contains(ip)))
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn range_count(&self) -> usize {
        self.providers.iter().map(|(_, r)| r.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Inactive,
    Active {
        remote: Ipv4Addr,
        provider: String,
        started: DateTime<Local>,
    },
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Active { .. })
    }

    pub fn remote(&self) -> Option<Ipv4Addr> {
        match self {
            CallState::Active { remote, .. } => Some(*remote),
            CallState::Inactive => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    UnknownNetwork {
        remote: Ipv4Addr,
        rate: u32,
    },
    CallStarted {
        remote: Ipv4Addr,
        provider: String,
        rate: u32,
    },
    CallEnded {
        provider: String,
        duration: Duration,
    },
}

pub struct CallDetector {
    providers: ProviderTable,
    min_packet_rate: u32,
    state: CallState,
}

impl CallDetector {
    pub fn new(providers: ProviderTable, min_packet_rate: u32) -> Self {
        info!(
            "[CallDetector] Loaded {} providers with {} ranges, threshold {} packets/interval",
            providers.len(),
            providers.range_count(),
            min_packet_rate
        );

        CallDetector {
            providers,
            min_packet_rate,
            state: CallState::Inactive,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Evaluate one sampling window and advance the call state machine.
    pub fn check(&mut self, window: &TrafficWindow, now: DateTime<Local>) -> Option<CallEvent> {
        let locked = self.state.remote();
        let top_inbound = top_talker(&window.inbound, locked);
        let top_outbound = top_talker(&window.outbound, locked);

        // higher count wins, inbound on a tie
        let candidate = match (top_inbound, top_outbound) {
            (Some(inbound), Some(outbound)) if outbound.1 > inbound.1 => Some(outbound),
            (Some(inbound), _) => Some(inbound),
            (None, outbound) => outbound,
        };

        match candidate {
            Some((remote, rate)) if rate >= self.min_packet_rate => self.on_traffic(remote, rate, now),
            _ => self.on_quiet(now),
        }
    }

    fn on_traffic(&mut self, remote: Ipv4Addr, rate: u32, now: DateTime<Local>) -> Option<CallEvent> {
        if self.state.is_active() {
            debug!("Call traffic from {} count {}", remote, rate);
            return None;
        }

        match self.providers.lookup(remote) {
            None => Some(CallEvent::UnknownNetwork { remote, rate }),
            Some(provider) => {
                let provider = provider.to_string();
                self.state = CallState::Active {
                    remote,
                    provider: provider.clone(),
                    started: now,
                };
                Some(CallEvent::CallStarted { remote, provider, rate })
            }
        }
    }

    fn on_quiet(&mut self, now: DateTime<Local>) -> Option<CallEvent> {
        match std::mem::replace(&mut self.state, CallState::Inactive) {
            CallState::Active { provider, started, .. } => {
                let duration = (now - started).to_std().unwrap_or_default();
                Some(CallEvent::CallEnded { provider, duration })
            }
            CallState::Inactive => None,
        }
    }
}

/// Highest count in `stats`, restricted to `locked` when a call is active.
/// Equal counts resolve to the lowest address.
fn top_talker(stats: &HashMap<Ipv4Addr, u32>, locked: Option<Ipv4Addr>) -> Option<(Ipv4Addr, u32)> {
    stats
        .iter()
        .filter(|(ip, _)| locked.map_or(true, |l| **ip == l))
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(ip, count)| (*ip, *count))
}
