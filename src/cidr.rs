//! CIDR list helpers: parsing configured ranges and consolidating provider
//! lists into the smallest equivalent set of networks.

use crate::error::{MonitorError, Result};
use ipnetwork::Ipv4Network;
use log::debug;
use std::fs;
use std::path::Path;

/// Parse a list of CIDR strings. A bare address is treated as a /32.
pub fn parse_ranges(values: &[String]) -> Result<Vec<Ipv4Network>> {
    values.iter().map(|v| parse_range(v)).collect()
}

pub fn parse_range(value: &str) -> Result<Ipv4Network> {
    let trimmed = value.trim();
    let network: Ipv4Network = trimmed.parse().map_err(|e: ipnetwork::IpNetworkError| {
        MonitorError::InvalidNetwork {
            value: value.to_string(),
            reason: e.to_string(),
        }
    })?;
    // host bits dropped
    Ipv4Network::new(network.network(), network.prefix()).map_err(|e| MonitorError::InvalidNetwork {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn covers(outer: (u32, u8), inner: (u32, u8)) -> bool {
    outer.1 <= inner.1 && inner.0 & mask(outer.1) == outer.0
}

fn siblings(low: (u32, u8), high: (u32, u8)) -> bool {
    if low.1 != high.1 || low.1 == 0 {
        return false;
    }
    let size = 1u64 << (32 - low.1 as u32);
    (low.0 as u64) % (size * 2) == 0 && high.0 as u64 == low.0 as u64 + size
}

/// Merge overlapping and adjacent networks. Output is sorted by address.
pub fn merge_ranges(ranges: Vec<Ipv4Network>) -> Vec<Ipv4Network> {
    let mut nets: Vec<(u32, u8)> = ranges
        .iter()
        .map(|n| (u32::from(n.network()), n.prefix()))
        .collect();
    nets.sort_unstable();
    nets.dedup();

    let mut merged: Vec<(u32, u8)> = Vec::with_capacity(nets.len());
    for net in nets {
        if let Some(&last) = merged.last() {
            if covers(last, net) {
                continue;
            }
        }
        merged.push(net);

        while merged.len() >= 2 {
            let high = merged[merged.len() - 1];
            let low = merged[merged.len() - 2];
            if !siblings(low, high) {
                break;
            }
            merged.truncate(merged.len() - 2);
            merged.push((low.0, low.1 - 1));
        }
    }

    merged
        .into_iter()
        .filter_map(|(addr, prefix)| Ipv4Network::new(addr.into(), prefix).ok())
        .collect()
}

/// Read one CIDR per line, skipping blank lines and `#` comments.
pub fn read_range_file(path: &Path) -> Result<Vec<Ipv4Network>> {
    let contents = fs::read_to_string(path)?;
    let lines: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect();
    debug!("Read {} ranges from {}", lines.len(), path.display());
    parse_ranges(&lines)
}
