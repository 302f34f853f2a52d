//! Decides whether a captured packet is UDP traffic crossing the boundary
//! between the local network and the outside world on this host's address.

use crate::ip_header::Ipv4Header;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub accept: bool,
    pub inbound: bool,
}

impl Classification {
    pub const REJECT: Classification = Classification {
        accept: false,
        inbound: false,
    };
}

pub fn classify(header: &Ipv4Header, local: Ipv4Addr, local_ranges: &[Ipv4Network]) -> Classification {
    if !header.is_udp() {
        return Classification::REJECT;
    }

    if header.is_multicast() || header.is_broadcast() {
        return Classification::REJECT;
    }

    // Promiscuous capture sees the whole LAN; keep only flows touching this host.
    if header.source != local && header.destination != local {
        return Classification::REJECT;
    }

    let both_local = !local_ranges.is_empty()
        && local_ranges
            .iter()
            .all(|range| range.contains(header.source) && range.contains(header.destination));
    if both_local {
        return Classification::REJECT;
    }

    Classification {
        accept: true,
        inbound: header.is_inbound(local),
    }
}
