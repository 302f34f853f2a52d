//! IPv4 header decoding for captured datagrams.
//!
//! Only the fields needed to classify a packet are read: protocol, source and
//! destination. Anything that cannot be decoded yields an inert header which
//! every classification rule rejects.

use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use std::net::Ipv4Addr;

pub const IPV4_MIN_HEADER_LEN: usize = 20;

pub const PROTO_UDP: u8 = IpNextHeaderProtocols::Udp.0;

#[cfg(test)]
pub const PROTO_TCP: u8 = IpNextHeaderProtocols::Tcp.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Header in the "unknown" state: protocol 0, both addresses 0.0.0.0.
    pub const UNKNOWN: Ipv4Header = Ipv4Header {
        protocol: 0,
        source: Ipv4Addr::UNSPECIFIED,
        destination: Ipv4Addr::UNSPECIFIED,
    };

    /// Decode the first `len` bytes of `buf`. Never fails.
    pub fn parse(buf: &[u8], len: usize) -> Self {
        let data = &buf[..len.min(buf.len())];
        let packet = match Ipv4Packet::new(data) {
            Some(packet) if packet.get_version() == 4 => packet,
            _ => return Self::UNKNOWN,
        };

        Ipv4Header {
            protocol: packet.get_next_level_protocol().0,
            source: packet.get_source(),
            destination: packet.get_destination(),
        }
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == PROTO_UDP
    }

    /// Destination in 224.0.0.0/4.
    pub fn is_multicast(&self) -> bool {
        self.destination.is_multicast()
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    pub fn is_inbound(&self, local: Ipv4Addr) -> bool {
        self.destination == local
    }
}

#[cfg(test)]
pub(crate) fn build_datagram(protocol: u8, source: Ipv4Addr, destination: Ipv4Addr) -> Vec<u8> {
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&28u16.to_be_bytes());
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&source.octets());
    packet[16..20].copy_from_slice(&destination.octets());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_udp_datagram() {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let packet = build_datagram(PROTO_UDP, src, dst);

        let header = Ipv4Header::parse(&packet, packet.len());

        assert!(header.is_udp());
        assert_eq!(header.protocol, PROTO_UDP);
        assert_eq!(header.source, src);
        assert_eq!(header.destination, dst);
        assert!(!header.is_inbound(src));
        assert!(header.is_inbound(dst));
    }

    #[test]
    fn test_udp_iff_protocol_17() {
        for proto in [0u8, 1, 6, 16, 17, 18, 47, 255] {
            let packet = build_datagram(proto, Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2));
            let header = Ipv4Header::parse(&packet, packet.len());
            assert_eq!(header.is_udp(), proto == 17, "protocol {}", proto);
            assert_eq!(header.protocol, proto);
        }
    }

    #[test]
    fn test_multicast_range() {
        for first in [223u8, 224, 230, 239, 240] {
            let packet = build_datagram(PROTO_UDP, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(first, 0, 0, 1));
            let header = Ipv4Header::parse(&packet, packet.len());
            assert_eq!(header.is_multicast(), (224..=239).contains(&first), "octet {}", first);
        }
    }

    #[test]
    fn test_broadcast() {
        let packet = build_datagram(PROTO_UDP, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::BROADCAST);
        assert!(Ipv4Header::parse(&packet, packet.len()).is_broadcast());
    }

    #[test]
    fn test_short_buffer_is_inert() {
        let packet = build_datagram(PROTO_UDP, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(8, 8, 8, 8));
        for len in 0..IPV4_MIN_HEADER_LEN {
            assert_eq!(Ipv4Header::parse(&packet, len), Ipv4Header::UNKNOWN);
        }
        assert_eq!(Ipv4Header::parse(&[], 0), Ipv4Header::UNKNOWN);
    }

    #[test]
    fn test_length_larger_than_buffer_is_clamped() {
        let packet = build_datagram(PROTO_UDP, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(8, 8, 8, 8));
        let header = Ipv4Header::parse(&packet[..12], 4096);
        assert_eq!(header, Ipv4Header::UNKNOWN);
    }

    #[test]
    fn test_non_ipv4_version_is_inert() {
        let mut packet = build_datagram(PROTO_UDP, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(8, 8, 8, 8));
        packet[0] = 0x60;
        assert_eq!(Ipv4Header::parse(&packet, packet.len()), Ipv4Header::UNKNOWN);
    }
}
