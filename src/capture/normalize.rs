//! Frame to [`PacketRecord`] normalization.

use etherparse::{IpHeader, PacketHeaders, TcpHeader, TransportHeader};
use std::net::{Ipv4Addr, Ipv6Addr};

use super::{LinkType, RawFrame};
use crate::db::{PacketRecord, Protocol};

/// Reduce a raw frame to a packet record.
///
/// Returns `None` for frames without a network-layer header (ARP, LLDP, ...)
/// and for frames that don't parse. Transport is checked in the order
/// TCP, UDP, ICMP; anything else with an IP header is recorded as `IP`.
pub fn normalize(frame: &RawFrame, owner_id: i64) -> Option<PacketRecord> {
    let headers = match frame.link {
        LinkType::Ethernet => PacketHeaders::from_ethernet_slice(&frame.data),
        LinkType::RawIp => PacketHeaders::from_ip_slice(&frame.data),
    };

    let headers = match headers {
        Ok(h) => h,
        Err(e) => {
            tracing::trace!("Capture: skipping malformed frame: {}", e);
            return None;
        }
    };

    let (src_addr, dst_addr) = match headers.ip.as_ref()? {
        IpHeader::Version4(h, _) => (
            Ipv4Addr::from(h.source).to_string(),
            Ipv4Addr::from(h.destination).to_string(),
        ),
        IpHeader::Version6(h, _) => (
            Ipv6Addr::from(h.source).to_string(),
            Ipv6Addr::from(h.destination).to_string(),
        ),
    };

    let (protocol, src_port, dst_port, info) = match &headers.transport {
        Some(TransportHeader::Tcp(tcp)) => (
            Protocol::Tcp,
            Some(tcp.source_port),
            Some(tcp.destination_port),
            format!("Flags: {}", tcp_flags(tcp)),
        ),
        Some(TransportHeader::Udp(udp)) => (
            Protocol::Udp,
            Some(udp.source_port),
            Some(udp.destination_port),
            String::new(),
        ),
        Some(TransportHeader::Icmpv4(icmp)) => (
            Protocol::Icmp,
            None,
            None,
            // Icmpv4Type has no raw accessor; the type is the first header byte.
            format!("Type: {}", icmp.to_bytes()[0]),
        ),
        Some(TransportHeader::Icmpv6(icmp)) => (
            Protocol::Icmp,
            None,
            None,
            format!("Type: {}", icmp.icmp_type.type_u8()),
        ),
        None => (Protocol::Ip, None, None, String::new()),
    };

    Some(PacketRecord {
        id: 0,
        protocol,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        length: Some(frame.original_len),
        info,
        captured_at: frame.captured_at,
        owner_id,
    })
}

fn tcp_flags(tcp: &TcpHeader) -> String {
    let flags = [
        (tcp.syn, "SYN"),
        (tcp.ack, "ACK"),
        (tcp.fin, "FIN"),
        (tcp.rst, "RST"),
        (tcp.psh, "PSH"),
        (tcp.urg, "URG"),
    ];
    let set: Vec<&str> = flags.iter().filter(|(on, _)| *on).map(|(_, name)| *name).collect();
    set.join(",")
}
