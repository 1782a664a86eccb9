//! Protocol aggregation over stored packets.

use chrono::{DateTime, Utc};

use crate::db::{DbError, ProtocolStat, ProtocolStats, Store};

/// Per-protocol packet and byte counts for `owner_id` since `since`,
/// ordered by packet count, with grand totals.
pub fn protocol_stats(store: &Store, owner_id: i64, since: DateTime<Utc>) -> Result<ProtocolStats, DbError> {
    Ok(fold(store.get_protocol_counts(owner_id, since)?))
}

fn fold(protocols: Vec<ProtocolStat>) -> ProtocolStats {
    let total_packets = protocols.iter().map(|p| p.packet_count).sum();
    let total_bytes = protocols.iter().map(|p| p.total_bytes).sum();
    ProtocolStats {
        protocols,
        total_packets,
        total_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PacketRecord, Protocol};
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn packet(protocol: Protocol, length: Option<u32>) -> PacketRecord {
        PacketRecord {
            id: 0,
            protocol,
            src_addr: "10.0.0.1".to_string(),
            dst_addr: "10.0.0.2".to_string(),
            src_port: None,
            dst_port: None,
            length,
            info: String::new(),
            captured_at: Utc::now(),
            owner_id: 0,
        }
    }

    #[test]
    fn test_protocol_totals() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut packets = vec![
            packet(Protocol::Tcp, Some(100)),
            packet(Protocol::Tcp, Some(200)),
            packet(Protocol::Udp, Some(50)),
        ];
        store.commit_capture(1, false, &mut packets).unwrap();

        let stats = protocol_stats(&store, 1, Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(stats.total_packets, 3);
        assert_eq!(stats.total_bytes, 350);
        assert_eq!(stats.protocols[0].protocol, Protocol::Tcp);
        assert_eq!(stats.protocols[0].packet_count, 2);
        assert_eq!(stats.protocols[0].total_bytes, 300);
        assert_eq!(stats.protocols[1].protocol, Protocol::Udp);
        assert_eq!(stats.protocols[1].total_bytes, 50);
    }

    #[test]
    fn test_missing_length_counts_as_zero() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut packets = vec![packet(Protocol::Icmp, None), packet(Protocol::Icmp, Some(64))];
        store.commit_capture(1, false, &mut packets).unwrap();

        let stats = protocol_stats(&store, 1, Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(stats.total_packets, 2);
        assert_eq!(stats.total_bytes, 64);
    }

    #[test]
    fn test_empty_window_and_other_owners() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut packets = vec![packet(Protocol::Tcp, Some(100))];
        store.commit_capture(2, false, &mut packets).unwrap();

        let stats = protocol_stats(&store, 1, Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(stats, ProtocolStats::default());
    }
}
