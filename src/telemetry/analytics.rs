//! Traffic analytics over stored cumulative samples.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use std::collections::BTreeMap;

use crate::db::{DbError, HourlyTraffic, Store, TrafficAnalytics, TrafficSample, TrafficSummary};

/// Totals and hourly buckets of traffic since `since`.
pub fn traffic_analytics(store: &Store, since: DateTime<Utc>) -> Result<TrafficAnalytics, DbError> {
    Ok(fold_samples(&store.get_traffic_since(since)?))
}

/// Samples hold cumulative counters, so traffic is the sum of deltas between
/// consecutive samples. A delta is attributed to the hour of its later sample.
/// Counter resets contribute 0.
pub fn fold_samples(samples: &[TrafficSample]) -> TrafficAnalytics {
    let mut summary = TrafficSummary::default();
    let mut hourly: BTreeMap<DateTime<Utc>, (u64, u64)> = BTreeMap::new();

    for pair in samples.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        let sent = curr.bytes_sent.saturating_sub(prev.bytes_sent);
        let recv = curr.bytes_recv.saturating_sub(prev.bytes_recv);

        summary.total_bytes_sent += sent;
        summary.total_bytes_recv += recv;
        summary.total_packets_sent += curr.packets_sent.saturating_sub(prev.packets_sent);
        summary.total_packets_recv += curr.packets_recv.saturating_sub(prev.packets_recv);

        let hour = curr
            .sampled_at
            .duration_trunc(ChronoDuration::hours(1))
            .unwrap_or(curr.sampled_at);
        let bucket = hourly.entry(hour).or_default();
        bucket.0 += sent;
        bucket.1 += recv;
    }

    TrafficAnalytics {
        summary,
        hourly: hourly
            .into_iter()
            .map(|(hour, (bytes_sent, bytes_recv))| HourlyTraffic {
                hour,
                bytes_sent,
                bytes_recv,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(bytes_sent: u64, bytes_recv: u64, at: DateTime<Utc>) -> TrafficSample {
        TrafficSample {
            bytes_sent,
            bytes_recv,
            packets_sent: bytes_sent / 100,
            packets_recv: bytes_recv / 100,
            sampled_at: at,
        }
    }

    #[test]
    fn test_deltas_bucketed_by_hour() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 50, 0).unwrap();
        let samples = vec![
            sample(1000, 2000, base),
            sample(1500, 2600, base + ChronoDuration::minutes(5)),
            sample(2500, 3000, base + ChronoDuration::minutes(15)),
        ];

        let analytics = fold_samples(&samples);
        assert_eq!(analytics.summary.total_bytes_sent, 1500);
        assert_eq!(analytics.summary.total_bytes_recv, 1000);
        assert_eq!(analytics.summary.total_packets_sent, 15);

        assert_eq!(analytics.hourly.len(), 2);
        assert_eq!(analytics.hourly[0].hour, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert_eq!(analytics.hourly[0].bytes_sent, 500);
        assert_eq!(analytics.hourly[1].hour, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());
        assert_eq!(analytics.hourly[1].bytes_sent, 1000);
        assert_eq!(analytics.hourly[1].bytes_recv, 400);
    }

    #[test]
    fn test_counter_reset_contributes_zero() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let samples = vec![
            sample(5000, 5000, base),
            sample(100, 5100, base + ChronoDuration::minutes(1)),
        ];

        let analytics = fold_samples(&samples);
        assert_eq!(analytics.summary.total_bytes_sent, 0);
        assert_eq!(analytics.summary.total_bytes_recv, 100);
    }

    #[test]
    fn test_single_sample_has_no_traffic() {
        let analytics = fold_samples(&[sample(1, 1, Utc::now())]);
        assert_eq!(analytics, TrafficAnalytics::default());
    }
}
