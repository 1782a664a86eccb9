//! Rate and utilization derived from two counter snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::CounterSnapshot;

/// Elapsed time substituted when two snapshots carry no measurable interval.
pub const MIN_ELAPSED_SECS: f64 = 1.0;

/// Throughput between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadMetrics {
    pub bytes_sent_per_sec: f64,
    pub bytes_recv_per_sec: f64,
    pub packets_sent_per_sec: f64,
    pub packets_recv_per_sec: f64,
    pub upload_util_pct: f64,
    pub download_util_pct: f64,
    pub total_util_pct: f64,
    pub computed_at: DateTime<Utc>,
}

/// Outcome of feeding a snapshot into a [`RateTracker`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "load", rename_all = "snake_case")]
pub enum LoadStatus {
    /// No earlier snapshot yet; try again after one sampling interval.
    InsufficientBaseline,
    Ready(LoadMetrics),
}

/// Derive per-second rates from `prev` to `curr`.
///
/// A counter that went backwards (interface restart) yields a rate of 0 for
/// that field. Utilization is throughput in bits/s against
/// `link_capacity_mbps`, clamped to [0, 100].
pub fn compute_load(
    prev: &CounterSnapshot,
    curr: &CounterSnapshot,
    elapsed_secs: f64,
    link_capacity_mbps: f64,
) -> LoadMetrics {
    let elapsed = if elapsed_secs > 0.0 && elapsed_secs.is_finite() {
        elapsed_secs
    } else {
        MIN_ELAPSED_SECS
    };

    let rate = |prev: u64, curr: u64| curr.saturating_sub(prev) as f64 / elapsed;

    let bytes_sent_per_sec = rate(prev.bytes_sent, curr.bytes_sent);
    let bytes_recv_per_sec = rate(prev.bytes_recv, curr.bytes_recv);

    LoadMetrics {
        bytes_sent_per_sec,
        bytes_recv_per_sec,
        packets_sent_per_sec: rate(prev.packets_sent, curr.packets_sent),
        packets_recv_per_sec: rate(prev.packets_recv, curr.packets_recv),
        upload_util_pct: utilization(bytes_sent_per_sec, link_capacity_mbps),
        download_util_pct: utilization(bytes_recv_per_sec, link_capacity_mbps),
        total_util_pct: utilization(bytes_sent_per_sec + bytes_recv_per_sec, link_capacity_mbps),
        computed_at: curr.taken_at,
    }
}

fn utilization(bytes_per_sec: f64, link_capacity_mbps: f64) -> f64 {
    if link_capacity_mbps <= 0.0 {
        return 0.0;
    }
    let capacity_bits = link_capacity_mbps * 1_000_000.0;
    (bytes_per_sec * 8.0 / capacity_bits * 100.0).clamp(0.0, 100.0)
}

/// Holds the previous snapshot of one rate stream.
///
/// Observing is a read-modify-write, so a tracker shared between tasks must
/// sit behind a mutex. Independent streams use independent trackers.
#[derive(Debug, Clone)]
pub struct RateTracker {
    previous: Option<CounterSnapshot>,
    link_capacity_mbps: f64,
}

impl RateTracker {
    pub fn new(link_capacity_mbps: f64) -> Self {
        Self {
            previous: None,
            link_capacity_mbps,
        }
    }

    /// Record `curr` as the new baseline and return the load since the old one.
    pub fn observe(&mut self, curr: CounterSnapshot) -> LoadStatus {
        let status = match &self.previous {
            None => LoadStatus::InsufficientBaseline,
            Some(prev) => {
                let elapsed = (curr.taken_at - prev.taken_at).num_milliseconds() as f64 / 1000.0;
                LoadStatus::Ready(compute_load(prev, &curr, elapsed, self.link_capacity_mbps))
            }
        };
        self.previous = Some(curr);
        status
    }

    pub fn has_baseline(&self) -> bool {
        self.previous.is_some()
    }
}
