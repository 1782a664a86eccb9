//! Host counter source backed by sysinfo.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, Networks, RefreshKind, System};

use super::TelemetryError;
use crate::db::{ResourceSample, TrafficSample};

/// Point-in-time read of cumulative interface counters, summed over all interfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub err_in: u64,
    pub err_out: u64,
    pub drop_in: u64,
    pub drop_out: u64,
    pub taken_at: DateTime<Utc>,
}

impl CounterSnapshot {
    pub fn to_traffic_sample(&self) -> TrafficSample {
        TrafficSample {
            bytes_sent: self.bytes_sent,
            bytes_recv: self.bytes_recv,
            packets_sent: self.packets_sent,
            packets_recv: self.packets_recv,
            sampled_at: self.taken_at,
        }
    }
}

/// Reads OS counters. No retries: a failed read is reported and the caller decides.
pub trait CounterSource: Send {
    /// Cumulative network counters.
    fn read(&mut self) -> Result<CounterSnapshot, TelemetryError>;

    /// CPU, memory and disk usage.
    fn read_resources(&mut self) -> Result<ResourceSample, TelemetryError>;
}

/// sysinfo-backed counters for the local host.
pub struct SystemCounters {
    system: System,
    networks: Networks,
    disks: Disks,
}

impl SystemCounters {
    pub fn new() -> Result<Self, TelemetryError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(TelemetryError::Unavailable(
                "host counters are not supported on this platform".to_string(),
            ));
        }

        let refresh_kind = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(MemoryRefreshKind::nothing().with_ram());

        // CPU usage is measured between refreshes, so take the baseline now.
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_cpu_usage();

        Ok(Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
        })
    }
}

impl CounterSource for SystemCounters {
    fn read(&mut self) -> Result<CounterSnapshot, TelemetryError> {
        self.networks.refresh(true);

        if self.networks.is_empty() {
            return Err(TelemetryError::Unavailable("no network interfaces visible".to_string()));
        }

        let mut snapshot = CounterSnapshot {
            bytes_sent: 0,
            bytes_recv: 0,
            packets_sent: 0,
            packets_recv: 0,
            err_in: 0,
            err_out: 0,
            // sysinfo doesn't provide drop counters
            drop_in: 0,
            drop_out: 0,
            taken_at: Utc::now(),
        };

        for data in self.networks.values() {
            snapshot.bytes_sent = snapshot.bytes_sent.saturating_add(data.total_transmitted());
            snapshot.bytes_recv = snapshot.bytes_recv.saturating_add(data.total_received());
            snapshot.packets_sent = snapshot.packets_sent.saturating_add(data.total_packets_transmitted());
            snapshot.packets_recv = snapshot.packets_recv.saturating_add(data.total_packets_received());
            snapshot.err_in = snapshot.err_in.saturating_add(data.total_errors_on_received());
            snapshot.err_out = snapshot.err_out.saturating_add(data.total_errors_on_transmitted());
        }

        Ok(snapshot)
    }

    fn read_resources(&mut self) -> Result<ResourceSample, TelemetryError> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let memory_total = self.system.total_memory();
        let memory_used = self.system.used_memory();

        // Prefer the root mount, otherwise the largest disk.
        let disk = self
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| self.disks.list().iter().max_by_key(|d| d.total_space()))
            .ok_or_else(|| TelemetryError::Unavailable("no disks visible".to_string()))?;

        let disk_total = disk.total_space();
        let disk_used = disk_total.saturating_sub(disk.available_space());

        Ok(ResourceSample {
            cpu_percent: round1(f64::from(self.system.global_cpu_usage())),
            memory_percent: percent(memory_used, memory_total),
            memory_used,
            memory_total,
            disk_percent: percent(disk_used, disk_total),
            disk_used,
            disk_total,
            sampled_at: Utc::now(),
        })
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round1(used as f64 / total as f64 * 100.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
