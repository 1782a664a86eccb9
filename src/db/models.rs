//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host resource usage at one sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_percent: f64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Cumulative interface counters recorded at one sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Transport classification of a captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Ip,
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Ip => "IP",
            Protocol::Other => "OTHER",
        }
    }

    /// Parse a stored protocol name. Anything unknown is `Other`.
    pub fn from_db(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            "ICMP" => Protocol::Icmp,
            "IP" => Protocol::Ip,
            _ => Protocol::Other,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single normalized captured packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Row id, 0 until persisted.
    pub id: i64,
    pub protocol: Protocol,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub length: Option<u32>,
    pub info: String,
    pub captured_at: DateTime<Utc>,
    pub owner_id: i64,
}

/// Per-protocol aggregate over a query window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolStat {
    pub protocol: Protocol,
    pub packet_count: i64,
    pub total_bytes: i64,
}

/// Result of a protocol aggregation query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProtocolStats {
    pub protocols: Vec<ProtocolStat>,
    pub total_packets: i64,
    pub total_bytes: i64,
}

/// Monitored dimension an alert is raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Cpu => "cpu",
            AlertType::Memory => "memory",
            AlertType::Disk => "disk",
            AlertType::Network => "network",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(AlertType::Cpu),
            "memory" => Some(AlertType::Memory),
            "disk" => Some(AlertType::Disk),
            "network" => Some(AlertType::Network),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "info" => AlertSeverity::Info,
            "critical" => AlertSeverity::Critical,
            _ => AlertSeverity::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn from_db(s: &str) -> Self {
        if s == "resolved" {
            AlertStatus::Resolved
        } else {
            AlertStatus::Active
        }
    }
}

/// A threshold alert. Rows are only ever transitioned, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub alert_type: AlertType,
    pub message: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub subject_id: i64,
    pub device_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// An alert that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub message: String,
    pub severity: AlertSeverity,
    pub device_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountByKey {
    pub key: String,
    pub count: i64,
}

/// Alert counts for the status page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertStatistics {
    pub by_type: Vec<CountByKey>,
    pub by_severity: Vec<CountByKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficSummary {
    pub total_bytes_sent: u64,
    pub total_bytes_recv: u64,
    pub total_packets_sent: u64,
    pub total_packets_recv: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyTraffic {
    pub hour: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// Traffic samples folded into totals and hourly buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficAnalytics {
    pub summary: TrafficSummary,
    pub hourly: Vec<HourlyTraffic>,
}
