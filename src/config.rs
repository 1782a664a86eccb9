//! Configuration module for netpulse.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::alerts::Thresholds;
use crate::capture::CaptureLimits;

/// Monitor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// HTTP port for the web server (default: 5000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "netpulse.db")
    pub db_path: String,
    pub sample_interval: Duration,
    pub check_interval: Duration,
    /// Pause after a failed scheduler tick.
    pub error_backoff: Duration,
    /// How long shutdown waits for an in-flight tick.
    pub stop_timeout: Duration,
    pub thresholds: Thresholds,
    pub capture_timeout: Duration,
    pub capture_max_packets: usize,
    /// Row cap for history listings.
    pub history_limit: usize,
    /// Nominal link speed that utilization is measured against.
    pub link_capacity_mbps: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            http_port: 5000,
            db_path: "netpulse.db".to_string(),
            sample_interval: Duration::from_secs(60),
            check_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            thresholds: Thresholds::default(),
            capture_timeout: Duration::from_secs(60),
            capture_max_packets: 1000,
            history_limit: 1000,
            link_capacity_mbps: 100.0,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from `NETPULSE_*` environment variables.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        set(&lookup, "NETPULSE_HTTP_PORT", &mut cfg.http_port);
        if let Some(db_path) = lookup("NETPULSE_DB_PATH") {
            cfg.db_path = db_path;
        }

        set_secs(&lookup, "NETPULSE_SAMPLE_INTERVAL_SECS", &mut cfg.sample_interval);
        set_secs(&lookup, "NETPULSE_CHECK_INTERVAL_SECS", &mut cfg.check_interval);
        set_secs(&lookup, "NETPULSE_ERROR_BACKOFF_SECS", &mut cfg.error_backoff);
        set_secs(&lookup, "NETPULSE_STOP_TIMEOUT_SECS", &mut cfg.stop_timeout);

        set(&lookup, "NETPULSE_CPU_THRESHOLD", &mut cfg.thresholds.cpu);
        set(&lookup, "NETPULSE_MEMORY_THRESHOLD", &mut cfg.thresholds.memory);
        set(&lookup, "NETPULSE_DISK_THRESHOLD", &mut cfg.thresholds.disk);
        set(&lookup, "NETPULSE_NETWORK_THRESHOLD", &mut cfg.thresholds.network);

        set_secs(&lookup, "NETPULSE_CAPTURE_TIMEOUT_SECS", &mut cfg.capture_timeout);
        set(&lookup, "NETPULSE_CAPTURE_MAX_PACKETS", &mut cfg.capture_max_packets);
        set(&lookup, "NETPULSE_HISTORY_LIMIT", &mut cfg.history_limit);
        set(&lookup, "NETPULSE_LINK_CAPACITY_MBPS", &mut cfg.link_capacity_mbps);

        cfg
    }

    pub fn capture_limits(&self) -> CaptureLimits {
        CaptureLimits {
            max_packets: self.capture_max_packets,
            timeout: self.capture_timeout,
        }
    }
}

fn set<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!("Ignoring invalid value {:?} for {}", raw, key),
        }
    }
}

/// Intervals of zero would spin, so they are rejected like parse errors.
fn set_secs<F>(lookup: &F, key: &str, target: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => *target = Duration::from_secs(secs),
            _ => tracing::warn!("Ignoring invalid value {:?} for {}", raw, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_from(vars: &[(&str, &str)]) -> MonitorConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        MonitorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.http_port, 5000);
        assert_eq!(cfg.db_path, "netpulse.db");
        assert_eq!(cfg.sample_interval, Duration::from_secs(60));
        assert_eq!(cfg.check_interval, Duration::from_secs(30));
        assert_eq!(cfg.thresholds.disk, 90.0);
        assert_eq!(cfg.capture_max_packets, 1000);
        assert_eq!(cfg.history_limit, 1000);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = load_from(&[
            ("NETPULSE_HTTP_PORT", "8081"),
            ("NETPULSE_DB_PATH", "/tmp/x.db"),
            ("NETPULSE_SAMPLE_INTERVAL_SECS", "10"),
            ("NETPULSE_CPU_THRESHOLD", "65.5"),
            ("NETPULSE_LINK_CAPACITY_MBPS", "1000"),
        ]);
        assert_eq!(cfg.http_port, 8081);
        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert_eq!(cfg.sample_interval, Duration::from_secs(10));
        assert_eq!(cfg.thresholds.cpu, 65.5);
        assert_eq!(cfg.link_capacity_mbps, 1000.0);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = load_from(&[
            ("NETPULSE_HTTP_PORT", "eighty"),
            ("NETPULSE_CHECK_INTERVAL_SECS", "0"),
            ("NETPULSE_CAPTURE_MAX_PACKETS", "-3"),
        ]);
        assert_eq!(cfg.http_port, 5000);
        assert_eq!(cfg.check_interval, Duration::from_secs(30));
        assert_eq!(cfg.capture_max_packets, 1000);
    }
}
