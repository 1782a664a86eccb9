//! Threshold alert engine.
//!
//! Compares a resource sample (and optionally network load) against
//! per-dimension thresholds and raises at most one active alert per
//! subject and dimension. Alerts are never resolved here.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::db::{Alert, AlertSeverity, AlertType, DbError, NewAlert, ResourceSample, Store};
use crate::telemetry::LoadMetrics;

/// Percentages above which an alert is raised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            memory: 80.0,
            disk: 90.0,
            network: 90.0,
        }
    }
}

/// Candidate alerts for every dimension strictly above its threshold.
pub fn violations(sample: &ResourceSample, load: Option<&LoadMetrics>, thresholds: &Thresholds) -> Vec<NewAlert> {
    let mut candidates = Vec::new();

    if sample.cpu_percent > thresholds.cpu {
        candidates.push(warning(AlertType::Cpu, format!("CPU usage is at {:.1}%", sample.cpu_percent)));
    }
    if sample.memory_percent > thresholds.memory {
        candidates.push(warning(
            AlertType::Memory,
            format!("Memory usage is at {:.1}%", sample.memory_percent),
        ));
    }
    if sample.disk_percent > thresholds.disk {
        candidates.push(warning(AlertType::Disk, format!("Disk usage is at {:.1}%", sample.disk_percent)));
    }
    if let Some(load) = load {
        if load.total_util_pct > thresholds.network {
            candidates.push(warning(
                AlertType::Network,
                format!("Network utilization is at {:.1}%", load.total_util_pct),
            ));
        }
    }

    candidates
}

fn warning(alert_type: AlertType, message: String) -> NewAlert {
    NewAlert {
        alert_type,
        message,
        severity: AlertSeverity::Warning,
        device_id: None,
    }
}

/// Writes threshold alerts through the store's active-alert uniqueness guard.
#[derive(Clone)]
pub struct AlertEngine {
    store: Arc<Store>,
    thresholds: Thresholds,
}

impl AlertEngine {
    pub fn new(store: Arc<Store>, thresholds: Thresholds) -> Self {
        Self { store, thresholds }
    }

    /// Evaluate one sample for `subject_id` and return the alerts newly created.
    ///
    /// A dimension that already has an active alert produces nothing, so
    /// calling this repeatedly during one violation is a no-op after the first.
    pub fn evaluate(
        &self,
        subject_id: i64,
        sample: &ResourceSample,
        load: Option<&LoadMetrics>,
    ) -> Result<Vec<Alert>, DbError> {
        let candidates = violations(sample, load, &self.thresholds);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let created = self.store.insert_alerts_if_absent(subject_id, &candidates, Utc::now())?;
        for alert in &created {
            tracing::warn!("Alert for subject {}: {}", subject_id, alert.message);
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AlertStatus;
    use crate::telemetry::testing::resource;
    use tempfile::NamedTempFile;
    use tokio_test::assert_ok;

    fn engine() -> (AlertEngine, Arc<Store>, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        (AlertEngine::new(store.clone(), Thresholds::default()), store, tmp)
    }

    fn load(total_util_pct: f64) -> LoadMetrics {
        LoadMetrics {
            bytes_sent_per_sec: 0.0,
            bytes_recv_per_sec: 0.0,
            packets_sent_per_sec: 0.0,
            packets_recv_per_sec: 0.0,
            upload_util_pct: 0.0,
            download_util_pct: 0.0,
            total_util_pct,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_violations_are_strictly_greater() {
        let thresholds = Thresholds::default();
        assert!(violations(&resource(80.0, 80.0, 90.0), None, &thresholds).is_empty());

        let found = violations(&resource(80.1, 10.0, 95.0), None, &thresholds);
        let types: Vec<AlertType> = found.iter().map(|c| c.alert_type).collect();
        assert_eq!(types, vec![AlertType::Cpu, AlertType::Disk]);
        assert_eq!(found[0].message, "CPU usage is at 80.1%");
        assert!(found.iter().all(|c| c.severity == AlertSeverity::Warning));
    }

    #[test]
    fn test_network_needs_load() {
        let thresholds = Thresholds::default();
        let sample = resource(0.0, 0.0, 0.0);
        assert!(violations(&sample, None, &thresholds).is_empty());
        assert!(violations(&sample, Some(&load(90.0)), &thresholds).is_empty());

        let found = violations(&sample, Some(&load(97.3)), &thresholds);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].alert_type, AlertType::Network);
        assert_eq!(found[0].message, "Network utilization is at 97.3%");
    }

    #[test]
    fn test_repeated_evaluation_creates_one_alert() {
        let (engine, store, _tmp) = engine();
        let sample = resource(95.0, 10.0, 10.0);

        let first = assert_ok!(engine.evaluate(1, &sample, None));
        assert_eq!(first.len(), 1);
        for _ in 0..5 {
            assert!(assert_ok!(engine.evaluate(1, &sample, None)).is_empty());
        }

        let active = store.get_alerts(1, AlertStatus::Active, 100).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_type, AlertType::Cpu);
    }

    #[test]
    fn test_resolved_alert_allows_new_one() {
        let (engine, store, _tmp) = engine();
        let sample = resource(10.0, 99.0, 10.0);

        let first = engine.evaluate(1, &sample, None).unwrap();
        let resolved = store.resolve_alert(first[0].id, 1).unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let second = engine.evaluate(1, &sample, None).unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].id, first[0].id);
        assert_eq!(store.get_alerts(1, AlertStatus::Active, 100).unwrap().len(), 1);
    }

    #[test]
    fn test_subjects_are_independent() {
        let (engine, _store, _tmp) = engine();
        let sample = resource(95.0, 10.0, 10.0);

        assert_eq!(engine.evaluate(1, &sample, None).unwrap().len(), 1);
        assert_eq!(engine.evaluate(2, &sample, None).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_evaluation_keeps_one_active_alert() {
        let (engine, store, _tmp) = engine();
        let sample = resource(95.0, 95.0, 95.0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let sample = sample.clone();
                std::thread::spawn(move || engine.evaluate(1, &sample, None).unwrap().len())
            })
            .collect();
        let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(created, 3);
        assert_eq!(store.get_alerts(1, AlertStatus::Active, 100).unwrap().len(), 3);
    }
}
