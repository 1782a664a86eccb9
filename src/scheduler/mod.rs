//! Scheduler module: periodic sampling and threshold checks.
//!
//! One background task drives both actions. A failing tick is logged and
//! followed by a short backoff; it never ends the loop.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::alerts::AlertEngine;
use crate::config::MonitorConfig;
use crate::db::{DbError, Store};
use crate::telemetry::{LoadStatus, RateTracker, SharedCounterSource, TelemetryError};

#[derive(Error, Debug)]
pub enum TickError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("tick task panicked: {0}")]
    Join(String),
    #[error("threshold check failed for {failed} of {total} subjects")]
    Subjects { failed: usize, total: usize },
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    sample_interval: Duration,
    check_interval: Duration,
    error_backoff: Duration,
}

/// Store writes from ticks pass through this gate. Once closed, no write
/// starts; a write already holding the gate finishes before `close` returns.
#[derive(Clone, Default)]
struct WriteGate(Arc<Mutex<bool>>);

impl WriteGate {
    /// Run `write` unless the gate is closed. `Ok(None)` means it was skipped.
    fn write<T, E>(&self, write: impl FnOnce() -> Result<T, E>) -> Result<Option<T>, E> {
        let closed = self.0.lock();
        if *closed {
            return Ok(None);
        }
        write().map(Some)
    }

    fn close(&self) {
        *self.0.lock() = true;
    }
}

/// Everything a tick needs. Cloned into each blocking task.
#[derive(Clone)]
struct TickContext {
    store: Arc<Store>,
    source: SharedCounterSource,
    engine: AlertEngine,
    tracker: Arc<Mutex<RateTracker>>,
    gate: WriteGate,
}

impl TickContext {
    /// Persist one resource/traffic sample pair.
    fn sample(&self) -> Result<(), TickError> {
        let (resource, counters) = {
            let mut source = self.source.lock();
            (source.read_resources()?, source.read()?)
        };
        let written = self
            .gate
            .write(|| self.store.add_samples(&resource, &counters.to_traffic_sample()))?;
        if written.is_none() {
            tracing::debug!("Scheduler: stopped, dropping sample");
            return Ok(());
        }
        tracing::debug!(
            "Scheduler: sampled cpu={:.1}% mem={:.1}% disk={:.1}%",
            resource.cpu_percent,
            resource.memory_percent,
            resource.disk_percent
        );
        Ok(())
    }

    /// Evaluate thresholds for every known subject.
    fn check(&self) -> Result<(), TickError> {
        let (resource, counters) = {
            let mut source = self.source.lock();
            (source.read_resources()?, source.read()?)
        };

        let load = match self.tracker.lock().observe(counters) {
            LoadStatus::Ready(load) => Some(load),
            LoadStatus::InsufficientBaseline => None,
        };

        let subjects = self.store.get_subject_ids()?;
        evaluate_subjects(&subjects, |subject_id| {
            let created = self
                .gate
                .write(|| self.engine.evaluate(subject_id, &resource, load.as_ref()))?;
            Ok(created.map(|alerts| alerts.len()))
        })?;
        Ok(())
    }
}

/// Evaluate each subject independently. A failing subject is logged and the
/// rest still run; the tick fails afterwards if any subject did. `None` from
/// `evaluate` means the scheduler is stopping and ends the pass.
fn evaluate_subjects(
    subjects: &[i64],
    mut evaluate: impl FnMut(i64) -> Result<Option<usize>, DbError>,
) -> Result<usize, TickError> {
    let mut created = 0;
    let mut failed = 0;
    for &subject_id in subjects {
        match evaluate(subject_id) {
            Ok(Some(count)) => created += count,
            Ok(None) => {
                tracing::debug!("Scheduler: stopped, skipping remaining subjects");
                break;
            }
            Err(e) => {
                tracing::warn!("Scheduler: threshold check for subject {} failed: {}", subject_id, e);
                failed += 1;
            }
        }
    }

    if created > 0 {
        tracing::info!("Scheduler: raised {} alerts", created);
    }
    if failed > 0 {
        return Err(TickError::Subjects {
            failed,
            total: subjects.len(),
        });
    }
    Ok(created)
}

struct Running {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    gate: WriteGate,
}

/// Handle to the background loop. Owned by the caller; at most one loop runs.
pub struct Scheduler {
    ctx: TickContext,
    timing: Timing,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, source: SharedCounterSource, cfg: &MonitorConfig) -> Self {
        let engine = AlertEngine::new(store.clone(), cfg.thresholds);
        Self {
            ctx: TickContext {
                store,
                source,
                engine,
                tracker: Arc::new(Mutex::new(RateTracker::new(cfg.link_capacity_mbps))),
                gate: WriteGate::default(),
            },
            timing: Timing {
                sample_interval: cfg.sample_interval,
                check_interval: cfg.check_interval,
                error_backoff: cfg.error_backoff,
            },
            running: Mutex::new(None),
        }
    }

    /// Start the background loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let gate = WriteGate::default();
        let ctx = TickContext {
            gate: gate.clone(),
            ..self.ctx.clone()
        };
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_loop(ctx, self.timing, stop_rx));
        *running = Some(Running { stop_tx, handle, gate });

        tracing::info!(
            "Scheduler: started (sample every {:?}, check every {:?})",
            self.timing.sample_interval,
            self.timing.check_interval
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Signal the loop and wait up to `timeout` for the in-flight tick.
    /// Returns false if the scheduler was not running.
    ///
    /// No tick writes to the store once this returns, even if the tick
    /// itself is still blocked past the timeout.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let Some(Running {
            stop_tx,
            mut handle,
            gate,
        }) = self.running.lock().take()
        else {
            return false;
        };

        let _ = stop_tx.send(());
        let finished = tokio::time::timeout(timeout, &mut handle).await.is_ok();
        // Waits for at most one in-flight store write.
        gate.close();
        if finished {
            tracing::info!("Scheduler: stopped");
        } else {
            tracing::warn!("Scheduler: loop did not stop within {:?}, aborting", timeout);
            handle.abort();
        }
        true
    }
}

async fn run_loop(ctx: TickContext, timing: Timing, mut stop_rx: broadcast::Receiver<()>) {
    let mut sample = tokio::time::interval(timing.sample_interval);
    sample.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut check = tokio::time::interval(timing.check_interval);
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let (action, result) = tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            _ = sample.tick() => ("sample", run_blocking(ctx.clone(), TickContext::sample).await),
            _ = check.tick() => ("threshold check", run_blocking(ctx.clone(), TickContext::check).await),
        };

        if let Err(e) = result {
            tracing::error!("Scheduler: {} tick failed: {}", action, e);
            tokio::select! {
                biased;
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep(timing.error_backoff) => {}
            }
        }
    }
}

async fn run_blocking(ctx: TickContext, action: fn(&TickContext) -> Result<(), TickError>) -> Result<(), TickError> {
    tokio::task::spawn_blocking(move || action(&ctx))
        .await
        .map_err(|e| TickError::Join(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AlertStatus;
    use crate::telemetry::shared_source;
    use crate::telemetry::testing::ScriptedCounters;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::NamedTempFile;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            sample_interval: Duration::from_millis(40),
            check_interval: Duration::from_millis(40),
            error_backoff: Duration::from_millis(20),
            ..MonitorConfig::default()
        }
    }

    fn setup(counters: ScriptedCounters) -> (Scheduler, Arc<Store>, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let scheduler = Scheduler::new(store.clone(), shared_source(counters), &fast_config());
        (scheduler, store, tmp)
    }

    fn hour_ago() -> chrono::DateTime<Utc> {
        Utc::now() - ChronoDuration::hours(1)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (scheduler, _store, _tmp) = setup(ScriptedCounters::steady(1.0, 1.0, 1.0));

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        assert!(scheduler.stop(Duration::from_secs(2)).await);
        assert!(!scheduler.is_running());
        assert!(!scheduler.stop(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_samples_are_persisted() {
        let (scheduler, store, _tmp) = setup(ScriptedCounters::steady(12.0, 34.0, 56.0));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop(Duration::from_secs(2)).await;

        let resources = store.get_resource_history(hour_ago(), 100).unwrap();
        let traffic = store.get_traffic_history(hour_ago(), 100).unwrap();
        assert!(!resources.is_empty());
        assert_eq!(resources.len(), traffic.len());
        assert_eq!(resources[0].memory_percent, 34.0);
    }

    #[tokio::test]
    async fn test_failed_tick_does_not_stop_loop() {
        let mut counters = ScriptedCounters::steady(1.0, 1.0, 1.0);
        for _ in 0..2 {
            counters
                .resources
                .push_back(Err(TelemetryError::Unavailable("sandboxed".to_string())));
        }
        let (scheduler, store, _tmp) = setup(counters);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(scheduler.is_running());
        scheduler.stop(Duration::from_secs(2)).await;

        assert!(!store.get_resource_history(hour_ago(), 100).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_raises_one_alert_per_dimension() {
        let (scheduler, store, _tmp) = setup(ScriptedCounters::steady(95.0, 10.0, 10.0));
        store.register_subject(7).unwrap();

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop(Duration::from_secs(2)).await;

        let active = store.get_alerts(7, AlertStatus::Active, 100).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].message, "CPU usage is at 95.0%");
    }

    #[test]
    fn test_closed_gate_skips_writes() {
        let gate = WriteGate::default();
        assert_eq!(gate.write(|| Ok::<_, DbError>(1)).unwrap(), Some(1));

        gate.close();
        let mut ran = false;
        let skipped = gate
            .write(|| {
                ran = true;
                Ok::<_, DbError>(2)
            })
            .unwrap();
        assert_eq!(skipped, None);
        assert!(!ran);
    }

    #[test]
    fn test_failing_subject_does_not_skip_others() {
        let mut seen = Vec::new();
        let result = evaluate_subjects(&[1, 2, 3], |subject_id| {
            seen.push(subject_id);
            if subject_id == 2 {
                Err(DbError::NotFound)
            } else {
                Ok(Some(1))
            }
        });

        assert_eq!(seen, vec![1, 2, 3]);
        match result {
            Err(TickError::Subjects { failed, total }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_stopping_ends_subject_pass() {
        let mut seen = Vec::new();
        let created = evaluate_subjects(&[1, 2, 3], |subject_id| {
            seen.push(subject_id);
            Ok(if subject_id == 1 { Some(2) } else { None })
        })
        .unwrap();

        assert_eq!(created, 2);
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_timed_out_stop_drops_in_flight_sample() {
        let mut counters = ScriptedCounters::steady(1.0, 1.0, 1.0);
        counters.read_delay = Duration::from_millis(600);
        let (scheduler, store, _tmp) = setup(counters);

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.stop(Duration::from_millis(50)).await);
        assert!(!scheduler.is_running());

        // Outlast the blocked read so the tick reaches its write.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(store.get_resource_history(hour_ago(), 100).unwrap().is_empty());
        assert!(store.get_traffic_history(hour_ago(), 100).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop_writes_again() {
        let (scheduler, store, _tmp) = setup(ScriptedCounters::steady(1.0, 1.0, 1.0));

        scheduler.start();
        scheduler.stop(Duration::from_secs(2)).await;
        let before = store.get_resource_history(hour_ago(), 1000).unwrap().len();

        assert!(scheduler.start());
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.stop(Duration::from_secs(2)).await;
        assert!(store.get_resource_history(hour_ago(), 1000).unwrap().len() > before);
    }

    #[tokio::test]
    async fn test_no_writes_after_stop() {
        let (scheduler, store, _tmp) = setup(ScriptedCounters::steady(1.0, 1.0, 1.0));

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop(Duration::from_secs(2)).await;

        let before = store.get_resource_history(hour_ago(), 1000).unwrap().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after = store.get_resource_history(hour_ago(), 1000).unwrap().len();
        assert_eq!(before, after);
    }
}
