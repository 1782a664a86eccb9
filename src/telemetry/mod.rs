//! Telemetry module: host counters and the rates derived from them.

mod analytics;
mod counters;
mod rate;

pub use analytics::*;
pub use counters::*;
pub use rate::*;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Telemetry error types.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("counters unavailable: {0}")]
    Unavailable(String),
}

/// A counter source shared between the scheduler and request handlers.
pub type SharedCounterSource = Arc<Mutex<Box<dyn CounterSource>>>;

pub fn shared_source<S: CounterSource + 'static>(source: S) -> SharedCounterSource {
    Arc::new(Mutex::new(Box::new(source)))
}

/// Measurement window used by the speed test.
pub const SPEED_TEST_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedTestResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub measurement_secs: f64,
}

/// Measure throughput over `window` from counter deltas. Blocks for `window`.
///
/// The source lock is only held for the two reads.
pub fn run_speed_test(source: &SharedCounterSource, window: Duration) -> Result<SpeedTestResult, TelemetryError> {
    let start = source.lock().read()?;
    std::thread::sleep(window);
    let end = source.lock().read()?;

    let secs = window.as_secs_f64();
    let load = compute_load(&start, &end, secs, 0.0);

    Ok(SpeedTestResult {
        download_mbps: to_mbps(load.bytes_recv_per_sec),
        upload_mbps: to_mbps(load.bytes_sent_per_sec),
        measurement_secs: secs,
    })
}

fn to_mbps(bytes_per_sec: f64) -> f64 {
    (bytes_per_sec * 8.0 / 10_000.0).round() / 100.0
}
