//! Capture sessions: capability probing and bounded capture runs.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{normalize, CaptureBackend, CaptureCapability, CaptureError, Platform, ProtocolFilter, SourceError};
use crate::db::{PacketRecord, Store};

/// Longest single wait on the source, so deadlines are honoured promptly.
const POLL_SLICE: Duration = Duration::from_millis(250);

/// How long the capability probe waits for a frame.
const PROBE_WAIT: Duration = Duration::from_secs(1);

/// Upper bounds (and defaults) for capture requests.
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub max_packets: usize,
    pub timeout: Duration,
}

/// A capture request. Missing fields fall back to [`CaptureLimits`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureRequest {
    #[serde(default)]
    pub protocol: ProtocolFilter,
    pub count: Option<usize>,
    /// Seconds.
    pub timeout: Option<u64>,
    #[serde(default)]
    pub clear_previous: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub packets: Vec<PacketRecord>,
    pub count: usize,
    pub cleared_previous: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Capability,
    Unavailable,
    Runtime,
}

/// Lifecycle of an owner's most recent capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "failure", rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Capturing,
    Completed,
    Failed(FailureKind),
}

impl From<&CaptureError> for FailureKind {
    fn from(e: &CaptureError) -> Self {
        match e {
            CaptureError::CapabilityDenied { .. } => FailureKind::Capability,
            CaptureError::Unavailable(_) => FailureKind::Unavailable,
            CaptureError::Runtime(_) => FailureKind::Runtime,
        }
    }
}

/// Runs capture sessions against a backend and persists their results.
///
/// All methods block; call them from `spawn_blocking` in async contexts.
#[derive(Clone)]
pub struct CaptureManager {
    store: Arc<Store>,
    backend: Arc<dyn CaptureBackend>,
    platform: Platform,
    limits: CaptureLimits,
    states: Arc<Mutex<HashMap<i64, CaptureState>>>,
}

impl CaptureManager {
    pub fn new(store: Arc<Store>, backend: Arc<dyn CaptureBackend>, limits: CaptureLimits) -> Self {
        Self {
            store,
            backend,
            platform: Platform::current(),
            limits,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// State of the owner's latest run; `Idle` if it never captured.
    pub fn state(&self, owner_id: i64) -> CaptureState {
        self.states.lock().get(&owner_id).copied().unwrap_or(CaptureState::Idle)
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Probe whether a capture can be opened and read. Never fails.
    pub fn check_capability(&self) -> CaptureCapability {
        let probe = self
            .backend
            .open(ProtocolFilter::All)
            .and_then(|mut source| source.next_frame(PROBE_WAIT).map(|_| ()));

        let capability = match probe {
            Ok(()) => CaptureCapability {
                has_permission: true,
                message: "Packet capture is available".to_string(),
                instructions: None,
            },
            Err(SourceError::PermissionDenied(e)) => CaptureCapability {
                has_permission: false,
                message: format!("Packet capture requires elevated privileges: {}", e),
                instructions: Some(self.platform.instructions()),
            },
            Err(e) => CaptureCapability {
                has_permission: false,
                message: format!("Packet capture is not available: {}", e),
                instructions: Some(self.platform.instructions()),
            },
        };

        tracing::info!(
            "Capture: capability probe on {}: has_permission={}",
            self.platform.name(),
            capability.has_permission
        );
        capability
    }

    /// Capture until `count` packets are kept or the timeout elapses,
    /// whichever comes first, then commit the run in one transaction.
    ///
    /// A failed run commits nothing, including the clearing of earlier packets.
    pub fn start_capture(&self, owner_id: i64, request: &CaptureRequest) -> Result<CaptureOutcome, CaptureError> {
        let max_count = request
            .count
            .unwrap_or(self.limits.max_packets)
            .clamp(1, self.limits.max_packets.max(1));
        let timeout = request
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.limits.timeout)
            .min(self.limits.timeout);

        self.transition(owner_id, CaptureState::Capturing);
        tracing::info!(
            "Capture: owner {} filter={} count={} timeout={:?}",
            owner_id,
            request.protocol.as_str(),
            max_count,
            timeout
        );

        match self.run(owner_id, request, max_count, timeout) {
            Ok(outcome) => {
                self.transition(owner_id, CaptureState::Completed);
                Ok(outcome)
            }
            Err(e) => {
                self.transition(owner_id, CaptureState::Failed(FailureKind::from(&e)));
                tracing::warn!("Capture: owner {} failed: {}", owner_id, e);
                Err(e)
            }
        }
    }

    fn transition(&self, owner_id: i64, next: CaptureState) {
        let previous = self.states.lock().insert(owner_id, next).unwrap_or(CaptureState::Idle);
        tracing::debug!("Capture: owner {} {:?} -> {:?}", owner_id, previous, next);
    }

    fn run(
        &self,
        owner_id: i64,
        request: &CaptureRequest,
        max_count: usize,
        timeout: Duration,
    ) -> Result<CaptureOutcome, CaptureError> {
        let mut source = self
            .backend
            .open(request.protocol)
            .map_err(|e| CaptureError::from_source(e, self.platform))?;

        let deadline = Instant::now() + timeout;
        let mut buffer: Vec<PacketRecord> = Vec::with_capacity(max_count.min(1024));

        while buffer.len() < max_count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let frame = source
                .next_frame(remaining.min(POLL_SLICE))
                .map_err(|e| CaptureError::from_source(e, self.platform))?;

            if let Some(record) = frame.and_then(|f| normalize(&f, owner_id)) {
                if request.protocol.matches(record.protocol) {
                    buffer.push(record);
                }
            }
        }

        let cleared = self
            .store
            .commit_capture(owner_id, request.clear_previous, &mut buffer)
            .map_err(|e| CaptureError::Runtime(e.to_string()))?;

        if request.clear_previous {
            tracing::info!("Capture: cleared {} earlier packets for owner {}", cleared, owner_id);
        }

        Ok(CaptureOutcome {
            count: buffer.len(),
            packets: buffer,
            cleared_previous: request.clear_previous,
        })
    }
}
