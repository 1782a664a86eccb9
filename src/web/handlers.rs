//! HTTP request handlers.
//!
//! Handlers are thin: they resolve the subject, move blocking work off the
//! runtime and shape the JSON.

use super::AppState;
use crate::capture::{protocol_stats, CaptureError, CaptureRequest, ProtocolFilter};
use crate::db::{AlertStatus, DbError, Protocol};
use crate::telemetry::{run_speed_test, traffic_analytics, TelemetryError, SPEED_TEST_WINDOW};

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Header carrying the authenticated subject id, set by the upstream auth layer.
pub const SUBJECT_HEADER: &str = "x-subject-id";

/// Packet listings are capped regardless of the window.
const PACKET_LIST_LIMIT: usize = 500;
const ALERT_LIST_LIMIT: usize = 100;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("missing or invalid X-Subject-Id header")]
    MissingSubject,
    #[error("{0}")]
    BadRequest(String),
    #[error("background task failed: {0}")]
    Task(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Capture(CaptureError::CapabilityDenied { message, instructions }) => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": message,
                    "has_permission": false,
                    "instructions": instructions,
                })),
            )
                .into_response(),
            ApiError::Db(DbError::NotFound) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
            }
            ApiError::MissingSubject => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": ApiError::MissingSubject.to_string() })),
            )
                .into_response(),
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            other => {
                tracing::error!("Request failed: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": other.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

/// Run blocking work (SQLite, counter reads, capture) off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Task(e.to_string()))?
}

// ============================================================================
// Subject
// ============================================================================

/// The caller's subject id. Every subject seen is registered for threshold checks.
#[derive(Debug, Clone, Copy)]
pub struct Subject(pub i64);

impl FromRequestParts<AppState> for Subject {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(SUBJECT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or(ApiError::MissingSubject)?;

        let store = state.store.clone();
        blocking(move || Ok(store.register_subject(id)?)).await?;
        Ok(Subject(id))
    }
}

// ============================================================================
// Query parameters
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub hours: Option<i64>,
    #[serde(default)]
    pub days: Option<i64>,
}

impl WindowQuery {
    fn since_hours(&self, default: i64) -> Result<DateTime<Utc>, ApiError> {
        window_start("hours", self.hours, default, ChronoDuration::try_hours)
    }

    fn since_days(&self, default: i64) -> Result<DateTime<Utc>, ApiError> {
        window_start("days", self.days, default, ChronoDuration::try_days)
    }
}

/// Start of a look-back window of `amount` units. Non-positive amounts use
/// `default`; windows reaching past the representable range are rejected.
fn window_start(
    name: &str,
    amount: Option<i64>,
    default: i64,
    unit: fn(i64) -> Option<ChronoDuration>,
) -> Result<DateTime<Utc>, ApiError> {
    let amount = amount.filter(|a| *a > 0).unwrap_or(default);
    unit(amount)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .ok_or_else(|| ApiError::BadRequest(format!("{} out of range: {}", name, amount)))
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PacketsQuery {
    #[serde(default)]
    pub hours: Option<i64>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Stored protocol to filter a listing by. `all` and unknown names list everything.
fn listing_protocol(name: Option<&str>) -> Option<Protocol> {
    match ProtocolFilter::parse(name?) {
        ProtocolFilter::Tcp => Some(Protocol::Tcp),
        ProtocolFilter::Udp => Some(Protocol::Udp),
        ProtocolFilter::Icmp => Some(Protocol::Icmp),
        ProtocolFilter::Ip => Some(Protocol::Ip),
        ProtocolFilter::All => None,
    }
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "scheduler_running": state.scheduler.is_running(),
    }))
}

// ============================================================================
// API: Current readings
// ============================================================================

pub async fn handle_current_traffic(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let source = state.source.clone();
    let snapshot = blocking(move || Ok(source.lock().read()?)).await?;
    Ok(Json(json!({ "traffic": snapshot })))
}

pub async fn handle_current_system(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let source = state.source.clone();
    let sample = blocking(move || Ok(source.lock().read_resources()?)).await?;
    Ok(Json(json!({ "system": sample })))
}

/// Load since the previous call to this endpoint.
pub async fn handle_current_load(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let source = state.source.clone();
    let tracker = state.load_tracker.clone();
    let status = blocking(move || {
        let snapshot = source.lock().read()?;
        Ok(tracker.lock().observe(snapshot))
    })
    .await?;
    Ok(Json(json!(status)))
}

pub async fn handle_speed_test(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let source = state.source.clone();
    let result = blocking(move || Ok(run_speed_test(&source, SPEED_TEST_WINDOW)?)).await?;
    Ok(Json(json!({ "speed_test": result })))
}

// ============================================================================
// API: History
// ============================================================================

pub async fn handle_traffic_history(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, ApiError> {
    let since = query.since_hours(24)?;
    let limit = state.config.history_limit;
    let store = state.store.clone();
    let samples = blocking(move || Ok(store.get_traffic_history(since, limit)?)).await?;
    Ok(Json(json!({ "count": samples.len(), "samples": samples })))
}

pub async fn handle_system_history(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, ApiError> {
    let since = query.since_hours(24)?;
    let limit = state.config.history_limit;
    let store = state.store.clone();
    let samples = blocking(move || Ok(store.get_resource_history(since, limit)?)).await?;
    Ok(Json(json!({ "count": samples.len(), "samples": samples })))
}

pub async fn handle_traffic_analytics(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, ApiError> {
    let since = query.since_hours(24)?;
    let store = state.store.clone();
    let analytics = blocking(move || Ok(traffic_analytics(&store, since)?)).await?;
    Ok(Json(json!(analytics)))
}

// ============================================================================
// API: Alerts
// ============================================================================

pub async fn handle_get_alerts(
    State(state): State<AppState>,
    subject: Subject,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = AlertStatus::from_db(query.status.as_deref().unwrap_or("active"));
    let store = state.store.clone();
    let alerts = blocking(move || Ok(store.get_alerts(subject.0, status, ALERT_LIST_LIMIT)?)).await?;
    Ok(Json(json!({ "count": alerts.len(), "alerts": alerts })))
}

pub async fn handle_resolve_alert(
    State(state): State<AppState>,
    subject: Subject,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store.clone();
    let alert = blocking(move || Ok(store.resolve_alert(id, subject.0)?)).await?;
    tracing::info!("Alert {} resolved by subject {}", id, subject.0);
    Ok(Json(json!({ "message": "Alert resolved", "alert": alert })))
}

pub async fn handle_alert_stats(
    State(state): State<AppState>,
    subject: Subject,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, ApiError> {
    let since = query.since_days(7)?;
    let store = state.store.clone();
    let stats = blocking(move || Ok(store.get_alert_statistics(subject.0, since)?)).await?;
    Ok(Json(json!(stats)))
}

// ============================================================================
// API: Packet analysis
// ============================================================================

pub async fn handle_capability(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let capture = state.capture.clone();
    let capability = blocking(move || Ok(capture.check_capability())).await?;
    Ok(Json(json!(capability)))
}

pub async fn handle_capture(
    State(state): State<AppState>,
    subject: Subject,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<Value>, ApiError> {
    let capture = state.capture.clone();
    let outcome = blocking(move || Ok(capture.start_capture(subject.0, &request)?)).await?;
    Ok(Json(json!({
        "message": format!("Captured {} packets", outcome.count),
        "count": outcome.count,
        "cleared_previous": outcome.cleared_previous,
        "packets": outcome.packets,
    })))
}

/// Lifecycle state of the subject's most recent capture.
pub async fn handle_capture_state(State(state): State<AppState>, subject: Subject) -> Json<Value> {
    Json(json!(state.capture.state(subject.0)))
}

pub async fn handle_get_packets(
    State(state): State<AppState>,
    subject: Subject,
    Query(query): Query<PacketsQuery>,
) -> Result<Json<Value>, ApiError> {
    let since = window_start("hours", query.hours, 1, ChronoDuration::try_hours)?;
    let protocol = listing_protocol(query.protocol.as_deref());
    let store = state.store.clone();
    let packets =
        blocking(move || Ok(store.get_packets(subject.0, since, protocol, PACKET_LIST_LIMIT)?)).await?;
    Ok(Json(json!({ "count": packets.len(), "packets": packets })))
}

pub async fn handle_protocol_stats(
    State(state): State<AppState>,
    subject: Subject,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, ApiError> {
    let since = query.since_hours(24)?;
    let store = state.store.clone();
    let stats = blocking(move || Ok(protocol_stats(&store, subject.0, since)?)).await?;
    Ok(Json(json!(stats)))
}

pub async fn handle_protocols() -> impl IntoResponse {
    let protocols: Vec<Value> = ProtocolFilter::supported()
        .into_iter()
        .map(|(value, label)| json!({ "value": value, "label": label }))
        .collect();
    Json(json!({ "protocols": protocols }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureBackend, CaptureManager, PacketSource, SourceError};
    use crate::config::MonitorConfig;
    use crate::db::Store;
    use crate::scheduler::Scheduler;
    use crate::telemetry::shared_source;
    use crate::telemetry::testing::ScriptedCounters;
    use crate::web::Server;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    struct DeniedBackend;

    impl CaptureBackend for DeniedBackend {
        fn open(&self, _filter: ProtocolFilter) -> Result<Box<dyn PacketSource>, SourceError> {
            Err(SourceError::PermissionDenied("Operation not permitted".to_string()))
        }
    }

    fn server() -> (Server, Arc<Store>, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let cfg = MonitorConfig::default();
        let source = shared_source(ScriptedCounters::steady(1.0, 2.0, 3.0));
        let capture = CaptureManager::new(store.clone(), Arc::new(DeniedBackend), cfg.capture_limits());
        let scheduler = Arc::new(Scheduler::new(store.clone(), source.clone(), &cfg));
        (Server::new(cfg, store.clone(), source, capture, scheduler), store, tmp)
    }

    async fn send(server: &Server, request: Request<Body>) -> (StatusCode, Value) {
        let response = server.routes().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[test]
    fn test_listing_protocol() {
        assert_eq!(listing_protocol(Some("tcp")), Some(Protocol::Tcp));
        assert_eq!(listing_protocol(Some("ip")), Some(Protocol::Ip));
        assert_eq!(listing_protocol(Some("all")), None);
        assert_eq!(listing_protocol(Some("bogus")), None);
        assert_eq!(listing_protocol(None), None);
    }

    #[tokio::test]
    async fn test_health() {
        let (server, _store, _tmp) = server();
        let (status, body) = send(&server, Request::get("/api/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_subject_header_required_and_registered() {
        let (server, store, _tmp) = server();

        let (status, _) = send(&server, Request::get("/api/monitoring/alerts").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::get("/api/monitoring/alerts")
            .header(SUBJECT_HEADER, "42")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&server, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
        assert_eq!(store.get_subject_ids().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_resolve_unknown_alert_is_not_found() {
        let (server, _store, _tmp) = server();
        let request = Request::put("/api/monitoring/alerts/999/resolve")
            .header(SUBJECT_HEADER, "1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&server, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_capture_without_permission_is_forbidden() {
        let (server, _store, _tmp) = server();
        let request = Request::post("/api/analysis/capture")
            .header(SUBJECT_HEADER, "1")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"protocol":"tcp","count":5,"timeout":1}"#))
            .unwrap();
        let (status, body) = send(&server, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["has_permission"], false);
        assert!(!body["instructions"]["methods"].as_array().unwrap().is_empty());

        let request = Request::get("/api/analysis/capture/state")
            .header(SUBJECT_HEADER, "1")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&server, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "failed");
        assert_eq!(body["failure"], "capability");
    }

    #[test]
    fn test_window_start_defaults_and_bounds() {
        let default = window_start("hours", None, 24, ChronoDuration::try_hours).unwrap();
        let negative = window_start("hours", Some(-5), 24, ChronoDuration::try_hours).unwrap();
        let expected = Utc::now() - ChronoDuration::hours(24);
        assert!((expected - default).num_seconds().abs() < 5);
        assert!((expected - negative).num_seconds().abs() < 5);

        assert!(window_start("hours", Some(i64::MAX), 24, ChronoDuration::try_hours).is_err());
        assert!(window_start("days", Some(10_000_000_000), 7, ChronoDuration::try_days).is_err());
    }

    #[tokio::test]
    async fn test_oversized_window_is_rejected() {
        let (server, _store, _tmp) = server();

        let (status, body) = send(
            &server,
            Request::get("/api/monitoring/history?hours=10000000000").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "hours out of range: 10000000000");

        let request = Request::get("/api/monitoring/alerts/stats?days=10000000000")
            .header(SUBJECT_HEADER, "1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&server, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::get("/api/analysis/packets?hours=10000000000")
            .header(SUBJECT_HEADER, "1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&server, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wide_window_in_range_is_served() {
        let (server, _store, _tmp) = server();
        // About a century back.
        let (status, body) = send(
            &server,
            Request::get("/api/monitoring/system-history?hours=876000").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_load_needs_baseline() {
        let (server, _store, _tmp) = server();
        let (_, first) = send(&server, Request::get("/api/monitoring/load").body(Body::empty()).unwrap()).await;
        assert_eq!(first["status"], "insufficient_baseline");

        let (_, second) = send(&server, Request::get("/api/monitoring/load").body(Body::empty()).unwrap()).await;
        assert_eq!(second["status"], "ready");
    }
}
