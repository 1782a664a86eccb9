//! Web server module.

mod handlers;

use crate::capture::CaptureManager;
use crate::config::MonitorConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;
use crate::telemetry::{RateTracker, SharedCounterSource};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: MonitorConfig,
    pub store: Arc<Store>,
    pub source: SharedCounterSource,
    pub capture: CaptureManager,
    pub scheduler: Arc<Scheduler>,
    /// Rate stream behind the current-load endpoint, separate from the scheduler's.
    pub load_tracker: Arc<Mutex<RateTracker>>,
}

/// Web server for netpulse.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: MonitorConfig,
        store: Arc<Store>,
        source: SharedCounterSource,
        capture: CaptureManager,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let load_tracker = Arc::new(Mutex::new(RateTracker::new(config.link_capacity_mbps)));
        Self {
            state: AppState {
                config,
                store,
                source,
                capture,
                scheduler,
                load_tracker,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/api/health", get(handlers::handle_health))
            // Monitoring
            .route("/api/monitoring/traffic", get(handlers::handle_current_traffic))
            .route("/api/monitoring/system", get(handlers::handle_current_system))
            .route("/api/monitoring/load", get(handlers::handle_current_load))
            .route("/api/monitoring/speed-test", post(handlers::handle_speed_test))
            .route("/api/monitoring/history", get(handlers::handle_traffic_history))
            .route("/api/monitoring/system-history", get(handlers::handle_system_history))
            .route("/api/monitoring/alerts", get(handlers::handle_get_alerts))
            .route("/api/monitoring/alerts/stats", get(handlers::handle_alert_stats))
            .route("/api/monitoring/alerts/{id}/resolve", put(handlers::handle_resolve_alert))
            .route("/api/monitoring/traffic/analytics", get(handlers::handle_traffic_analytics))
            // Packet analysis
            .route("/api/analysis/capability", get(handlers::handle_capability))
            .route("/api/analysis/capture", post(handlers::handle_capture))
            .route("/api/analysis/capture/state", get(handlers::handle_capture_state))
            .route("/api/analysis/packets", get(handlers::handle_get_packets))
            .route("/api/analysis/stats", get(handlers::handle_protocol_stats))
            .route("/api/analysis/protocols", get(handlers::handle_protocols))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}
