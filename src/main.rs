//! netpulse - host and network monitoring service
//!
//! Samples host resources and interface counters, raises threshold alerts
//! and runs on-demand packet captures.

mod alerts;
mod capture;
mod config;
mod db;
mod scheduler;
mod telemetry;
mod web;

use capture::{CaptureManager, SystemBackend};
use config::MonitorConfig;
use db::Store;
use scheduler::Scheduler;
use telemetry::{shared_source, SystemCounters};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("netpulse=info".parse()?))
        .init();

    // Load configuration
    let cfg = MonitorConfig::load();
    tracing::info!("Starting netpulse on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let source = shared_source(SystemCounters::new()?);
    let capture = CaptureManager::new(store.clone(), Arc::new(SystemBackend), cfg.capture_limits());

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(store.clone(), source.clone(), &cfg));
    scheduler.start();

    // Start web server
    let stop_timeout = cfg.stop_timeout;
    let server = Server::new(cfg, store, source, capture, scheduler.clone());
    let served = server.start(shutdown_signal()).await;

    scheduler.stop(stop_timeout).await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
