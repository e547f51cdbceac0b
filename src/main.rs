//! streamwatch - Stream Monitoring Application
//!
//! Probes groups of HLS, HDS, HTTP and Widevine streams, keeps their check
//! history and reports long-lasting failures.

mod analyzer;
mod config;
mod db;
mod logging;
mod model;
mod probe;
mod scheduler;
mod sources;
mod stats;
mod web;

#[cfg(test)]
mod test_support;

use analyzer::ProblemAnalyzer;
use config::{MonitorConfig, ServerConfig};
use db::Store;
use logging::EventLog;
use scheduler::Scheduler;
use stats::StatKeeper;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("streamwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting streamwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let monitor = Arc::new(MonitorConfig::load(&cfg.config_path).await?);
    let total: usize = monitor.groups.iter().map(|g| g.streams.len()).sum();
    tracing::info!("Loaded {} groups with {} streams from {}", monitor.groups.len(), total, cfg.config_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    let stats = StatKeeper::spawn(store, monitor.expire_duration);
    let events = EventLog::spawn();

    // Start probing
    let scheduler = Arc::new(Scheduler::start(monitor.clone(), stats.clone(), events)?);
    ProblemAnalyzer::new(monitor, stats.clone()).spawn();

    // Start web server
    let server = Server::new(cfg, scheduler, stats);
    server.start().await?;

    Ok(())
}
