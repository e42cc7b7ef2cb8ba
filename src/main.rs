//! pingshard - sharded URL uptime monitor.
//!
//! Each node ticks the shards it owns: due URLs are probed concurrently,
//! results are merged into per-user daily shards and every URL is rescheduled.

mod config;
mod db;
mod probe;
mod scheduler;
mod web;

#[cfg(test)]
mod testutil;

use config::ServerConfig;
use db::SqliteStore;
use scheduler::{Monitor, Scheduler};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingshard=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting pingshard node {} on port {}...", cfg.node_id, cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(SqliteStore::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let monitor = Arc::new(Monitor::new(Arc::new(cfg.monitor.clone()), store)?);

    let scheduler = Arc::new(Scheduler::new(monitor.clone(), &cfg.node_id, cfg.tick_interval));
    scheduler.start(&cfg.shard_keys).await;

    let server = Server::new(cfg, monitor, scheduler.clone());
    server.start().await?;

    scheduler.stop().await;
    tracing::info!("pingshard stopped");

    Ok(())
}
