//! Scheduler module: the tick pipeline and the loop that drives it.
//!
//! A tick selects the due URLs of one node/shard, probes them all, then
//! merges the outcomes into result shards and writes back URL state.

mod aggregate;
mod dispatch;
mod select;
mod update;

pub use aggregate::*;
pub use dispatch::*;
pub use select::*;
pub use update::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::MonitorConfig;
use crate::db::{timefmt, DocumentStore, MonitoredUrl, StoreError, MAX_SHARD_KEY};
use crate::probe::{PingOutcome, ProbeError, Prober};

/// Errors that abort a whole tick.
#[derive(Error, Debug)]
pub enum TickError {
    #[error("invalid shard key {0}, expected 0-{max}", max = MAX_SHARD_KEY)]
    InvalidShard(u8),
    #[error("failed to select due URLs: {0}")]
    Selection(#[source] StoreError),
}

/// Errors of the single-URL probe.
#[derive(Error, Debug)]
pub enum PingError {
    #[error("{0}")]
    MalformedInput(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Everything that happened during one tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub node_id: String,
    pub shard_key: u8,
    #[serde(with = "timefmt")]
    pub started_at: DateTime<Utc>,
    pub selected: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aggregation: AggregationSummary,
    pub updates: UpdateSummary,
    pub duration_ms: u64,
}

/// Result of a single on-demand probe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReport {
    pub outcome: PingOutcome,
    pub log: String,
    #[serde(with = "timefmt")]
    pub next_ping_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardWrite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_error: Option<String>,
}

/// Runs ticks and on-demand probes against one store.
pub struct Monitor {
    config: Arc<MonitorConfig>,
    store: Arc<dyn DocumentStore>,
    prober: Prober,
}

impl Monitor {
    pub fn new(config: Arc<MonitorConfig>, store: Arc<dyn DocumentStore>) -> Result<Self, ProbeError> {
        let prober = Prober::new(&config)?;
        Ok(Self {
            config,
            store,
            prober,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run one tick for `node_id`/`shard_key` at the current time.
    pub async fn tick(&self, node_id: &str, shard_key: u8) -> Result<TickReport, TickError> {
        self.tick_at(node_id, shard_key, timefmt::now()).await
    }

    /// Run one tick treating `now` as the current time.
    pub async fn tick_at(
        &self,
        node_id: &str,
        shard_key: u8,
        now: DateTime<Utc>,
    ) -> Result<TickReport, TickError> {
        if shard_key > MAX_SHARD_KEY {
            return Err(TickError::InvalidShard(shard_key));
        }
        let started = Instant::now();
        let cfg = &self.config;

        let selection = select_due(self.store.as_ref(), cfg, node_id, shard_key, now)
            .await
            .map_err(TickError::Selection)?;

        let mut report = TickReport {
            node_id: node_id.to_string(),
            shard_key,
            started_at: now,
            selected: selection.urls.len(),
            skipped: selection.skipped,
            succeeded: 0,
            failed: 0,
            aggregation: AggregationSummary::default(),
            updates: UpdateSummary::default(),
            duration_ms: 0,
        };

        if selection.urls.is_empty() {
            tracing::debug!("Tick {}/{}: no URLs due", node_id, shard_key);
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let urls = selection.urls;
        let outcomes = dispatch(&self.prober, &urls, cfg.scheduled_success, cfg.max_concurrency).await;
        report.succeeded = outcomes.iter().filter(|o| o.success).count();
        report.failed = outcomes.len() - report.succeeded;

        let planned = plan_updates(&urls, &outcomes, cfg.default_ping_interval, None);
        let (aggregation, updates) = tokio::join!(
            aggregate(
                self.store.as_ref(),
                &cfg.results_collection,
                &urls,
                &outcomes,
                now.date_naive(),
                ShardLimits::from_config(cfg),
            ),
            apply_updates(
                self.store.as_ref(),
                &cfg.urls_collection,
                &planned,
                cfg.update_wave_size,
            ),
        );
        report.aggregation = aggregation;
        report.updates = updates;
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            "Tick {}/{}: probed {} URLs ({} ok, {} failed), {} shard failures, {} failed update waves in {}ms",
            node_id,
            shard_key,
            report.selected,
            report.succeeded,
            report.failed,
            report.aggregation.failures.len(),
            report.updates.failed_waves.len(),
            report.duration_ms
        );

        Ok(report)
    }

    /// Probe a single URL on demand, record its log line and history.
    pub async fn ping_url(&self, url_id: &str) -> Result<PingReport, PingError> {
        let url_id = url_id.trim();
        if url_id.is_empty() {
            return Err(PingError::MalformedInput("urlId is required".to_string()));
        }

        let cfg = &self.config;
        let doc = self
            .store
            .get(&cfg.urls_collection, url_id)
            .await?
            .ok_or_else(|| PingError::MalformedInput(format!("URL {} not found", url_id)))?;
        let url = MonitoredUrl::from_document(&doc)
            .map_err(|e| PingError::MalformedInput(format!("URL {} is malformed: {}", url_id, e)))?;
        if !url.is_enabled {
            return Err(PingError::MalformedInput(format!("URL {} is disabled", url_id)));
        }

        let outcome = self.prober.probe(&url.id, &url.url, cfg.on_demand_success).await;
        let batch = [url];
        let planned = plan_updates(
            &batch,
            std::slice::from_ref(&outcome),
            cfg.default_ping_interval,
            Some(cfg.max_log_entries),
        );

        let mut next_ping_time = outcome.timestamp;
        for (id, update) in &planned {
            next_ping_time = update.next_ping_time;
            self.store
                .update(&cfg.urls_collection, id, update.to_fields()?, None)
                .await?;
        }

        let (shard, shard_error) = match write_user_shard(
            self.store.as_ref(),
            &cfg.results_collection,
            &batch[0].user_id,
            outcome.timestamp.date_naive(),
            &[&outcome],
            ShardLimits::from_config(cfg),
        )
        .await
        {
            Ok(write) => (Some(write), None),
            Err(e) => {
                tracing::error!("Ping {}: failed to record result: {}", url_id, e);
                (None, Some(e.to_string()))
            }
        };

        tracing::info!("Ping {}: {}", url_id, outcome.log_message());

        Ok(PingReport {
            log: outcome.log_message(),
            outcome,
            next_ping_time,
            shard,
            shard_error,
        })
    }
}

/// The background loop running ticks for every shard this node owns.
pub struct Scheduler {
    monitor: Arc<Monitor>,
    node_id: String,
    interval: std::time::Duration,
    stop_chans: Arc<RwLock<HashMap<u8, tokio::sync::broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(monitor: Arc<Monitor>, node_id: &str, interval: std::time::Duration) -> Self {
        Self {
            monitor,
            node_id: node_id.to_string(),
            interval,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start ticking each of `shard_keys`.
    pub async fn start(&self, shard_keys: &[u8]) {
        tracing::info!(
            "Scheduler: node {} ticking shards {:?} every {:?}",
            self.node_id,
            shard_keys,
            self.interval
        );
        for &shard_key in shard_keys {
            self.add_shard(shard_key).await;
        }
    }

    /// Start ticking one shard; a shard already running is left alone.
    pub async fn add_shard(&self, shard_key: u8) {
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&shard_key) {
            return; // Already running
        }

        // Subscribe before spawning: a stop sent before the task runs must still arrive.
        let (stop_tx, stop_rx) = tokio::sync::broadcast::channel(1);
        stop_chans.insert(shard_key, stop_tx);
        drop(stop_chans);

        let monitor = self.monitor.clone();
        let node_id = self.node_id.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            run_tick_loop(monitor, node_id, shard_key, interval, stop_rx).await;
            tracing::debug!("Scheduler: loop for shard {} exited", shard_key);
        });
    }

    /// Stop every shard loop. A tick in flight runs to completion.
    pub async fn stop(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (shard_key, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: stopped shard {}", shard_key);
        }
    }

    pub async fn running_shards(&self) -> Vec<u8> {
        let mut keys: Vec<u8> = self.stop_chans.read().await.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

/// Tick one shard on a fixed interval.
///
/// The tick is awaited inside the loop, so ticks of one shard never overlap;
/// intervals missed while a tick runs are skipped.
async fn run_tick_loop(
    monitor: Arc<Monitor>,
    node_id: String,
    shard_key: u8,
    interval: std::time::Duration,
    mut stop_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.recv() => {
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = monitor.tick(&node_id, shard_key).await {
                    tracing::error!("Scheduler: tick {}/{} failed: {}", node_id, shard_key, e);
                }
            }
        }
    }
}
