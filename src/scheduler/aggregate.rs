//! Merging probe outcomes into per-user daily result shards.
//!
//! Each shard is written with read-merge-write guarded by the document
//! version. A competing writer between our read and our write makes the store
//! reject the write, and the merge is redone on a fresh read.

use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::config::MonitorConfig;
use crate::db::{Document, DocumentStore, MonitoredUrl, ResultShard, StoreError};
use crate::probe::PingOutcome;

/// Per-user aggregation error types.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("failed to fetch shard: {0}")]
    Fetch(StoreError),
    #[error("failed to decode shard: {0}")]
    Decode(StoreError),
    #[error("failed to persist shard: {0}")]
    Persist(StoreError),
    #[error("shard still contended after {0} attempts")]
    Contended(u32),
}

/// Result of fetching a shard, keeping "absent" apart from "store failed".
#[derive(Debug)]
pub enum ShardLookup {
    Found(Document),
    NotFound,
    StoreError(StoreError),
}

pub async fn fetch_shard(store: &dyn DocumentStore, collection: &str, shard_id: &str) -> ShardLookup {
    match store.get(collection, shard_id).await {
        Ok(Some(doc)) => ShardLookup::Found(doc),
        Ok(None) => ShardLookup::NotFound,
        Err(e) => ShardLookup::StoreError(e),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardWrite {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationFailure {
    pub user_id: String,
    pub shard_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSummary {
    pub shards_created: Vec<String>,
    pub shards_updated: Vec<String>,
    pub failures: Vec<AggregationFailure>,
}

/// Bounds on one user's shard write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLimits {
    /// Read-merge-write rounds before giving up.
    pub attempts: u32,
    /// Newest entries kept per URL series.
    pub history: usize,
}

impl ShardLimits {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            attempts: config.shard_write_attempts,
            history: config.max_series_history,
        }
    }
}

/// Partition `outcomes` by the owner recorded in `batch` and merge each
/// user's outcomes into their shard for `date`.
///
/// Users are processed concurrently; one user's failure never affects another.
pub async fn aggregate(
    store: &dyn DocumentStore,
    collection: &str,
    batch: &[MonitoredUrl],
    outcomes: &[PingOutcome],
    date: NaiveDate,
    limits: ShardLimits,
) -> AggregationSummary {
    let owners: HashMap<&str, &str> = batch
        .iter()
        .map(|u| (u.id.as_str(), u.user_id.as_str()))
        .collect();

    let mut by_user: BTreeMap<&str, Vec<&PingOutcome>> = BTreeMap::new();
    for outcome in outcomes {
        match owners.get(outcome.url_id.as_str()) {
            Some(user_id) => by_user.entry(*user_id).or_default().push(outcome),
            None => tracing::warn!(
                "Aggregator: outcome for {} has no owner in the batch, dropping",
                outcome.url_id
            ),
        }
    }

    let writes = by_user.into_iter().map(|(user_id, user_outcomes)| async move {
        let shard_id = ResultShard::shard_id(user_id, date);
        let result = write_user_shard(store, collection, user_id, date, &user_outcomes, limits).await;
        (user_id, shard_id, result)
    });

    let mut summary = AggregationSummary::default();
    for (user_id, shard_id, result) in join_all(writes).await {
        match result {
            Ok(ShardWrite::Created) => summary.shards_created.push(shard_id),
            Ok(ShardWrite::Updated) => summary.shards_updated.push(shard_id),
            Err(e) => {
                tracing::error!("Aggregator: failed to store results for user {}: {}", user_id, e);
                summary.failures.push(AggregationFailure {
                    user_id: user_id.to_string(),
                    shard_id,
                    error: e.to_string(),
                });
            }
        }
    }

    summary
}

/// Merge one user's outcomes into their shard, creating it on first write of the day.
pub async fn write_user_shard(
    store: &dyn DocumentStore,
    collection: &str,
    user_id: &str,
    date: NaiveDate,
    outcomes: &[&PingOutcome],
    limits: ShardLimits,
) -> Result<ShardWrite, AggregationError> {
    let shard_id = ResultShard::shard_id(user_id, date);

    let max_attempts = limits.attempts.max(1);
    for attempt in 1..=max_attempts {
        match fetch_shard(store, collection, &shard_id).await {
            ShardLookup::Found(doc) => {
                let mut shard = ResultShard::from_document(&doc).map_err(AggregationError::Decode)?;
                for outcome in outcomes {
                    shard.append(outcome, limits.history);
                }
                let fields = shard.to_fields().map_err(AggregationError::Persist)?;

                match store.update(collection, &shard_id, fields, Some(doc.version)).await {
                    Ok(_) => {
                        tracing::debug!(
                            "Aggregator: updated shard {} ({} URLs)",
                            shard_id,
                            shard.results.len()
                        );
                        return Ok(ShardWrite::Updated);
                    }
                    Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                        tracing::debug!(
                            "Aggregator: shard {} changed during merge (attempt {})",
                            shard_id,
                            attempt
                        );
                    }
                    Err(e) => return Err(AggregationError::Persist(e)),
                }
            }
            ShardLookup::NotFound => {
                let mut shard = ResultShard::new(user_id, date);
                for outcome in outcomes {
                    shard.append(outcome, limits.history);
                }
                let fields = shard.to_fields().map_err(AggregationError::Persist)?;

                match store.create(collection, &shard_id, fields).await {
                    Ok(_) => {
                        tracing::debug!(
                            "Aggregator: created shard {} ({} URLs)",
                            shard_id,
                            shard.results.len()
                        );
                        return Ok(ShardWrite::Created);
                    }
                    Err(StoreError::AlreadyExists { .. }) => {
                        tracing::debug!(
                            "Aggregator: shard {} created concurrently (attempt {})",
                            shard_id,
                            attempt
                        );
                    }
                    Err(e) => return Err(AggregationError::Persist(e)),
                }
            }
            ShardLookup::StoreError(e) => return Err(AggregationError::Fetch(e)),
        }
    }

    Err(AggregationError::Contended(max_attempts))
}
