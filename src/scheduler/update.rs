//! Persisting per-URL scheduling state after a tick.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;

use crate::db::{DocumentStore, MonitoredUrl, UrlUpdate};
use crate::probe::PingOutcome;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUpdate {
    pub url_id: String,
    pub error: String,
}

/// A wave in which at least one URL update failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveFailure {
    pub wave: usize,
    pub failed: Vec<FailedUpdate>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSummary {
    pub updated: usize,
    pub waves: usize,
    pub failed_waves: Vec<WaveFailure>,
}

/// Compute one update per probed URL, consolidated by URL id (last outcome wins).
///
/// `log_cap` appends each outcome's log line to the URL's log ring.
pub fn plan_updates(
    batch: &[MonitoredUrl],
    outcomes: &[PingOutcome],
    default_interval: u32,
    log_cap: Option<usize>,
) -> Vec<(String, UrlUpdate)> {
    let urls: HashMap<&str, &MonitoredUrl> = batch.iter().map(|u| (u.id.as_str(), u)).collect();

    let mut planned: Vec<(String, UrlUpdate)> = Vec::with_capacity(outcomes.len());
    let mut index: HashMap<&str, usize> = HashMap::new();

    for outcome in outcomes {
        let Some(url) = urls.get(outcome.url_id.as_str()) else {
            tracing::warn!("Updater: outcome for unknown URL {}, skipping", outcome.url_id);
            continue;
        };
        let update = UrlUpdate::from_outcome(url, outcome, default_interval, log_cap);
        match index.get(url.id.as_str()) {
            Some(&i) => planned[i].1 = update,
            None => {
                index.insert(url.id.as_str(), planned.len());
                planned.push((url.id.clone(), update));
            }
        }
    }

    planned
}

/// Write `updates` in waves of `wave_size` concurrent partial updates.
///
/// Each wave completes before the next starts. Failures are collected per
/// wave and never stop later waves.
pub async fn apply_updates(
    store: &dyn DocumentStore,
    collection: &str,
    updates: &[(String, UrlUpdate)],
    wave_size: usize,
) -> UpdateSummary {
    let mut summary = UpdateSummary::default();

    for (wave, chunk) in updates.chunks(wave_size.max(1)).enumerate() {
        summary.waves += 1;

        let writes = chunk.iter().map(|(url_id, update)| async move {
            let result = match update.to_fields() {
                Ok(fields) => store.update(collection, url_id, fields, None).await.map(|_| ()),
                Err(e) => Err(e),
            };
            (url_id, result)
        });

        let mut failed = Vec::new();
        for (url_id, result) in join_all(writes).await {
            match result {
                Ok(()) => summary.updated += 1,
                Err(e) => failed.push(FailedUpdate {
                    url_id: url_id.clone(),
                    error: e.to_string(),
                }),
            }
        }

        if !failed.is_empty() {
            tracing::error!(
                "Updater: wave {} had {} failed URL updates (first: {} - {})",
                wave,
                failed.len(),
                failed[0].url_id,
                failed[0].error
            );
            summary.failed_waves.push(WaveFailure { wave, failed });
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{timefmt, PingStatus};
    use crate::probe::SuccessRange;
    use crate::testutil::{insert_url, load_url, sample_url, temp_store, FlakyStore};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::Ordering;

    const URLS: &str = "urls";

    #[test]
    fn test_plan_consolidates_by_url_id() {
        let now = timefmt::now();
        let batch = vec![sample_url("a", "u", "a.example", now)];
        let outcomes = vec![
            PingOutcome::response("a", 200, SuccessRange::Below400, 5, now),
            PingOutcome::response("a", 500, SuccessRange::Below400, 9, now + ChronoDuration::seconds(1)),
            PingOutcome::response("ghost", 200, SuccessRange::Below400, 5, now),
        ];

        let planned = plan_updates(&batch, &outcomes, 15, None);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].0, "a");
        assert_eq!(planned[0].1.last_ping_status_code, 500);
    }

    #[test]
    fn test_next_ping_time_independent_per_url() {
        let now = timefmt::now();
        let mut fast = sample_url("fast", "u", "f.example", now);
        fast.ping_interval = Some(1);
        let mut slow = sample_url("slow", "u", "s.example", now);
        slow.ping_interval = Some(60);
        let mut unset = sample_url("unset", "u", "u.example", now);
        unset.ping_interval = None;

        let outcomes: Vec<_> = ["fast", "slow", "unset"]
            .iter()
            .map(|id| PingOutcome::response(id, 200, SuccessRange::Below400, 5, now))
            .collect();
        let planned = plan_updates(&[fast, slow, unset], &outcomes, 15, None);

        let next = |id: &str| planned.iter().find(|(u, _)| u == id).unwrap().1.next_ping_time;
        assert_eq!(next("fast"), now + ChronoDuration::minutes(1));
        assert_eq!(next("slow"), now + ChronoDuration::minutes(60));
        assert_eq!(next("unset"), now + ChronoDuration::minutes(15));
    }

    #[tokio::test]
    async fn test_updates_are_written_in_waves() {
        let (_dir, store) = temp_store();
        let now = timefmt::now();
        let batch: Vec<_> = (0..60)
            .map(|i| sample_url(&format!("url-{:02}", i), "u", "x.example", now))
            .collect();
        for url in &batch {
            insert_url(&store, URLS, url).await;
        }
        let outcomes: Vec<_> = batch
            .iter()
            .map(|u| PingOutcome::response(&u.id, 200, SuccessRange::Below400, 5, now))
            .collect();

        let planned = plan_updates(&batch, &outcomes, 15, None);
        let summary = apply_updates(&store, URLS, &planned, 25).await;

        assert_eq!(summary.waves, 3);
        assert_eq!(summary.updated, 60);
        assert!(summary.failed_waves.is_empty());

        let stored = load_url(&store, URLS, "url-42").await;
        assert_eq!(stored.last_ping_status, Some(PingStatus::Success));
        assert_eq!(stored.success_count, 1);
        assert_eq!(stored.total_pings, 1);
        assert_eq!(stored.next_ping_time, now + ChronoDuration::minutes(15));
    }

    #[tokio::test]
    async fn test_failed_wave_does_not_block_later_waves() {
        let (_dir, store) = temp_store();
        let flaky = FlakyStore::wrap(store);
        let now = timefmt::now();
        let batch: Vec<_> = (0..6)
            .map(|i| sample_url(&format!("url-{}", i), "u", "x.example", now))
            .collect();
        for url in &batch {
            insert_url(&flaky, URLS, url).await;
        }
        flaky.fail_updates_for.lock().unwrap().insert("url-1".to_string());

        let outcomes: Vec<_> = batch
            .iter()
            .map(|u| PingOutcome::transport_failure(&u.id, 3, now, "connection refused"))
            .collect();
        let planned = plan_updates(&batch, &outcomes, 15, None);
        let summary = apply_updates(&flaky, URLS, &planned, 2).await;

        assert_eq!(summary.waves, 3);
        assert_eq!(summary.updated, 5);
        assert_eq!(summary.failed_waves.len(), 1);
        assert_eq!(summary.failed_waves[0].wave, 0);
        assert_eq!(summary.failed_waves[0].failed[0].url_id, "url-1");
        assert_eq!(flaky.update_calls.load(Ordering::SeqCst), 6);

        let last = load_url(&flaky, URLS, "url-5").await;
        assert_eq!(last.last_ping_status, Some(PingStatus::Error));
        assert_eq!(last.last_ping_status_code, Some(0));
        assert_eq!(last.success_count, 0);
    }
}
