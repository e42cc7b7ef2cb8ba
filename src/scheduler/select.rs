//! Selection of due URLs for one node/shard.

use chrono::{DateTime, Utc};

use crate::config::MonitorConfig;
use crate::db::{timefmt, DocumentStore, Filter, MonitoredUrl, StoreError};

/// The work batch of one tick.
#[derive(Debug, Default)]
pub struct Selection {
    pub urls: Vec<MonitoredUrl>,
    /// Documents returned by the store that could not be used.
    pub skipped: usize,
}

/// Query the store for enabled URLs of `node_id`/`shard_key` whose
/// `nextPingTime` has passed, up to the configured batch size.
pub async fn select_due(
    store: &dyn DocumentStore,
    config: &MonitorConfig,
    node_id: &str,
    shard_key: u8,
    now: DateTime<Utc>,
) -> Result<Selection, StoreError> {
    let filters = vec![
        Filter::equal("nodeId", node_id),
        Filter::equal("isEnabled", true),
        Filter::equal("shardKey", shard_key),
        Filter::less_than_equal("nextPingTime", timefmt::format(&now)),
    ];

    let docs = store
        .query(&config.urls_collection, &filters, config.batch_size)
        .await?;

    let mut selection = Selection::default();
    for doc in docs {
        match MonitoredUrl::from_document(&doc) {
            Ok(url) if matches_selection(&url, node_id, shard_key, now) => selection.urls.push(url),
            Ok(url) => {
                tracing::warn!("Selector: store returned non-due URL {}, skipping", url.id);
                selection.skipped += 1;
            }
            Err(e) => {
                tracing::warn!("Selector: cannot decode URL document {}: {}", doc.id, e);
                selection.skipped += 1;
            }
        }
    }

    Ok(selection)
}

fn matches_selection(url: &MonitoredUrl, node_id: &str, shard_key: u8, now: DateTime<Utc>) -> bool {
    url.node_id == node_id && url.is_enabled && url.shard_key == shard_key && url.is_due(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Fields;
    use crate::testutil::{insert_url, sample_url, temp_store, test_monitor_config};
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_selects_only_due_enabled_urls_on_node_and_shard() {
        let (_dir, store) = temp_store();
        let config = test_monitor_config();
        let now = timefmt::now();
        let past = now - ChronoDuration::minutes(1);
        let future = now + ChronoDuration::minutes(1);

        let due = sample_url("due", "u", "example.com", past);
        let exactly_now = sample_url("now", "u", "example.com", now);
        let later = sample_url("later", "u", "example.com", future);
        let mut disabled = sample_url("disabled", "u", "example.com", past);
        disabled.is_enabled = false;
        let mut other_node = sample_url("other-node", "u", "example.com", past);
        other_node.node_id = "node-2".to_string();
        let mut other_shard = sample_url("other-shard", "u", "example.com", past);
        other_shard.shard_key = 4;

        for url in [&due, &exactly_now, &later, &disabled, &other_node, &other_shard] {
            insert_url(&store, &config.urls_collection, url).await;
        }

        let selection = select_due(&store, &config, "node-1", 0, now).await.unwrap();
        let mut ids: Vec<&str> = selection.urls.iter().map(|u| u.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["due", "now"]);
        assert_eq!(selection.skipped, 0);

        for url in &selection.urls {
            assert_eq!(url.node_id, "node-1");
            assert!(url.is_enabled);
            assert_eq!(url.shard_key, 0);
            assert!(url.next_ping_time <= now);
        }
    }

    #[tokio::test]
    async fn test_empty_selection() {
        let (_dir, store) = temp_store();
        let selection = select_due(&store, &test_monitor_config(), "node-1", 0, timefmt::now())
            .await
            .unwrap();
        assert!(selection.urls.is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_bound() {
        let (_dir, store) = temp_store();
        let mut config = test_monitor_config();
        config.batch_size = 3;
        let past = timefmt::now() - ChronoDuration::minutes(5);

        for i in 0..5 {
            let url = sample_url(&format!("url-{}", i), "u", "example.com", past);
            insert_url(&store, &config.urls_collection, &url).await;
        }

        let selection = select_due(&store, &config, "node-1", 0, timefmt::now()).await.unwrap();
        assert_eq!(selection.urls.len(), 3);
    }

    #[tokio::test]
    async fn test_undecodable_document_is_skipped() {
        let (_dir, store) = temp_store();
        let config = test_monitor_config();
        let past = timefmt::now() - ChronoDuration::minutes(5);

        let mut broken = Fields::new();
        broken.insert("nodeId".into(), "node-1".into());
        broken.insert("isEnabled".into(), true.into());
        broken.insert("shardKey".into(), 0.into());
        broken.insert("nextPingTime".into(), timefmt::format(&past).into());
        store.create(&config.urls_collection, "broken", broken).await.unwrap();
        insert_url(&store, &config.urls_collection, &sample_url("ok", "u", "example.com", past)).await;

        let selection = select_due(&store, &config, "node-1", 0, timefmt::now()).await.unwrap();
        assert_eq!(selection.urls.len(), 1);
        assert_eq!(selection.skipped, 1);
    }
}
