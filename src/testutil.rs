//! Shared fixtures for unit tests.

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::config::MonitorConfig;
use crate::db::{
    Document, DocumentStore, Fields, Filter, MonitoredUrl, ResultShard, SqliteStore, StoreError,
};
use crate::probe::PingOutcome;

/// In-process HTTP server used as a probe target.
pub struct Fixture {
    pub addr: SocketAddr,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl Fixture {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

#[derive(Clone, Default)]
struct FixtureState {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

async fn tracked(State(state): State<FixtureState>) -> StatusCode {
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    StatusCode::OK
}

/// Routes: `/ok` 200, `/error` 500, `/missing` 404, `/slow` answers after 3s,
/// `/tracked` 200 after 100ms while recording peak concurrency.
pub async fn spawn_fixture() -> Fixture {
    let state = FixtureState::default();
    let max_in_flight = state.max_in_flight.clone();

    let app = Router::new()
        .route("/ok", get(|| async { StatusCode::OK }))
        .route("/error", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                StatusCode::OK
            }),
        )
        .route("/tracked", get(tracked))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Fixture { addr, max_in_flight }
}

/// URL of a local port nothing listens on.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/", addr)
}

pub fn test_monitor_config() -> MonitorConfig {
    MonitorConfig {
        probe_timeout: Duration::from_millis(500),
        probe_jitter: Duration::ZERO,
        ..MonitorConfig::default()
    }
}

/// A SQLite store in a temporary directory that lives as long as the guard.
pub fn temp_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("test.db")).unwrap();
    (dir, store)
}

pub fn sample_url(id: &str, user_id: &str, address: &str, next_ping_time: DateTime<Utc>) -> MonitoredUrl {
    MonitoredUrl {
        id: id.to_string(),
        user_id: user_id.to_string(),
        url: address.to_string(),
        name: None,
        is_enabled: true,
        node_id: "node-1".to_string(),
        shard_key: 0,
        ping_interval: Some(15),
        last_ping_time: None,
        last_ping_status: None,
        last_ping_status_code: None,
        success_count: 0,
        total_pings: 0,
        logs: Vec::new(),
        next_ping_time,
    }
}

pub async fn insert_url(store: &dyn DocumentStore, collection: &str, url: &MonitoredUrl) {
    store
        .create(collection, &url.id, url.to_fields().unwrap())
        .await
        .unwrap();
}

pub async fn load_url(store: &dyn DocumentStore, collection: &str, id: &str) -> MonitoredUrl {
    let doc = store.get(collection, id).await.unwrap().unwrap();
    MonitoredUrl::from_document(&doc).unwrap()
}

pub async fn load_shard(store: &dyn DocumentStore, collection: &str, id: &str) -> Option<(i64, ResultShard)> {
    store
        .get(collection, id)
        .await
        .unwrap()
        .map(|doc| (doc.version, ResultShard::from_document(&doc).unwrap()))
}

/// A competing writer that slips in between a shard read and its write.
pub struct Interference {
    pub user_id: String,
    pub date: NaiveDate,
    pub outcome: PingOutcome,
}

/// Store wrapper that injects failures and concurrent writes.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: Option<SqliteStore>,
    pub fail_query: AtomicBool,
    pub fail_get: AtomicBool,
    pub fail_updates_for: Mutex<HashSet<String>>,
    pub interfere: Mutex<Option<Interference>>,
    pub update_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn wrap(inner: SqliteStore) -> Self {
        Self {
            inner: Some(inner),
            ..Self::default()
        }
    }

    fn inner(&self) -> &SqliteStore {
        self.inner.as_ref().expect("FlakyStore without inner store")
    }

    fn unavailable() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("injected failure".to_string()),
        ))
    }

    async fn apply_interference(&self, collection: &str, id: &str) {
        let pending = self.interfere.lock().unwrap().take();
        let Some(interference) = pending else {
            return;
        };
        let shard_id = ResultShard::shard_id(&interference.user_id, interference.date);
        assert_eq!(shard_id, id, "interference targets another shard");

        match self.inner().get(collection, id).await.unwrap() {
            Some(doc) => {
                let mut shard = ResultShard::from_document(&doc).unwrap();
                shard.append(&interference.outcome, usize::MAX);
                self.inner()
                    .update(collection, id, shard.to_fields().unwrap(), Some(doc.version))
                    .await
                    .unwrap();
            }
            None => {
                let mut shard = ResultShard::new(&interference.user_id, interference.date);
                shard.append(&interference.outcome, usize::MAX);
                self.inner()
                    .create(collection, id, shard.to_fields().unwrap())
                    .await
                    .unwrap();
            }
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner().query(collection, filters, limit).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        // Read first, then let the competitor write: the caller holds a stale copy.
        let current = self.inner().get(collection, id).await?;
        self.apply_interference(collection, id).await;
        Ok(current)
    }

    async fn create(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<Document, StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.inner().create(collection, id, fields).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        expected_version: Option<i64>,
    ) -> Result<Document, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates_for.lock().unwrap().contains(id) {
            return Err(Self::unavailable());
        }
        self.inner().update(collection, id, fields, expected_version).await
    }
}
