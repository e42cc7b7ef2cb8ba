//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::{PingOutcome, ProbeError, SuccessRange};
use crate::config::MonitorConfig;
use crate::db::timefmt;

const USER_AGENT: &str = concat!("pingshard/", env!("CARGO_PKG_VERSION"));

/// Issues probes over a shared, pooled HTTP client.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Clone)]
pub struct Prober {
    client: reqwest::Client,
    jitter: Duration,
}

impl Prober {
    pub fn new(config: &MonitorConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.max_concurrency)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;

        Ok(Self {
            client,
            jitter: config.probe_jitter,
        })
    }

    /// Run one HTTP GET against `address` and classify the result.
    ///
    /// Never fails: transport errors become a status 0 outcome.
    pub async fn probe(&self, url_id: &str, address: &str, range: SuccessRange) -> PingOutcome {
        // Add jitter to avoid thundering herd
        let max_jitter = self.jitter.as_millis() as u64;
        if max_jitter > 0 {
            let jitter = rand::random::<u64>() % max_jitter;
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let url = normalize_address(address);
        let timestamp = timefmt::now();
        let start = Instant::now();

        match self.client.get(&url).send().await {
            Ok(response) => {
                let elapsed = start.elapsed().as_millis() as u64;
                PingOutcome::response(url_id, response.status().as_u16(), range, elapsed, timestamp)
            }
            Err(e) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let error = if e.is_timeout() {
                    format!("request timed out: {}", e)
                } else {
                    e.to_string()
                };
                tracing::debug!("Probe failed for {}: {}", url, error);
                PingOutcome::transport_failure(url_id, elapsed, timestamp, error)
            }
        }
    }
}

/// Prepend `http://` when the address carries no scheme.
fn normalize_address(address: &str) -> String {
    let address = address.trim();
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
