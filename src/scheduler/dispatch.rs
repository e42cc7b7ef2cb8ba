//! Bounded fan-out of probes over a work batch.

use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::db::{timefmt, MonitoredUrl};
use crate::probe::{PingOutcome, Prober, SuccessRange};

/// Probe every URL in `urls` with at most `max_concurrency` requests in flight.
///
/// Returns once every probe has resolved, with one outcome per URL. A probe
/// task that dies is recorded as a failed outcome for its URL so that no
/// sibling work is lost.
pub async fn dispatch(
    prober: &Prober,
    urls: &[MonitoredUrl],
    range: SuccessRange,
    max_concurrency: usize,
) -> Vec<PingOutcome> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));

    let handles: Vec<_> = urls
        .iter()
        .map(|url| {
            let prober = prober.clone();
            let semaphore = semaphore.clone();
            let url_id = url.id.clone();
            let address = url.url.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await; // Hold permit until done
                prober.probe(&url_id, &address, range).await
            });
            (url.id.clone(), handle)
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for (url_id, handle) in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                tracing::error!("Dispatcher: probe task for {} failed: {}", url_id, e);
                outcomes.push(PingOutcome::transport_failure(
                    &url_id,
                    0,
                    timefmt::now(),
                    format!("probe task failed: {}", e),
                ));
            }
        }
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{closed_port_url, sample_url, spawn_fixture, test_monitor_config};
    use std::sync::atomic::Ordering;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_ceiling_is_respected() {
        let fixture = spawn_fixture().await;
        let prober = Prober::new(&test_monitor_config()).unwrap();
        let now = timefmt::now();
        let urls: Vec<_> = (0..8)
            .map(|i| sample_url(&format!("u{}", i), "user", &fixture.url("/tracked"), now))
            .collect();

        let outcomes = dispatch(&prober, &urls, SuccessRange::Below400, 2).await;

        assert_eq!(outcomes.len(), 8);
        assert!(outcomes.iter().all(|o| o.success));
        let peak = fixture.max_in_flight.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak concurrency was {}", peak);
    }

    #[tokio::test]
    async fn test_failures_do_not_cancel_siblings() {
        let fixture = spawn_fixture().await;
        let prober = Prober::new(&test_monitor_config()).unwrap();
        let now = timefmt::now();
        let urls = vec![
            sample_url("ok", "user", &fixture.url("/ok"), now),
            sample_url("refused", "user", &closed_port_url(), now),
            sample_url("slow", "user", &fixture.url("/slow"), now),
            sample_url("error", "user", &fixture.url("/error"), now),
        ];

        let outcomes = dispatch(&prober, &urls, SuccessRange::Below400, 10).await;
        assert_eq!(outcomes.len(), 4);

        let by_id = |id: &str| outcomes.iter().find(|o| o.url_id == id).unwrap();
        assert!(by_id("ok").success);
        assert_eq!(by_id("refused").status, 0);
        assert_eq!(by_id("slow").status, 0);
        assert_eq!(by_id("error").status, 500);

        for outcome in &outcomes {
            if outcome.status == 0 {
                assert!(!outcome.success);
                assert!(!outcome.error.as_deref().unwrap_or("").is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let prober = Prober::new(&test_monitor_config()).unwrap();
        let outcomes = dispatch(&prober, &[], SuccessRange::Below400, 10).await;
        assert!(outcomes.is_empty());
    }
}
