//! Background sweeper for expired entries.
//!
//! Reads already evict lazily; this loop only reclaims entries for keys that
//! are never read again.

use crate::cache::service::CacheService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

pub fn spawn_janitor(
    cache: Arc<CacheService>,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = sweep_interval.as_millis() as u64,
            "Starting cache janitor"
        );
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = cache.store.purge_expired();
                    if let Some(metrics) = &cache.metrics {
                        metrics.cache_evicted_total.inc_by(evicted as f64);
                    }
                    let stats = cache.stats();
                    debug!(evicted = evicted, entries = stats.entries, "Cache sweep complete");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Cache janitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::breaker::CircuitBreaker;
    use crate::cache::key::CacheKey;
    use crate::error::PortalError;

    #[tokio::test(start_paused = true)]
    async fn test_janitor_sweeps_and_stops() {
        let cache = Arc::new(CacheService::new(Arc::new(CircuitBreaker::new(
            Duration::from_secs(30),
        ))));
        cache
            .get_or_fetch(&CacheKey::from("content.list.news"), Duration::from_secs(5), || async {
                Ok::<_, PortalError>(vec![1u32])
            })
            .await
            .unwrap();
        assert_eq!(cache.stats().entries, 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_janitor(cache.clone(), Duration::from_secs(10), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.stats().entries, 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
