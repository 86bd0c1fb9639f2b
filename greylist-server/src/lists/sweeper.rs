use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{is_expired, ListStore, Lists};
use crate::clock::Clock;
use crate::config::Timing;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Evicts list entries older than their list's TTL.
pub struct Sweeper {
    lists: Lists,
    timing: Timing,
    clock: Arc<dyn Clock>,
}

impl Sweeper {
    pub fn new(lists: Lists, timing: Timing, clock: Arc<dyn Clock>) -> Self {
        Sweeper {
            lists,
            timing,
            clock,
        }
    }

    pub async fn run(self, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(self.clock.now()).await;
                }
            }
        }
        info!("list sweeper stopped");
    }

    /// Sweeps all four lists once. Returns the number of evicted entries.
    pub async fn sweep(&self, now: i64) -> usize {
        let targets: [(&str, &Arc<dyn ListStore>, i64); 4] = [
            ("greylist_ip", &self.lists.greylist_ip, self.timing.greyexp),
            ("greylist_domain", &self.lists.greylist_domain, self.timing.greyexp),
            ("whitelist_ip", &self.lists.whitelist_ip, self.timing.whiteexp),
            ("whitelist_domain", &self.lists.whitelist_domain, self.timing.whiteexp),
        ];

        let mut evicted = 0;
        for (name, store, ttl) in targets {
            evicted += sweep_store(name, store.as_ref(), now, ttl).await;
        }
        evicted
    }
}

async fn sweep_store(name: &str, store: &dyn ListStore, now: i64, ttl: i64) -> usize {
    // Snapshot first so the store is only locked per key while evicting.
    let candidates: Vec<String> = store
        .entries()
        .await
        .into_iter()
        .filter(|(_, seen_at)| is_expired(*seen_at, now, ttl))
        .map(|(key, _)| key)
        .collect();

    let mut evicted = 0;
    for key in candidates {
        if store.remove_stale(&key, now, ttl).await {
            evicted += 1;
        }
    }

    if evicted > 0 {
        let remaining = store.len().await;
        debug!(list = name, evicted, remaining, "expired entries removed");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const NOW: i64 = 1_700_000_000;

    fn sweeper(lists: &Lists) -> Sweeper {
        Sweeper::new(
            lists.clone(),
            Timing::default(),
            Arc::new(ManualClock::new(NOW)),
        )
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let lists = Lists::in_memory();
        let timing = Timing::default();

        lists.greylist_ip.set("old", NOW - timing.greyexp - 1).await;
        lists.greylist_ip.set("young", NOW - timing.greyexp + 1).await;
        lists.greylist_domain.set("old", NOW - timing.greyexp - 1).await;
        lists.greylist_domain.set("young", NOW - timing.greyexp + 1).await;
        lists.whitelist_ip.set("old", NOW - timing.whiteexp - 1).await;
        lists.whitelist_ip.set("young", NOW - timing.whiteexp + 1).await;
        lists.whitelist_domain.set("old", NOW - timing.whiteexp - 1).await;
        lists.whitelist_domain.set("young", NOW - timing.whiteexp + 1).await;

        assert_eq!(sweeper(&lists).sweep(NOW).await, 4);

        for store in [
            &lists.greylist_ip,
            &lists.greylist_domain,
            &lists.whitelist_ip,
            &lists.whitelist_domain,
        ] {
            assert_eq!(store.get("old").await, None);
            assert!(store.get("young").await.is_some());
        }
    }

    #[tokio::test]
    async fn test_sweep_uses_list_specific_ttl() {
        let lists = Lists::in_memory();
        let timing = Timing::default();

        // Older than greyexp but well within whiteexp.
        let seen_at = NOW - timing.greyexp - 10;
        lists.greylist_ip.set("ip=192.0.2.1:a@x:b@y", seen_at).await;
        lists.whitelist_ip.set("ip=192.0.2.1", seen_at).await;

        assert_eq!(sweeper(&lists).sweep(NOW).await, 1);
        assert_eq!(lists.greylist_ip.len().await, 0);
        assert_eq!(lists.whitelist_ip.len().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_at_exact_ttl() {
        let lists = Lists::in_memory();
        let timing = Timing::default();
        lists.whitelist_ip.set("ip=192.0.2.1", NOW - timing.whiteexp).await;

        assert_eq!(sweeper(&lists).sweep(NOW).await, 1);
        assert_eq!(lists.whitelist_ip.get("ip=192.0.2.1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let lists = Lists::in_memory();
        let timing = Timing::default();
        lists.greylist_ip.set("old", NOW - timing.greyexp - 1).await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sweeper(&lists).run(SWEEP_INTERVAL, shutdown.clone()));

        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(lists.greylist_ip.len().await, 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
