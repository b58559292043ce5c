// ABOUTME: Cached, rate-limited reachability probe of the secondary store
// ABOUTME: Probe errors and timeouts map to unreachable, never to the caller

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::applier::SecondaryStore;

#[derive(Debug, Clone, Copy)]
struct ProbeState {
    reachable: bool,
    checked_at: Option<Instant>,
}

/// Answers "can I reach the secondary store right now?" without hammering
/// it on every dispatch cycle. The cached answer is served within a short
/// validity window; outside it, a single ping under a timeout refreshes
/// the cache regardless of outcome.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    cache_ttl: Duration,
    probe_timeout: Duration,
    state: Mutex<ProbeState>,
}

impl ConnectivityMonitor {
    pub fn new(cache_ttl: Duration, probe_timeout: Duration) -> Self {
        Self {
            cache_ttl,
            probe_timeout,
            state: Mutex::new(ProbeState {
                reachable: false,
                checked_at: None,
            }),
        }
    }

    /// Cached-or-probed reachability. A flaky store can stall this for at
    /// most the probe timeout and can never raise into the caller.
    pub async fn is_reachable(&self, store: &dyn SecondaryStore) -> bool {
        {
            let state = self.state.lock().unwrap();
            if let Some(checked_at) = state.checked_at {
                if checked_at.elapsed() < self.cache_ttl {
                    return state.reachable;
                }
            }
        }

        let reachable = matches!(
            tokio::time::timeout(self.probe_timeout, store.ping()).await,
            Ok(Ok(()))
        );
        if !reachable {
            tracing::debug!("secondary store probe failed, marking unreachable");
        }

        let mut state = self.state.lock().unwrap();
        state.reachable = reachable;
        state.checked_at = Some(Instant::now());
        reachable
    }

    /// Last probed state without touching the network. Used by the status
    /// snapshot.
    pub fn last_known(&self) -> bool {
        self.state.lock().unwrap().reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntityDef;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ProbeStore {
        up: AtomicBool,
        pings: AtomicUsize,
    }

    #[async_trait]
    impl SecondaryStore for ProbeStore {
        async fn ping(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(anyhow!("connection refused"))
            }
        }

        async fn upsert(&self, _: &EntityDef, _: &[(String, Value)]) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _: &EntityDef, _: &[(String, Value)]) -> Result<()> {
            Ok(())
        }

        async fn count_rows(&self, _: &EntityDef) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn failed_probe_reports_unreachable() {
        let store = ProbeStore::default();
        let monitor = ConnectivityMonitor::new(Duration::from_secs(10), Duration::from_secs(5));
        assert!(!monitor.is_reachable(&store).await);
        assert!(!monitor.last_known());
    }

    #[tokio::test]
    async fn cached_answer_skips_the_network() {
        let store = ProbeStore::default();
        store.up.store(true, Ordering::SeqCst);
        let monitor = ConnectivityMonitor::new(Duration::from_secs(10), Duration::from_secs(5));

        assert!(monitor.is_reachable(&store).await);
        assert!(monitor.is_reachable(&store).await);
        assert!(monitor.is_reachable(&store).await);
        assert_eq!(store.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_expiry_triggers_a_fresh_probe() {
        let store = ProbeStore::default();
        store.up.store(true, Ordering::SeqCst);
        let monitor = ConnectivityMonitor::new(Duration::ZERO, Duration::from_secs(5));

        assert!(monitor.is_reachable(&store).await);
        store.up.store(false, Ordering::SeqCst);
        assert!(!monitor.is_reachable(&store).await);
        assert_eq!(store.pings.load(Ordering::SeqCst), 2);
    }

    struct HangingStore;

    #[async_trait]
    impl SecondaryStore for HangingStore {
        async fn ping(&self) -> Result<()> {
            std::future::pending().await
        }

        async fn upsert(&self, _: &EntityDef, _: &[(String, Value)]) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _: &EntityDef, _: &[(String, Value)]) -> Result<()> {
            Ok(())
        }

        async fn count_rows(&self, _: &EntityDef) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_probe_is_bounded_by_the_timeout() {
        let monitor = ConnectivityMonitor::new(Duration::from_secs(10), Duration::from_secs(5));
        assert!(!monitor.is_reachable(&HangingStore).await);
    }
}
