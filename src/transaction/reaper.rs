//! Background purge of the resolved-transaction cache

use crate::config::TransactionConfig;
use crate::transaction::registry::TransactionRegistry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, info};

/// Reaper timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedReaperConfig {
    /// How often the cache is swept
    pub interval_ms: u64,
    /// Resolved entries older than this are forgotten
    pub max_age_ms: u64,
}

impl ResolvedReaperConfig {
    pub fn from_config(config: &TransactionConfig) -> Self {
        Self {
            interval_ms: config.reap_interval_ms,
            max_age_ms: config.reap_interval_ms,
        }
    }
}

/// Periodically forgets resolved transactions
pub struct ResolvedReaper {
    registry: Arc<TransactionRegistry>,
    config: ResolvedReaperConfig,
    notify: Notify,
    shutdown: AtomicBool,
}

impl ResolvedReaper {
    pub fn new(registry: Arc<TransactionRegistry>, config: ResolvedReaperConfig) -> Self {
        Self {
            registry,
            config,
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Spawn the sweep loop on the current runtime
    pub fn start(self: &Arc<Self>) {
        let reaper = Arc::clone(self);
        let interval_ms = reaper.config.interval_ms.max(1);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(interval_ms, "Resolved transaction reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = reaper.notify.notified() => {}
                }
                if reaper.is_shutdown() {
                    info!("Resolved transaction reaper shutting down");
                    break;
                }
                reaper.reap_once();
            }

            info!("Resolved transaction reaper stopped");
        });
    }

    /// Sweep now instead of waiting for the next tick
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Purge expired entries, returning how many were dropped
    pub fn reap_once(&self) -> usize {
        let purged = self.registry.purge_resolved(self.config.max_age_ms as i64);
        if purged > 0 {
            debug!(
                purged,
                remaining = self.registry.resolved_count(),
                "Purged resolved transactions"
            );
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionId, TransactionState, TransactionStatus};

    fn resolved_registry() -> Arc<TransactionRegistry> {
        let registry = Arc::new(TransactionRegistry::in_memory());
        let id = TransactionId(1);
        registry
            .create(id, TransactionState::local().with_status(TransactionStatus::Started))
            .unwrap();
        registry
            .update_state(id, TransactionStatus::Committed, false)
            .unwrap();
        registry.remove(id, false).unwrap();
        registry
    }

    #[test]
    fn test_reap_once_respects_age() {
        let registry = resolved_registry();
        let keep = ResolvedReaper::new(
            registry.clone(),
            ResolvedReaperConfig {
                interval_ms: 1000,
                max_age_ms: 60_000,
            },
        );
        assert_eq!(keep.reap_once(), 0);
        assert_eq!(registry.resolved_count(), 1);

        std::thread::sleep(Duration::from_millis(5));
        let purge = ResolvedReaper::new(
            registry.clone(),
            ResolvedReaperConfig {
                interval_ms: 1000,
                max_age_ms: 0,
            },
        );
        assert_eq!(purge.reap_once(), 1);
        assert_eq!(registry.resolved_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_and_shutdown() {
        let registry = resolved_registry();
        let reaper = Arc::new(ResolvedReaper::new(
            registry.clone(),
            ResolvedReaperConfig {
                interval_ms: 60_000,
                max_age_ms: 0,
            },
        ));
        reaper.start();
        tokio::time::sleep(Duration::from_millis(5)).await;
        reaper.trigger();
        for _ in 0..100 {
            if registry.resolved_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.resolved_count(), 0);

        reaper.shutdown();
        assert!(reaper.is_shutdown());
    }
}
