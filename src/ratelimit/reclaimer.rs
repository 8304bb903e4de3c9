//! Reclaiming of expired local counters and per-tenant purges.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::debug;

use super::local::LocalWindowStore;
use super::store::{StoreError, WindowStore};

/// Default chance that a single request triggers a sweep.
pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.01;

/// Evicts expired counters from the local store.
///
/// Sweeps run on a periodic task when one is spawned, and additionally with
/// a small probability on each request so memory stays bounded even without
/// a background task.
#[derive(Clone)]
pub struct Reclaimer {
    local: Arc<LocalWindowStore>,
    store: Arc<dyn WindowStore>,
    probability: f64,
}

impl Reclaimer {
    /// Create a reclaimer.
    ///
    /// `local` is the store to sweep; `store` is the store the decision
    /// engine counts against, used for purges. They may be the same store.
    pub fn new(local: Arc<LocalWindowStore>, store: Arc<dyn WindowStore>, probability: f64) -> Self {
        Self {
            local,
            store,
            probability: if probability.is_nan() {
                0.0
            } else {
                probability.clamp(0.0, 1.0)
            },
        }
    }

    /// Remove every expired local counter.
    pub fn sweep(&self) -> usize {
        let removed = self.local.sweep();
        debug!(removed = removed, remaining = self.local.len(), "Swept local counters");
        removed
    }

    /// Sweep with the configured probability. Returns whether a sweep ran.
    pub fn maybe_sweep(&self) -> bool {
        if self.probability > 0.0 && rand::thread_rng().gen_bool(self.probability) {
            self.sweep();
            return true;
        }
        false
    }

    /// Drop every counter held for `identifier`, in all backends.
    ///
    /// Used after a tier change so the tenant starts from a fresh window.
    pub async fn purge(&self, identifier: &str) -> Result<usize, StoreError> {
        let removed = self.store.purge(identifier).await?;
        debug!(identifier = %identifier, removed = removed, "Purged counters");
        Ok(removed)
    }

    /// Spawn a task that sweeps every `interval`.
    pub fn spawn_periodic(&self, interval: Duration) -> JoinHandle<()> {
        let reclaimer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reclaimer.sweep();
            }
        })
    }
}
