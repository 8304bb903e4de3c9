//! Primary/backup window store strategy.
//!
//! The primary (distributed) store is preferred. Any primary failure is
//! answered by the backup (local) store for that same request, and the
//! primary is skipped until a retry interval has passed. Counts taken by
//! the backup during an outage are never copied back to the primary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::key::WindowKey;
use super::local::LocalWindowStore;
use super::store::{CounterEntry, StoreError, WindowStore};

/// Default pause before probing a failed primary again.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Which store currently serves increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryState {
    /// The primary is believed reachable
    Available,
    /// The primary failed at the given instant; the backup serves until
    /// the retry interval has passed
    Unavailable { since: Instant },
}

/// A window store that prefers a primary and falls back to a local backup.
pub struct FallbackStore {
    primary: Arc<dyn WindowStore>,
    backup: Arc<LocalWindowStore>,
    state: RwLock<PrimaryState>,
    retry_after: Duration,
}

impl FallbackStore {
    /// Create a fallback store with the default retry interval.
    pub fn new(primary: Arc<dyn WindowStore>, backup: Arc<LocalWindowStore>) -> Self {
        Self::with_retry_after(primary, backup, DEFAULT_RETRY_AFTER)
    }

    /// Create a fallback store that waits `retry_after` before probing a
    /// failed primary again.
    pub fn with_retry_after(
        primary: Arc<dyn WindowStore>,
        backup: Arc<LocalWindowStore>,
        retry_after: Duration,
    ) -> Self {
        Self {
            primary,
            backup,
            state: RwLock::new(PrimaryState::Available),
            retry_after,
        }
    }

    /// Get the current primary state.
    pub fn state(&self) -> PrimaryState {
        *self.state.read()
    }

    fn should_try_primary(&self) -> bool {
        match *self.state.read() {
            PrimaryState::Available => true,
            PrimaryState::Unavailable { since } => since.elapsed() >= self.retry_after,
        }
    }

    fn mark_unavailable(&self, error: &StoreError) {
        let mut state = self.state.write();
        if *state == PrimaryState::Available {
            warn!(
                backend = self.primary.name(),
                error = %error,
                retry_after_ms = self.retry_after.as_millis() as u64,
                "Primary window store unavailable, counting locally"
            );
        }
        *state = PrimaryState::Unavailable { since: Instant::now() };
    }

    fn mark_available(&self) {
        let mut state = self.state.write();
        if *state != PrimaryState::Available {
            info!(backend = self.primary.name(), "Primary window store recovered");
            *state = PrimaryState::Available;
        }
    }
}

#[async_trait]
impl WindowStore for FallbackStore {
    async fn increment(&self, key: &WindowKey, window: Duration) -> Result<CounterEntry, StoreError> {
        if self.should_try_primary() {
            match self.primary.increment(key, window).await {
                Ok(entry) => {
                    self.mark_available();
                    return Ok(entry);
                }
                Err(e) => self.mark_unavailable(&e),
            }
        }

        self.backup.increment(key, window).await
    }

    async fn purge(&self, identifier: &str) -> Result<usize, StoreError> {
        let local = self.backup.purge_identifier(identifier);

        match self.primary.purge(identifier).await {
            Ok(remote) => {
                self.mark_available();
                Ok(local + remote)
            }
            Err(e) => {
                self.mark_unavailable(&e);
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}
