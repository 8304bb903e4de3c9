//! Core rate limit decision engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::key::WindowKey;
use super::local::LocalWindowStore;
use super::quota::{LimitClass, QuotaRow, QuotaTable, Tier};
use super::reclaimer::{Reclaimer, DEFAULT_SWEEP_PROBABILITY};
use super::store::{CounterEntry, StoreError, WindowStore};

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Maximum requests in the window
    pub limit: u64,
    /// Requests left in the window after this one
    pub remaining: u64,
    /// When the window ends
    pub reset_at: DateTime<Utc>,
    /// Seconds to wait before retrying; present only on denial
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    fn from_entry(row: QuotaRow, entry: CounterEntry, now: DateTime<Utc>) -> Self {
        let allowed = entry.count <= row.limit;
        let retry_after_secs = if allowed {
            None
        } else {
            let millis = (entry.reset_at - now).num_milliseconds().max(0) as u64;
            Some(millis.div_ceil(1000).max(1))
        };

        Self {
            allowed,
            limit: row.limit,
            remaining: row.limit.saturating_sub(entry.count),
            reset_at: entry.reset_at,
            retry_after_secs,
        }
    }

    /// Allow a request that could not be counted at all.
    fn fail_open(row: QuotaRow, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: row.limit,
            remaining: row.limit,
            reset_at: now + chrono::Duration::milliseconds(row.window_ms as i64),
            retry_after_secs: None,
        }
    }
}

/// The rate limiter that turns quota rows and window counters into
/// decisions.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    quotas: QuotaTable,
    store: Arc<dyn WindowStore>,
    reclaimer: Reclaimer,
}

impl RateLimiter {
    /// Create a rate limiter over an explicit store.
    pub fn new(quotas: QuotaTable, store: Arc<dyn WindowStore>, reclaimer: Reclaimer) -> Self {
        Self {
            quotas,
            store,
            reclaimer,
        }
    }

    /// Create a rate limiter that counts in a fresh process-local store.
    pub fn with_local_store(quotas: QuotaTable) -> Self {
        let local = Arc::new(LocalWindowStore::new());
        let reclaimer = Reclaimer::new(local.clone(), local.clone(), DEFAULT_SWEEP_PROBABILITY);
        Self::new(quotas, local, reclaimer)
    }

    /// Check and count one request of `class` from `identifier` at `tier`.
    ///
    /// Never fails: if no store can count the request it is allowed and the
    /// decision to fail open is logged.
    pub async fn check(&self, class: LimitClass, identifier: &str, tier: Tier) -> Decision {
        self.reclaimer.maybe_sweep();

        let row = self.quotas.lookup(class, tier);
        let key = WindowKey::new(class, tier, identifier);

        trace!(key = %key, limit = row.limit, window_ms = row.window_ms, "Checking rate limit");

        let mut entry = match self.store.increment(&key, row.window()).await {
            Ok(entry) => entry,
            Err(e) => return self.fail_open(&key, row, e),
        };

        let mut now = Utc::now();
        if entry.is_expired(now) {
            // The window ended between the increment and now; count again
            // so the request lands in the live window.
            debug!(key = %key, reset_at = %entry.reset_at, "Window rolled during check");
            entry = match self.store.increment(&key, row.window()).await {
                Ok(entry) => entry,
                Err(e) => return self.fail_open(&key, row, e),
            };
            now = Utc::now();
        }

        let decision = Decision::from_entry(row, entry, now);
        if !decision.allowed {
            debug!(
                key = %key,
                count = entry.count,
                limit = row.limit,
                retry_after_secs = decision.retry_after_secs,
                "Rate limit exceeded"
            );
        }
        decision
    }

    fn fail_open(&self, key: &WindowKey, row: QuotaRow, error: StoreError) -> Decision {
        warn!(
            key = %key,
            backend = self.store.name(),
            error = %error,
            "Rate limiter cannot count request, failing open"
        );
        Decision::fail_open(row, Utc::now())
    }

    /// Drop every counter held for `identifier`, e.g. after a tier upgrade.
    pub async fn purge(&self, identifier: &str) -> Result<usize, StoreError> {
        self.reclaimer.purge(identifier).await
    }

    /// Get the quota table.
    pub fn quotas(&self) -> &QuotaTable {
        &self.quotas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::fallback::FallbackStore;
    use crate::ratelimit::key::UNKNOWN_IDENTIFIER;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// A store that never answers.
    struct DownStore;

    #[async_trait]
    impl WindowStore for DownStore {
        async fn increment(&self, _key: &WindowKey, _window: Duration) -> Result<CounterEntry, StoreError> {
            Err(StoreError::Unavailable {
                backend: "down",
                reason: "connection refused".to_string(),
            })
        }

        async fn purge(&self, _identifier: &str) -> Result<usize, StoreError> {
            Err(StoreError::Timeout {
                backend: "down",
                timeout: Duration::from_millis(250),
            })
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    /// A store whose first answer describes a window that has already
    /// ended, as seen when clocks disagree.
    struct SkewedStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WindowStore for SkewedStore {
        async fn increment(&self, _key: &WindowKey, window: Duration) -> Result<CounterEntry, StoreError> {
            let now = Utc::now();
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(CounterEntry {
                    count: 50,
                    reset_at: now - chrono::Duration::seconds(1),
                });
            }
            Ok(CounterEntry {
                count: 1,
                reset_at: now + chrono::Duration::from_std(window).unwrap(),
            })
        }

        async fn purge(&self, _identifier: &str) -> Result<usize, StoreError> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "skewed"
        }
    }

    fn local_limiter() -> (Arc<LocalWindowStore>, RateLimiter) {
        let local = Arc::new(LocalWindowStore::new());
        let reclaimer = Reclaimer::new(local.clone(), local.clone(), 0.0);
        let limiter = RateLimiter::new(QuotaTable::default(), local.clone(), reclaimer);
        (local, limiter)
    }

    #[tokio::test]
    async fn test_nth_request_allowed_iff_within_limit() {
        let yaml = r#"
submission:
  free: { limit: 1, window_ms: 60000 }
  starter: { limit: 2, window_ms: 60000 }
  pro: { limit: 3, window_ms: 60000 }
  enterprise: { limit: 4, window_ms: 60000 }
api:
  free: { limit: 5, window_ms: 60000 }
  starter: { limit: 6, window_ms: 60000 }
  pro: { limit: 7, window_ms: 60000 }
  enterprise: { limit: 8, window_ms: 60000 }
form_creation:
  free: { limit: 2, window_ms: 3600000 }
  starter: { limit: 3, window_ms: 3600000 }
  pro: { limit: 4, window_ms: 3600000 }
  enterprise: { limit: 5, window_ms: 3600000 }
"#;
        let limiter = RateLimiter::with_local_store(QuotaTable::from_yaml(yaml).unwrap());

        for class in LimitClass::ALL {
            for tier in Tier::ALL {
                let limit = limiter.quotas().lookup(class, tier).limit;

                for n in 1..=limit {
                    let decision = limiter.check(class, "tenant", tier).await;
                    assert!(decision.allowed, "{}/{} request {} should be allowed", class, tier, n);
                    assert_eq!(decision.remaining, limit - n);
                    assert_eq!(decision.retry_after_secs, None);
                }

                let decision = limiter.check(class, "tenant", tier).await;
                assert!(!decision.allowed, "{}/{} request {} should be denied", class, tier, limit + 1);
                assert_eq!(decision.remaining, 0);
                assert!(decision.retry_after_secs.unwrap() > 0);
            }
        }
    }

    #[tokio::test]
    async fn test_submission_free_scenario() {
        let (_, limiter) = local_limiter();

        for i in 1..=10 {
            let decision = limiter.check(LimitClass::Submission, "1.2.3.4", Tier::Free).await;
            assert!(decision.allowed, "Request {} should be allowed", i);
            assert_eq!(decision.limit, 10);
        }

        // The 11th request should be over limit
        let decision = limiter.check(LimitClass::Submission, "1.2.3.4", Tier::Free).await;
        assert!(!decision.allowed);
        let retry_after = decision.retry_after_secs.unwrap();
        assert!((59..=60).contains(&retry_after), "retry after {}", retry_after);
    }

    #[tokio::test]
    async fn test_api_pro_scenario() {
        let (_, limiter) = local_limiter();

        for _ in 0..999 {
            assert!(limiter.check(LimitClass::Api, "u1", Tier::Pro).await.allowed);
        }

        let decision = limiter.check(LimitClass::Api, "u1", Tier::Pro).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);

        let decision = limiter.check(LimitClass::Api, "u1", Tier::Pro).await;
        assert!(!decision.allowed);
        assert_eq!(decision.limit, 1000);
    }

    #[tokio::test]
    async fn test_denied_request_is_counted() {
        let (local, limiter) = local_limiter();

        for _ in 0..12 {
            limiter.check(LimitClass::Submission, "1.2.3.4", Tier::Free).await;
        }

        let key = WindowKey::new(LimitClass::Submission, Tier::Free, "1.2.3.4");
        assert_eq!(local.get(&key).unwrap().count, 12);
    }

    #[tokio::test]
    async fn test_new_window_after_reset() {
        let (local, limiter) = local_limiter();
        let key = WindowKey::new(LimitClass::Submission, Tier::Free, "1.2.3.4");

        // Exhaust a window that has since ended
        let past = Utc::now() - chrono::Duration::seconds(61);
        for _ in 0..15 {
            local.increment_at(&key, Duration::from_secs(60), past).unwrap();
        }

        let decision = limiter.check(LimitClass::Submission, "1.2.3.4", Tier::Free).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(local.get(&key).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_different_identifiers_have_separate_counters() {
        let (_, limiter) = local_limiter();

        for _ in 0..10 {
            limiter.check(LimitClass::Submission, "1.1.1.1", Tier::Free).await;
        }
        assert!(!limiter.check(LimitClass::Submission, "1.1.1.1", Tier::Free).await.allowed);

        let decision = limiter.check(LimitClass::Submission, "2.2.2.2", Tier::Free).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_unresolved_identity_shares_one_bucket() {
        let (_, limiter) = local_limiter();

        limiter.check(LimitClass::Submission, UNKNOWN_IDENTIFIER, Tier::Free).await;
        let decision = limiter.check(LimitClass::Submission, "", Tier::Free).await;

        assert_eq!(decision.remaining, 8);
    }

    #[tokio::test]
    async fn test_purge_after_tier_upgrade() {
        let (_, limiter) = local_limiter();

        for _ in 0..100 {
            limiter.check(LimitClass::Api, "u1", Tier::Free).await;
        }
        assert!(!limiter.check(LimitClass::Api, "u1", Tier::Free).await.allowed);

        limiter.purge("u1").await.unwrap();

        let decision = limiter.check(LimitClass::Api, "u1", Tier::Starter).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 499);
    }

    #[tokio::test]
    async fn test_purge_matches_checked_identifier() {
        let (local, limiter) = local_limiter();

        limiter.check(LimitClass::Api, " u1 ", Tier::Free).await;
        limiter.check(LimitClass::Api, "", Tier::Free).await;

        assert_eq!(limiter.purge(" u1 ").await.unwrap(), 1);
        assert_eq!(limiter.purge("").await.unwrap(), 1);
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entry_is_recounted() {
        let store = Arc::new(SkewedStore {
            calls: AtomicUsize::new(0),
        });
        let local = Arc::new(LocalWindowStore::new());
        let reclaimer = Reclaimer::new(local, store.clone(), 0.0);
        let limiter = RateLimiter::new(QuotaTable::default(), store.clone(), reclaimer);

        let decision = limiter.check(LimitClass::Submission, "1.2.3.4", Tier::Free).await;

        // The stale count of 50 never reaches the decision
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert!(decision.reset_at > Utc::now());
        assert!(decision.retry_after_secs.is_none());
    }

    #[tokio::test]
    async fn test_distributed_outage_falls_back_to_local() {
        let local = Arc::new(LocalWindowStore::new());
        let store = Arc::new(FallbackStore::new(Arc::new(DownStore), local.clone()));
        let reclaimer = Reclaimer::new(local.clone(), store.clone(), 0.0);
        let limiter = RateLimiter::new(QuotaTable::default(), store, reclaimer);

        let decision = limiter.check(LimitClass::Submission, "1.2.3.4", Tier::Free).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);

        for _ in 0..9 {
            limiter.check(LimitClass::Submission, "1.2.3.4", Tier::Free).await;
        }
        // Local counting still enforces the limit during the outage
        assert!(!limiter.check(LimitClass::Submission, "1.2.3.4", Tier::Free).await.allowed);

        let key = WindowKey::new(LimitClass::Submission, Tier::Free, "1.2.3.4");
        assert_eq!(local.get(&key).unwrap().count, 11);
    }

    #[tokio::test]
    async fn test_fails_open_when_nothing_can_count() {
        let local = Arc::new(LocalWindowStore::with_max_entries(1));
        local
            .increment(&WindowKey::new(LimitClass::Api, Tier::Free, "other"), Duration::from_secs(60))
            .await
            .unwrap();
        let store = Arc::new(FallbackStore::new(Arc::new(DownStore), local.clone()));
        let reclaimer = Reclaimer::new(local.clone(), store.clone(), 0.0);
        let limiter = RateLimiter::new(QuotaTable::default(), store, reclaimer);

        let decision = limiter.check(LimitClass::Api, "u1", Tier::Free).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, decision.limit);
        assert_eq!(decision.retry_after_secs, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_limit() {
        let (local, limiter) = local_limiter();
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.check(LimitClass::Submission, "9.9.9.9", Tier::Free).await
                })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 10);
        let key = WindowKey::new(LimitClass::Submission, Tier::Free, "9.9.9.9");
        assert_eq!(local.get(&key).unwrap().count, 50);
    }
}
