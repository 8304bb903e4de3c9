//! Rate limiting logic and state management.

mod fallback;
mod key;
mod limiter;
mod local;
mod quota;
mod reclaimer;
mod distributed;
mod store;

pub use fallback::{FallbackStore, PrimaryState, DEFAULT_RETRY_AFTER};
pub use key::{normalize_identifier, WindowKey, UNKNOWN_IDENTIFIER};
pub use limiter::{Decision, RateLimiter};
pub use local::{LocalWindowStore, DEFAULT_MAX_ENTRIES};
pub use quota::{LimitClass, QuotaOverrides, QuotaRow, QuotaTable, Tier, UnknownTier, MIN_WINDOW_MS};
pub use reclaimer::{Reclaimer, DEFAULT_SWEEP_PROBABILITY};
pub use distributed::{RedisWindowStore, DEFAULT_KEY_PREFIX, DEFAULT_TIMEOUT};
pub use store::{CounterEntry, StoreError, WindowStore};
