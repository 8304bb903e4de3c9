//! Window store trait for abstracting local and distributed counters.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::key::WindowKey;

/// State of one fixed-window counter after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

impl CounterEntry {
    /// Whether the window has already ended at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reset_at <= now
    }
}

/// Errors a window store can report.
///
/// None of these reach request handling: the decision engine falls back to
/// the local store or fails open.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service could not be reached or rejected the command
    #[error("{backend} store unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },

    /// The backing service did not answer in time
    #[error("{backend} store timed out after {timeout:?}")]
    Timeout {
        backend: &'static str,
        timeout: Duration,
    },

    /// The local store is full even after reclaiming expired entries
    #[error("local store full ({0} entries)")]
    Capacity(usize),
}

/// Trait for window store implementations.
///
/// Implementations must make `increment` atomic per key: concurrent callers
/// on one key never lose an update and never both start a new window.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Count one request against `key`.
    ///
    /// Starts a new window of length `window` when no live entry exists,
    /// otherwise increments the live entry. Returns the entry after the
    /// increment.
    async fn increment(&self, key: &WindowKey, window: Duration) -> Result<CounterEntry, StoreError>;

    /// Remove every counter belonging to `identifier`, returning how many
    /// were removed.
    async fn purge(&self, identifier: &str) -> Result<usize, StoreError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
