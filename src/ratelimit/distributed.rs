//! Distributed window store backed by Redis.
//!
//! Counters are shared by every instance talking to the same Redis server.
//! Window expiry is delegated to Redis key TTLs, so this store never needs
//! sweeping.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use tracing::{debug, trace};

use super::key::WindowKey;
use super::quota::{LimitClass, Tier};
use super::store::{CounterEntry, StoreError, WindowStore};
use crate::error::{FormguardError, Result};

/// Default prefix for every counter key written to Redis.
pub const DEFAULT_KEY_PREFIX: &str = "formguard:ratelimit:";
/// Default bound on one Redis round trip, including connecting.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

const BACKEND: &str = "redis";

/// Open the window if absent, count the request, and report the TTL left.
///
/// KEYS[1] = counter key, ARGV[1] = window length in milliseconds.
const INCREMENT_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], 0, 'PX', ARGV[1], 'NX')
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// A window store whose counters live in Redis.
pub struct RedisWindowStore {
    client: redis::Client,
    /// Cached multiplexed connection, dropped after any failure
    connection: Mutex<Option<MultiplexedConnection>>,
    script: redis::Script,
    key_prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisWindowStore {
    /// Create a store with the default key prefix and timeout.
    ///
    /// No connection is made until the first command.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_options(url, DEFAULT_KEY_PREFIX, DEFAULT_TIMEOUT)
    }

    /// Create a store with an explicit key prefix and round-trip timeout.
    pub fn with_options(url: &str, key_prefix: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| FormguardError::Config(format!("Invalid redis URL: {}", e)))?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            script: redis::Script::new(INCREMENT_SCRIPT),
            key_prefix: key_prefix.to_string(),
            timeout,
        })
    }

    /// Get the cached connection or open a new one.
    async fn connection(&self) -> std::result::Result<MultiplexedConnection, StoreError> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        debug!("Connected to redis");

        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// Run a Redis operation under the round-trip timeout.
    ///
    /// Any failure drops the cached connection so the next call reconnects.
    async fn bounded<T, F>(&self, op: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        let result = match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                backend: BACKEND,
                timeout: self.timeout,
            }),
        };

        if result.is_err() {
            self.connection.lock().take();
        }
        result
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable {
        backend: BACKEND,
        reason: e.to_string(),
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn increment(
        &self,
        key: &WindowKey,
        window: Duration,
    ) -> std::result::Result<CounterEntry, StoreError> {
        let redis_key = key.to_prefixed(&self.key_prefix);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        let (count, ttl_ms) = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let reply: (u64, i64) = self
                    .script
                    .key(&redis_key)
                    .arg(window_ms)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                Ok(reply)
            })
            .await?;

        trace!(key = %redis_key, count = count, ttl_ms = ttl_ms, "Incremented redis counter");

        let ttl_ms = if ttl_ms > 0 { ttl_ms } else { window_ms };
        Ok(CounterEntry {
            count,
            reset_at: Utc::now() + chrono::Duration::milliseconds(ttl_ms),
        })
    }

    async fn purge(&self, identifier: &str) -> std::result::Result<usize, StoreError> {
        let mut keys = Vec::with_capacity(LimitClass::ALL.len() * Tier::ALL.len());
        for class in LimitClass::ALL {
            for tier in Tier::ALL {
                keys.push(WindowKey::new(class, tier, identifier).to_prefixed(&self.key_prefix));
            }
        }

        self.bounded(async {
            let mut conn = self.connection().await?;
            let removed: usize = redis::cmd("DEL")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(removed)
        })
        .await
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}
