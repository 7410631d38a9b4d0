//! Shared window store backed by Redis.
//!
//! Every operation is a single Lua script invocation, so concurrent callers on
//! different instances cannot interleave between reading and updating a key.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::OnceCell;
use tracing::{info, trace};

use super::store::WindowStore;
use super::window::{whole_millis, Window, WindowAlgorithm, WindowState};
use crate::error::Result;

/// Default prefix for every key this store writes.
pub const DEFAULT_KEY_PREFIX: &str = "windgate:";

/// Drop stale entries, add this attempt, trim to capacity, refresh the TTL.
/// Returns `{count_before_trim, oldest_remaining_ms}`.
const SLIDING_RECORD: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cap = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
redis.call('ZADD', key, now, member)
local count = redis.call('ZCARD', key)
if count > cap then
    redis.call('ZREMRANGEBYRANK', key, 0, count - cap - 1)
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
redis.call('PEXPIRE', key, ttl)
return {count, tonumber(oldest[2])}
"#;

/// Count live entries without touching the set.
const SLIDING_PEEK: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local floor = '(' .. (now - window)
local count = redis.call('ZCOUNT', key, floor, '+inf')
if count == 0 then
    return {0, now}
end
local oldest = redis.call('ZRANGEBYSCORE', key, floor, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
return {count, tonumber(oldest[2])}
"#;

/// Increment the window's counter, setting its expiry on first use.
const FIXED_RECORD: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return count
"#;

/// Window store shared by every instance pointing at the same Redis.
///
/// The connection is established on first use if it was not up at
/// construction, so an outage at startup is handled like any other.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    key_prefix: String,
    grace_ms: u64,
    sliding_record: Script,
    sliding_peek: Script,
    fixed_record: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("grace_ms", &self.grace_ms)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url`, failing if it cannot be reached now.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        grace: Duration,
    ) -> Result<Self> {
        let store = Self::lazy(url, key_prefix, grace)?;
        info!(key_prefix = %store.key_prefix, "Connecting to Redis window store");
        store.connection().await?;
        Ok(store)
    }

    /// Store for `url` that connects on its first operation.
    ///
    /// Only the URL is checked here. Until Redis answers, every operation
    /// fails with `StoreUnavailable` and the limiter's failure policy applies.
    pub fn lazy(url: &str, key_prefix: impl Into<String>, grace: Duration) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: OnceCell::new(),
            key_prefix: key_prefix.into(),
            grace_ms: whole_millis(grace),
            sliding_record: Script::new(SLIDING_RECORD),
            sliding_peek: Script::new(SLIDING_PEEK),
            fixed_record: Script::new(FIXED_RECORD),
        })
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.conn.initialized()
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }

    /// Key holding the sliding log for `key`.
    pub fn log_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Key holding the fixed-window counter for `key` in the window starting at `start_ms`.
    pub fn counter_key(&self, key: &str, start_ms: u64) -> String {
        format!("{}{}:{}", self.key_prefix, key, start_ms)
    }

    fn ttl_ms(&self, window: &Window) -> u64 {
        window.duration_ms.saturating_add(self.grace_ms)
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn record(&self, key: &str, now_ms: u64, window: &Window) -> Result<WindowState> {
        let mut conn = self.connection().await?;

        let state = match window.algorithm {
            WindowAlgorithm::SlidingLog => {
                let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
                let (count, oldest): (u64, u64) = self
                    .sliding_record
                    .key(self.log_key(key))
                    .arg(now_ms)
                    .arg(window.duration_ms)
                    .arg(window.log_cap())
                    .arg(member)
                    .arg(self.ttl_ms(window))
                    .invoke_async(&mut conn)
                    .await?;
                WindowState {
                    count,
                    window_start_ms: oldest,
                }
            }
            WindowAlgorithm::FixedWindow => {
                let start = window.fixed_start(now_ms);
                let count: u64 = self
                    .fixed_record
                    .key(self.counter_key(key, start))
                    .arg(self.ttl_ms(window))
                    .invoke_async(&mut conn)
                    .await?;
                WindowState {
                    count,
                    window_start_ms: start,
                }
            }
        };

        trace!(key = %key, count = state.count, "Recorded attempt in Redis");
        Ok(state)
    }

    async fn peek(&self, key: &str, now_ms: u64, window: &Window) -> Result<WindowState> {
        let mut conn = self.connection().await?;

        match window.algorithm {
            WindowAlgorithm::SlidingLog => {
                let (count, oldest): (u64, u64) = self
                    .sliding_peek
                    .key(self.log_key(key))
                    .arg(now_ms)
                    .arg(window.duration_ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(WindowState {
                    count,
                    window_start_ms: oldest,
                })
            }
            WindowAlgorithm::FixedWindow => {
                let start = window.fixed_start(now_ms);
                let count: Option<u64> = redis::cmd("GET")
                    .arg(self.counter_key(key, start))
                    .query_async(&mut conn)
                    .await?;
                Ok(WindowState {
                    count: count.unwrap_or(0),
                    window_start_ms: start,
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Connect to `REDIS_URL` (or a local server) with a key prefix unique to this run.
    async fn test_store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let prefix = format!("windgate-test:{}:", uuid::Uuid::new_v4());
        RedisStore::connect(&url, prefix, Duration::from_secs(1)).await.unwrap()
    }

    fn sliding(capacity: u64) -> Window {
        Window::new(Duration::from_secs(60), capacity, WindowAlgorithm::SlidingLog)
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisStore::connect("not-a-url", DEFAULT_KEY_PREFIX, Duration::ZERO).await;
        let err = result.unwrap_err();
        assert!(err.is_store_failure());

        assert!(RedisStore::lazy("not-a-url", DEFAULT_KEY_PREFIX, Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_lazy_store_defers_connection() {
        let store =
            RedisStore::lazy("redis://127.0.0.1:1", DEFAULT_KEY_PREFIX, Duration::ZERO).unwrap();
        assert!(!store.is_connected());

        let attempt = tokio::time::timeout(
            Duration::from_millis(200),
            store.record("ip:1.2.3.4", 1_000, &sliding(5)),
        )
        .await;
        assert!(!matches!(attempt, Ok(Ok(_))));
        assert!(!store.is_connected());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_sliding_log_record_and_peek() {
        let store = test_store().await;
        let w = sliding(3);

        for expected in 1..=3 {
            let state = store.record("ip:1.2.3.4", 10_000, &w).await.unwrap();
            assert_eq!(state.count, expected);
            assert_eq!(state.window_start_ms, 10_000);
        }
        let state = store.record("ip:1.2.3.4", 11_000, &w).await.unwrap();
        assert_eq!(state.count, 4);

        // Peeking leaves the log at capacity.
        let peeked = store.peek("ip:1.2.3.4", 11_000, &w).await.unwrap();
        assert_eq!(peeked.count, 3);
        assert_eq!(store.peek("ip:1.2.3.4", 11_000, &w).await.unwrap(), peeked);

        // Everything has aged out one window after the newest entry.
        let later = store.record("ip:1.2.3.4", 71_000, &w).await.unwrap();
        assert_eq!(later.count, 1);
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_fixed_window_record_and_peek() {
        let store = test_store().await;
        let w = Window::new(Duration::from_secs(60), 5, WindowAlgorithm::FixedWindow);

        assert_eq!(store.record("k", 60_500, &w).await.unwrap().count, 1);
        assert_eq!(store.record("k", 61_000, &w).await.unwrap().count, 2);

        let state = store.peek("k", 61_000, &w).await.unwrap();
        assert_eq!(state.count, 2);
        assert_eq!(state.window_start_ms, 60_000);
        assert_eq!(store.peek("k", 120_000, &w).await.unwrap().count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_concurrent_records_never_over_admit() {
        let store = test_store().await;
        let store = Arc::new(store);
        let w = sliding(10);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.record("storm", 5_000, &w).await.unwrap() })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|state| state.as_ref().unwrap().count <= 10)
            .count();
        assert_eq!(admitted, 10);
    }
}
