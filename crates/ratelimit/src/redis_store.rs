//! Redis-backed window store (requires the `redis` feature).
//!
//! One sorted set per identifier, scored by request time. The whole
//! prune/count/record step runs as a single Lua script so concurrent
//! requests from many server instances cannot overshoot the limit.

#[cfg(feature = "redis")]
mod enabled {
    use async_trait::async_trait;
    use redis::aio::MultiplexedConnection;
    use redis::Script;
    use tokio::sync::Mutex;
    use tracing::{info, warn};

    use crate::store::{WindowOutcome, WindowStore, WindowStoreError};

    const LUA_HIT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest = -1
if first[2] then oldest = tonumber(first[2]) end
if count >= limit then
  return {count, oldest, 0}
end
redis.call('ZADD', key, now, ARGV[4])
redis.call('PEXPIRE', key, window)
if oldest < 0 then oldest = now end
return {count, oldest, 1}
"#;

    pub struct RedisWindowStore {
        client: redis::Client,
        /// Reconnected lazily after a failure.
        conn: Mutex<Option<MultiplexedConnection>>,
        script: Script,
    }

    impl RedisWindowStore {
        /// Create the store without connecting; the first check connects.
        pub fn new(url: &str) -> Result<Self, WindowStoreError> {
            let client = redis::Client::open(url)
                .map_err(|e| WindowStoreError::Connection(format!("invalid Redis URL: {e}")))?;
            Ok(Self {
                client,
                conn: Mutex::new(None),
                script: Script::new(LUA_HIT),
            })
        }

        async fn connection(&self) -> Result<MultiplexedConnection, WindowStoreError> {
            let mut slot = self.conn.lock().await;
            if let Some(conn) = slot.as_ref() {
                return Ok(conn.clone());
            }
            let conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| WindowStoreError::Connection(format!("failed to connect to Redis: {e}")))?;
            info!("rate limiter connected to Redis");
            *slot = Some(conn.clone());
            Ok(conn)
        }

        async fn reset_connection(&self) {
            *self.conn.lock().await = None;
        }
    }

    #[async_trait]
    impl WindowStore for RedisWindowStore {
        async fn hit(
            &self,
            key: &str,
            now_ms: i64,
            window_ms: i64,
            limit: u32,
        ) -> Result<WindowOutcome, WindowStoreError> {
            let mut conn = self.connection().await?;
            let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
            let reply: Result<(i64, i64, i64), redis::RedisError> = self
                .script
                .key(key)
                .arg(now_ms)
                .arg(window_ms)
                .arg(limit)
                .arg(member)
                .invoke_async(&mut conn)
                .await;

            let (count, oldest, recorded) = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    if e.is_io_error() || e.is_connection_dropped() {
                        warn!(error = %e, "Redis connection lost, will reconnect");
                        self.reset_connection().await;
                    }
                    return Err(WindowStoreError::Command(e.to_string()));
                }
            };
            super::outcome_from_reply(count, oldest, recorded)
        }

        async fn ping(&self) -> Result<(), WindowStoreError> {
            let mut conn = self.connection().await?;
            let reply: Result<String, redis::RedisError> =
                redis::cmd("PING").query_async(&mut conn).await;
            if let Err(e) = reply {
                if e.is_io_error() || e.is_connection_dropped() {
                    self.reset_connection().await;
                }
                return Err(WindowStoreError::Command(e.to_string()));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "redis"
        }
    }
}

/// Map the script's `{count, oldest, recorded}` reply. `oldest` is `-1` for
/// an empty window.
#[cfg_attr(not(feature = "redis"), allow(dead_code))]
fn outcome_from_reply(
    count: i64,
    oldest: i64,
    recorded: i64,
) -> Result<crate::store::WindowOutcome, crate::store::WindowStoreError> {
    let count = u32::try_from(count).map_err(|_| {
        crate::store::WindowStoreError::Reply(format!("count out of range: {count}"))
    })?;
    if !matches!(recorded, 0 | 1) {
        return Err(crate::store::WindowStoreError::Reply(format!(
            "recorded flag out of range: {recorded}"
        )));
    }
    Ok(crate::store::WindowOutcome {
        count,
        oldest_ms: (oldest >= 0).then_some(oldest),
        recorded: recorded == 1,
    })
}

#[cfg(feature = "redis")]
pub use enabled::RedisWindowStore;

#[cfg(not(feature = "redis"))]
pub struct RedisWindowStore;

#[cfg(not(feature = "redis"))]
impl RedisWindowStore {
    pub fn new(_url: &str) -> Result<Self, crate::store::WindowStoreError> {
        Err(crate::store::WindowStoreError::Connection(
            "Redis window store requires the 'redis' Cargo feature".into(),
        ))
    }
}
