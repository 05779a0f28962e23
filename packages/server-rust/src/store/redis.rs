//! Redis-backed [`SharedStore`].
//!
//! The window check-and-increment runs as one Lua script on the Redis server,
//! so concurrent requests from any number of instances are serialized by
//! Redis itself. There is never a GET followed by a separate INCR round trip.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use super::{SharedStore, StoreError, WindowHit};

/// Check-and-increment for one fixed window.
///
/// KEYS[1] = counter key, ARGV[1] = limit, ARGV[2] = window TTL in ms.
/// Returns `{accepted, count, pttl_ms}`.
const HIT_WINDOW_LUA: &str = r"
local limit = tonumber(ARGV[1])
local ttl_ms = tonumber(ARGV[2])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= limit then
  local pttl = redis.call('PTTL', KEYS[1])
  if pttl < 0 then pttl = ttl_ms end
  return {0, current, pttl}
end
current = redis.call('INCR', KEYS[1])
local pttl = redis.call('PTTL', KEYS[1])
if pttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ttl_ms)
  pttl = ttl_ms
end
return {1, current, pttl}
";

const SCAN_BATCH: u64 = 500;

/// Shared store on a Redis server or cluster proxy.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    hit_window: Script,
    timeout: Duration,
}

impl RedisStore {
    /// Connects to `url` and prepares the window script.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!("connected to redis shared store");
        Ok(Self {
            conn,
            hit_window: Script::new(HIT_WINDOW_LUA),
            timeout,
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(unavailable(e)),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Escapes glob metacharacters so `prefix` is matched literally by SCAN.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hit_window(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowHit, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.hit_window.key(key);
        invocation.arg(limit).arg(millis(ttl));
        let reply: Vec<i64> = self.bounded(invocation.invoke_async(&mut conn)).await?;

        let [accepted, count, pttl] = reply[..] else {
            return Err(StoreError::Protocol(format!("hit_window reply {reply:?}")));
        };
        Ok(WindowHit {
            accepted: accepted == 1,
            count: count.unsigned_abs(),
            ttl: Duration::from_millis(pttl.max(0).unsigned_abs()),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("GET").arg(key).clone();
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl).max(1))
            .clone();
        self.bounded(cmd.query_async(&mut conn)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("UNLINK").arg(key).clone();
        let removed: u64 = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(removed > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let pattern = glob_escape(prefix);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let scan = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .clone();
            let (next, keys): (u64, Vec<String>) =
                self.bounded(scan.query_async(&mut conn)).await?;
            if !keys.is_empty() {
                let unlink = redis::cmd("UNLINK").arg(&keys).clone();
                let n: u64 = self.bounded(unlink.query_async(&mut conn)).await?;
                removed += n;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING").clone();
        let _: String = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }
}
