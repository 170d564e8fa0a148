//! Redis-backed [`SharedStore`].
//!
//! Multi-step operations (compare-and-swap, windowed increment, drain and
//! token-bucket take) run as Lua scripts so they stay atomic across engine
//! instances.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};

use super::{SharedStore, StoreError, StoreResult, TokenBucket};

const COMPARE_AND_SWAP: &str = r"
local current = redis.call('GET', KEYS[1])
local matches
if ARGV[1] == '0' then
  matches = (current == false)
else
  matches = (current == ARGV[2])
end
if not matches then
  return 0
end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
";

const INCREMENT_WINDOW: &str = r"
local value = redis.call('INCR', KEYS[1])
if value == 1 and tonumber(ARGV[1]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
";

const DRAIN: &str = r"
local items = redis.call('LRANGE', KEYS[1], 0, -1)
redis.call('DEL', KEYS[1])
return items
";

const TAKE_TOKENS: &str = r"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end
local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + (elapsed / 1000.0) * refill)
last = math.max(now, last)
local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill_ms', tostring(last))
redis.call('PEXPIRE', KEYS[1], ttl)
return allowed
";

/// [`SharedStore`] over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisSharedStore {
    conn: ConnectionManager,
    compare_and_swap: Script,
    increment_window: Script,
    drain: Script,
    take_tokens: Script,
}

impl std::fmt::Debug for RedisSharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedStore").finish_non_exhaustive()
    }
}

impl RedisSharedStore {
    /// Connects to `url` and keeps the connection alive with automatic
    /// reconnects.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the URL is invalid or the first
    /// connection fails.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self {
            conn,
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            increment_window: Script::new(INCREMENT_WINDOW),
            drain: Script::new(DRAIN),
            take_tokens: Script::new(TAKE_TOKENS),
        })
    }
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(error: redis::RedisError) -> StoreError {
    StoreError::unavailable(error.to_string())
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map_or(0, |ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
}

#[async_trait]
impl SharedStore for RedisSharedStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl.is_some() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let () = cmd.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if ttl.is_some() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(swapped == 1)
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        self.increment_window
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(unavailable)
    }

    async fn push(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        conn.rpush(key, value).await.map_err(unavailable)
    }

    async fn range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(key, 0, -1).await.map_err(unavailable)
    }

    async fn drain(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.drain.key(key).invoke_async(&mut conn).await.map_err(unavailable)
    }

    async fn restore(&self, key: &str, values: &[String]) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        if values.is_empty() {
            return conn.llen(key).await.map_err(unavailable);
        }
        // LPUSH inserts one by one at the head, so push in reverse.
        let reversed: Vec<&str> = values.iter().rev().map(String::as_str).collect();
        conn.lpush(key, reversed).await.map_err(unavailable)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn take_tokens(&self, key: &str, bucket: TokenBucket, now_ms: i64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let allowed: i64 = self
            .take_tokens
            .key(key)
            .arg(bucket.capacity)
            .arg(bucket.refill_per_second)
            .arg(bucket.cost)
            .arg(now_ms)
            .arg(ttl_millis(Some(bucket.idle_ttl())))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(allowed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_rounded_up_to_one_millisecond() {
        assert_eq!(ttl_millis(None), 0);
        assert_eq!(ttl_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(ttl_millis(Some(Duration::from_secs(2))), 2_000);
    }
}
