//! Redis-backed window store.
//!
//! Each key is a sorted set scored by unix milliseconds. Both the admit and
//! the usage paths run as Lua scripts, so purge, count and insert happen as
//! one step on the server.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Script;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ttl_millis, Admission, Usage, WindowStore};
use crate::error::{Result, TollgateError};

/// KEYS[1] = set key
/// ARGV = limit, window start (ms), now (ms), member, ttl (ms)
/// Returns {allowed (0|1), count}.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_start = ARGV[2]
local now = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. window_start)
local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, ttl)
    return {1, count + 1}
end
return {0, count}
"#;

/// KEYS[1] = set key
/// ARGV = window start (ms)
/// Returns {count} or {count, oldest score}.
const USAGE_SCRIPT: &str = r#"
local key = KEYS[1]
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. ARGV[1])
local count = redis.call('ZCARD', key)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    return {count, tonumber(oldest[2])}
end
return {count}
"#;

/// Window store talking to a Redis-compatible server.
pub struct RedisWindowStore {
    connection: ConnectionManager,
    admit: Script,
    usage: Script,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore").finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Connect to the server at `url` and verify it answers a PING.
    ///
    /// `timeout` bounds connecting as well as every later response.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(timeout_ms = timeout.as_millis() as u64, "Connecting to coordination backend");

        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Invalid coordination backend URL");
            TollgateError::Config(format!("invalid redis url: {}", e))
        })?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(timeout)
            .set_response_timeout(timeout)
            .set_number_of_retries(1);

        let connection = tokio::time::timeout(
            timeout,
            ConnectionManager::new_with_config(client, manager_config),
        )
        .await
        .map_err(|_| TollgateError::Timeout(timeout))??;

        let store = Self {
            connection,
            admit: Script::new(ADMIT_SCRIPT),
            usage: Script::new(USAGE_SCRIPT),
        };
        store.ping().await?;

        info!("Connected to coordination backend");
        Ok(store)
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn admit(
        &self,
        key: &str,
        limit: u64,
        window_start_ms: i64,
        now_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<Admission> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl_millis(ttl);

        let (allowed, count): (i64, u64) = self
            .admit
            .key(key)
            .arg(limit)
            .arg(window_start_ms)
            .arg(now_ms)
            .arg(member)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(Admission {
            allowed: allowed == 1,
            count,
        })
    }

    async fn usage(&self, key: &str, window_start_ms: i64, _now_ms: i64) -> Result<Usage> {
        let mut conn = self.connection.clone();

        let reply: Vec<i64> = self
            .usage
            .key(key)
            .arg(window_start_ms)
            .invoke_async(&mut conn)
            .await?;

        let count = reply.first().copied().unwrap_or(0).max(0) as u64;
        Ok(Usage {
            count,
            oldest_ms: reply.get(1).copied(),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        debug!(key = %key, removed = removed, "Deleted usage record");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(TollgateError::Unavailable(format!(
                "unexpected PING reply: {}",
                pong
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let err = RedisWindowStore::connect("not a url", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_construction() {
        // Port 1 is never a Redis server.
        let result = RedisWindowStore::connect("redis://127.0.0.1:1/", Duration::from_millis(300)).await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_scripts_purge_before_counting() {
        let purge = ADMIT_SCRIPT.find("ZREMRANGEBYSCORE").unwrap();
        let count = ADMIT_SCRIPT.find("ZCARD").unwrap();
        let insert = ADMIT_SCRIPT.find("ZADD").unwrap();
        assert!(purge < count && count < insert);
        assert!(!USAGE_SCRIPT.contains("ZADD"));
    }
}
