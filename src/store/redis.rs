//! Redis-backed counter store.
//!
//! Every limiter process pointing at the same Redis shares counters, which
//! is what makes the limiter distributed. Each command is bounded by the
//! configured command timeout.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::CounterStore;
use crate::error::{RatewardenError, Result};

/// Read the counter and arm its expiry if the key exists without one.
const GET_AND_ARM: &str = r#"
local value = redis.call('GET', KEYS[1])
if value and redis.call('TTL', KEYS[1]) == -1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

/// Arm an expiry only on an existing key without one.
const EXPIRE_IF_UNSET: &str = r#"
if redis.call('TTL', KEYS[1]) == -1 then
  return redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return 0
"#;

/// Decrement an existing positive counter; never creates the key.
const DECREMENT_EXISTING: &str = r#"
local value = redis.call('GET', KEYS[1])
if not value or tonumber(value) <= 0 then
  return 0
end
return redis.call('DECR', KEYS[1])
"#;

/// A counter store backed by a Redis server.
pub struct RedisStore {
    conn: ConnectionManager,
    command_timeout: Duration,
    get_and_arm: Script,
    expire_if_unset: Script,
    decrement_existing: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RatewardenError::Config(format!("Invalid Redis URL '{}': {}", url, e)))?;

        let conn = match tokio::time::timeout(command_timeout, ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(unavailable("connect", e)),
            Err(_) => {
                return Err(RatewardenError::StoreUnavailable(format!(
                    "connect timed out after {:?}",
                    command_timeout
                )))
            }
        };

        info!(url = %url, timeout = ?command_timeout, "Connected to Redis counter store");

        Ok(Self {
            conn,
            command_timeout,
            get_and_arm: Script::new(GET_AND_ARM),
            expire_if_unset: Script::new(EXPIRE_IF_UNSET),
            decrement_existing: Script::new(DECREMENT_EXISTING),
        })
    }

    /// Run one command under the command timeout.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(unavailable(op, e)),
            Err(_) => {
                debug!(op = op, timeout = ?self.command_timeout, "Redis command timed out");
                Err(RatewardenError::StoreUnavailable(format!(
                    "{} timed out after {:?}",
                    op, self.command_timeout
                )))
            }
        }
    }
}

fn unavailable(op: &str, e: RedisError) -> RatewardenError {
    RatewardenError::StoreUnavailable(format!("{} failed: {}", op, e))
}

/// Map a Redis TTL reply (-2 absent, -1 no expiry) to seconds remaining.
fn ttl_from_reply(reply: i64) -> Option<u64> {
    u64::try_from(reply).ok()
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        self.run("INCR", async move { conn.incr::<_, _, u64>(key, 1u64).await })
            .await
    }

    async fn decrement(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let invocation = self.decrement_existing.key(key);
        self.run("DECR", async move { invocation.invoke_async::<_, u64>(&mut conn).await })
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        self.run("GET", async move { conn.get::<_, Option<u64>>(key).await })
            .await
    }

    async fn set_expiry_if_unset(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut invocation = self.expire_if_unset.key(key);
        invocation.arg(seconds);
        let _: i64 = self
            .run("EXPIRE", async move { invocation.invoke_async::<_, i64>(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let reply = self
            .run("TTL", async move { conn.ttl::<_, i64>(key).await })
            .await?;
        Ok(ttl_from_reply(reply))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed = self
            .run("DEL", async move { conn.del::<_, u64>(key).await })
            .await?;
        Ok(removed > 0)
    }

    async fn get_and_arm(&self, key: &str, seconds: u64) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.get_and_arm.key(key);
        invocation.arg(seconds);
        self.run("GET+EXPIRE", async move {
            invocation.invoke_async::<_, Option<u64>>(&mut conn).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_reply_mapping() {
        assert_eq!(ttl_from_reply(-2), None);
        assert_eq!(ttl_from_reply(-1), None);
        assert_eq!(ttl_from_reply(0), Some(0));
        assert_eq!(ttl_from_reply(42), Some(42));
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let result = RedisStore::connect("not a url", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RatewardenError::Config(_))));
    }

    fn test_url() -> Option<String> {
        std::env::var("RATEWARDEN_TEST_REDIS_URL").ok()
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at RATEWARDEN_TEST_REDIS_URL"]
    async fn test_redis_counter_lifecycle() {
        let Some(url) = test_url() else { return };
        let store = RedisStore::connect(&url, Duration::from_secs(1)).await.unwrap();
        let key = "ratewarden-test:lifecycle";
        store.delete(key).await.unwrap();

        assert_eq!(store.get_and_arm(key, 60).await.unwrap(), None);
        assert_eq!(store.increment(key).await.unwrap(), 1);
        assert_eq!(store.ttl(key).await.unwrap(), None);

        assert_eq!(store.get_and_arm(key, 60).await.unwrap(), Some(1));
        let ttl = store.ttl(key).await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 60);

        store.set_expiry_if_unset(key, 5).await.unwrap();
        assert!(store.ttl(key).await.unwrap().unwrap() > 5);

        assert_eq!(store.decrement(key).await.unwrap(), 0);
        assert_eq!(store.decrement(key).await.unwrap(), 0);
        assert!(store.delete(key).await.unwrap());
        assert!(!store.delete(key).await.unwrap());
        assert_eq!(store.decrement(key).await.unwrap(), 0);
        assert_eq!(store.get(key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires an unreachable address to time out"]
    async fn test_unreachable_server_is_unavailable() {
        let result = RedisStore::connect("redis://10.255.255.1:6379", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(RatewardenError::StoreUnavailable(_))));
    }
}
