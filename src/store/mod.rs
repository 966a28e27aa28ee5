//! Counter storage shared by every limiter instance.
//!
//! The store is the only synchronization point between processes; the
//! limiter itself holds no mutable state.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Trait for counter store implementations.
///
/// Every operation targets a single key and must be atomic with respect to
/// that key. Any failure to reach the store is reported as
/// [`RatewardenError::StoreUnavailable`](crate::error::RatewardenError::StoreUnavailable).
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter, creating it at 1 (with no expiry) if absent.
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Decrement the counter, never below 0. An absent key stays absent.
    async fn decrement(&self, key: &str) -> Result<u64>;

    /// Read the counter, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Arm an expiry on a key that has none. Keys that already carry an
    /// expiry and absent keys are left untouched.
    async fn set_expiry_if_unset(&self, key: &str, seconds: u64) -> Result<()>;

    /// Seconds until the key expires, `None` if absent or without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    /// Delete the key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Read the counter and arm its expiry if unset, as one unit.
    ///
    /// Backends that can batch both steps into one round trip should
    /// override this.
    async fn get_and_arm(&self, key: &str, seconds: u64) -> Result<Option<u64>> {
        let value = self.get(key).await?;
        if value.is_some() {
            self.set_expiry_if_unset(key, seconds).await?;
        }
        Ok(value)
    }
}

/// Build the counter store selected by `config`.
///
/// Selecting Redis in a build without the `redis` feature is a
/// configuration error.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory counter store; limits are local to this process");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.url, config.command_timeout()).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(crate::error::RatewardenError::Config(format!(
            "store backend 'redis' ({}) requires building with the 'redis' feature",
            config.url
        ))),
    }
}
