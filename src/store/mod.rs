//! Backends holding the set of slot holders per limit key.
//!
//! A key maps to a hash of `holder id -> expiry timestamp`. The key itself
//! carries a TTL refreshed on every registration, so keys nobody touches any
//! more go away on their own.

use async_trait::async_trait;
use snafu::Snafu;
use std::time::Duration;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum StoreError {
    #[snafu(display("Failed to connect to Redis at {}: {}", url, source))]
    Connect {
        url: String,
        source: ::redis::RedisError,
    },
    #[snafu(display("Redis command {} failed: {}", command, source))]
    Command {
        command: &'static str,
        source: ::redis::RedisError,
    },
    #[snafu(display("Invalid key pattern {:?}: {}", pattern, source))]
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

/// Primitive operations a concurrency limit is built from.
///
/// Implementations must make [`register`](LockStore::register) atomic: the
/// count it returns includes the holder it just wrote.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Number of holders currently registered under `key`.
    async fn count(&self, key: &str) -> Result<usize, StoreError>;

    /// Registers `id` as a holder of `key`, valid until `expires_at` (UNIX
    /// seconds), refreshes the key TTL to `ttl` and returns the new holder
    /// count.
    async fn register(
        &self,
        key: &str,
        id: &str,
        expires_at: i64,
        ttl: Duration,
    ) -> Result<usize, StoreError>;

    /// Removes `id` from `key`, returning how many holders were removed.
    async fn unregister(&self, key: &str, id: &str) -> Result<usize, StoreError>;

    /// Every holder of `key` with its raw expiry value.
    async fn holders(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Keys matching a glob-style `pattern`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}
