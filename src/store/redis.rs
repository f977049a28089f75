use super::{Command, Connect, LockStore, StoreError};
use crate::{config::RedisConfig, internal_events::RedisConnected};
use ::redis::{aio::ConnectionManager, AsyncCommands, Client};
use async_trait::async_trait;
use snafu::ResultExt;
use std::{convert::TryFrom, time::Duration};

/// Limit state kept in Redis hashes.
///
/// Wraps an auto-reconnecting connection manager; clones share the
/// connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish()
    }
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let redacted = redact(config);
        let client = Client::open(config.connection_url().as_str()).context(Connect {
            url: redacted.clone(),
        })?;
        let connection = ConnectionManager::new(client).await.context(Connect {
            url: redacted.clone(),
        })?;

        emit!(RedisConnected { url: &redacted });

        Ok(Self { connection })
    }
}

/// The connection URL with credentials masked, for error messages.
fn redact(config: &RedisConfig) -> String {
    match &config.url {
        Some(url) => match url.rfind('@') {
            Some(at) => {
                let scheme_end = url.find("://").map_or(0, |i| i + 3);
                format!("{}***{}", &url[..scheme_end], &url[at..])
            }
            None => url.clone(),
        },
        None => format!("redis://{}:{}/{}", config.host, config.port, config.db),
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn count(&self, key: &str) -> Result<usize, StoreError> {
        let mut connection = self.connection.clone();
        connection.hlen(key).await.context(Command { command: "HLEN" })
    }

    async fn register(
        &self,
        key: &str,
        id: &str,
        expires_at: i64,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        let mut connection = self.connection.clone();
        let ttl = usize::try_from(ttl.as_secs().max(1)).unwrap_or(usize::MAX);
        let (count,): (usize,) = ::redis::pipe()
            .atomic()
            .hset(key, id, expires_at)
            .ignore()
            .expire(key, ttl)
            .ignore()
            .hlen(key)
            .query_async(&mut connection)
            .await
            .context(Command { command: "MULTI" })?;
        Ok(count)
    }

    async fn unregister(&self, key: &str, id: &str) -> Result<usize, StoreError> {
        let mut connection = self.connection.clone();
        connection.hdel(key, id).await.context(Command { command: "HDEL" })
    }

    async fn holders(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut connection = self.connection.clone();
        let mut iter = connection
            .hscan::<_, (Vec<u8>, Vec<u8>)>(key)
            .await
            .context(Command { command: "HSCAN" })?;

        let mut holders = Vec::new();
        while let Some((id, value)) = iter.next_item().await {
            holders.push((
                String::from_utf8_lossy(&id).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }
        Ok(holders)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut connection = self.connection.clone();
        let mut iter = connection
            .scan_match::<_, String>(pattern)
            .await
            .context(Command { command: "SCAN" })?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
