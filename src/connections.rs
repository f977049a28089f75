//! Process-wide cache of Redis connections, one per distinct configuration.
//!
//! Connections are bound to the Tokio runtime that opened them.

use crate::{
    config::RedisConfig,
    store::{RedisStore, StoreError},
};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use tokio::sync::Mutex;

static CONNECTIONS: Lazy<Mutex<HashMap<RedisConfig, RedisStore>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the shared store for `config`, connecting on first use.
///
/// The cache is not locked while connecting, so a slow host only delays its
/// own callers. When two callers race, the first stored connection wins.
pub async fn connect(config: &RedisConfig) -> Result<RedisStore, StoreError> {
    if let Some(store) = CONNECTIONS.lock().await.get(config) {
        return Ok(store.clone());
    }

    let store = RedisStore::connect(config).await?;
    let mut connections = CONNECTIONS.lock().await;
    Ok(connections.entry(config.clone()).or_insert(store).clone())
}
