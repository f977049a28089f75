//! Run scoped work under a concurrency limit shared through a [`LockStore`].
//!
//! Every holder of a slot is a field of the hash named by the limit key. A
//! holder registers itself, re-reads the number of holders, and backs off
//! again if it pushed the hash over the limit. Stale holders, left behind by
//! processes that died while holding a slot, are dropped by
//! [`ConcurrencyLimit::clean`] or disappear with the key TTL.

use crate::{
    config::{LimitConfig, RedisConfig},
    connections,
    internal_events::{SlotAcquired, SlotRejected, SlotWaitTimedOut, StaleSlotsCleaned},
    store::{LockStore, RedisStore, StoreError},
};
use chrono::Utc;
use snafu::{ResultExt, Snafu};
use std::{convert::TryFrom, future::Future, sync::Arc, time::Duration};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

mod slot;

use slot::PendingHolder;
pub use slot::Slot;

#[derive(Debug, Snafu)]
pub enum LimitError {
    #[snafu(display("Invalid limit configuration: {}", errors.join("; ")))]
    InvalidConfig { errors: Vec<String> },
    #[snafu(display(
        "Concurrency limit of {} for key {:?} exceeded, gave up after {:?}",
        limit,
        key,
        timeout
    ))]
    LimitExceeded {
        key: String,
        limit: usize,
        timeout: Duration,
    },
    #[snafu(display("{}", source))]
    Store { source: StoreError },
}

impl LimitError {
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, LimitError::LimitExceeded { .. })
    }
}

/// A concurrency limit: at most `limit` slots of `key` are held at a time,
/// across every process sharing the store.
#[derive(Debug)]
pub struct ConcurrencyLimit<S> {
    store: Arc<S>,
    config: LimitConfig,
}

impl ConcurrencyLimit<RedisStore> {
    /// Builds a limit on the cached Redis connection for `redis`.
    pub async fn connect(redis: &RedisConfig, config: LimitConfig) -> Result<Self, LimitError> {
        let store = connections::connect(redis).await.context(Store)?;
        Self::new(store, config)
    }
}

impl<S> ConcurrencyLimit<S>
where
    S: LockStore + 'static,
{
    pub fn new(store: S, config: LimitConfig) -> Result<Self, LimitError> {
        config
            .validate()
            .map_err(|errors| LimitError::InvalidConfig { errors })?;
        Ok(Self {
            store: Arc::new(store),
            config,
        })
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Waits for a free slot.
    ///
    /// Retries every `interval` until a slot is free, failing with
    /// [`LimitError::LimitExceeded`] once a failed attempt happens more than
    /// `timeout` after the first one. The holder is always removed again when
    /// acquisition fails, and in the background when the returned future is
    /// dropped before completing.
    pub async fn acquire(&self) -> Result<Slot<S>, LimitError> {
        let start = Instant::now();
        let holder = self.pending_holder();
        let result = self.acquire_as(holder.id(), start).await;
        self.finish(holder, start, result).await
    }

    /// Like [`acquire`](Self::acquire), but gives up as soon as `cancel`
    /// completes, returning `None` once the holder is removed again.
    pub async fn acquire_until<F>(&self, cancel: F) -> Result<Option<Slot<S>>, LimitError>
    where
        F: Future,
    {
        let start = Instant::now();
        let holder = self.pending_holder();
        let result = tokio::select! {
            result = self.acquire_as(holder.id(), start) => Some(result),
            _ = cancel => None,
        };

        match result {
            Some(result) => self.finish(holder, start, result).await.map(Some),
            None => {
                debug!(message = "Acquisition cancelled.", key = %self.config.key);
                holder.discard().await;
                Ok(None)
            }
        }
    }

    fn pending_holder(&self) -> PendingHolder<S> {
        PendingHolder::new(
            Arc::clone(&self.store),
            self.config.key.clone(),
            Uuid::new_v4().to_hyphenated().to_string(),
        )
    }

    async fn finish(
        &self,
        holder: PendingHolder<S>,
        start: Instant,
        result: Result<usize, LimitError>,
    ) -> Result<Slot<S>, LimitError> {
        match result {
            Ok(count) => {
                emit!(SlotAcquired {
                    key: &self.config.key,
                    id: holder.id(),
                    count,
                    limit: self.config.limit,
                    waited: start.elapsed(),
                });
                Ok(holder.into_slot(count))
            }
            Err(error) => {
                holder.discard().await;
                Err(error)
            }
        }
    }

    async fn acquire_as(&self, id: &str, start: Instant) -> Result<usize, LimitError> {
        let timeout = self.config.timeout();
        let interval = self.config.interval();

        loop {
            if let Some(count) = self.try_register(id).await.context(Store)? {
                return Ok(count);
            }

            if start.elapsed() > timeout {
                emit!(SlotWaitTimedOut {
                    key: &self.config.key,
                    limit: self.config.limit,
                    timeout,
                });
                return Err(LimitError::LimitExceeded {
                    key: self.config.key.clone(),
                    limit: self.config.limit,
                    timeout,
                });
            }

            sleep(interval).await;
        }
    }

    /// One acquisition attempt. `None` when the limit is reached.
    async fn try_register(&self, id: &str) -> Result<Option<usize>, StoreError> {
        let key = &self.config.key;
        let limit = self.config.limit;

        // No point in writing the holder when the hash is already full.
        let count = self.store.count(key).await?;
        if count >= limit {
            emit!(SlotRejected { key, count, limit });
            return Ok(None);
        }

        let expires_at = i64::try_from(self.config.expire_secs)
            .ok()
            .and_then(|expire| Utc::now().timestamp().checked_add(expire))
            .unwrap_or(i64::MAX);
        let count = self
            .store
            .register(key, id, expires_at, self.config.expire())
            .await?;

        // Somebody else registered in between.
        if count > limit {
            self.store.unregister(key, id).await?;
            emit!(SlotRejected { key, count, limit });
            return Ok(None);
        }

        Ok(Some(count))
    }

    /// Runs `f` while holding a slot, passing it the number of holders seen
    /// right after acquisition.
    ///
    /// The slot is released once the future completes, whatever it returns.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T, LimitError>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = self.acquire().await?;
        let output = f(slot.count()).await;
        // A failed release is reported by the slot; the holder expires anyway.
        let _ = slot.release().await;
        Ok(output)
    }

    /// Removes holders whose expiry has passed or is unreadable.
    ///
    /// Returns the number of holders removed.
    pub async fn clean(&self) -> Result<usize, LimitError> {
        let key = &self.config.key;
        let now = Utc::now().timestamp();

        let mut removed = 0;
        for (id, value) in self.store.holders(key).await.context(Store)? {
            let stale = value
                .trim()
                .parse::<i64>()
                .map_or(true, |expires_at| now >= expires_at);
            if stale {
                removed += self.store.unregister(key, &id).await.context(Store)?;
            }
        }

        emit!(StaleSlotsCleaned {
            key,
            count: removed,
        });
        Ok(removed)
    }
}

/// Limit keys in `store` matching the glob-style `pattern`.
pub async fn keys<S>(store: &S, pattern: &str) -> Result<Vec<String>, LimitError>
where
    S: LockStore + ?Sized,
{
    store.keys(pattern).await.context(Store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limit_config(key: &str, limit: usize) -> LimitConfig {
        LimitConfig::new(key, limit)
            .with_timeout(Duration::from_secs(5))
            .with_interval(Duration::from_millis(100))
    }

    fn memory_limit(store: &MemoryStore, limit: usize) -> ConcurrencyLimit<MemoryStore> {
        ConcurrencyLimit::new(store.clone(), limit_config("jobs", limit)).unwrap()
    }

    #[tokio::test]
    async fn acquires_up_to_the_limit() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 2);

        let first = limit.acquire().await.unwrap();
        let second = limit.acquire().await.unwrap();
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 2);
        assert_ne!(first.id(), second.id());
        assert_eq!(first.key(), "jobs");
        assert_eq!(store.count("jobs").await.unwrap(), 2);

        first.release().await.unwrap();
        assert_eq!(store.count("jobs").await.unwrap(), 1);
        second.release().await.unwrap();
        assert_eq!(store.count("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn holder_value_is_expiry_timestamp() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 1);

        let before = Utc::now().timestamp();
        let slot = limit.acquire().await.unwrap();
        let holders = store.holders("jobs").await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].0, slot.id());

        let expires_at = holders[0].1.parse::<i64>().unwrap();
        assert!(expires_at >= before + 30);
        assert!(expires_at <= Utc::now().timestamp() + 30);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_a_release() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 1);

        let held = limit.acquire().await.unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            held.release().await.unwrap();
        });

        let start = Instant::now();
        let slot = limit.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(slot.count(), 1);
    }

    #[tokio::test]
    async fn acquire_is_pending_while_full() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 1);

        let held = limit.acquire().await.unwrap();
        let mut waiting = tokio_test::task::spawn(limit.acquire());
        tokio_test::assert_pending!(waiting.poll());
        assert_eq!(store.count("jobs").await.unwrap(), 1);

        drop(waiting);
        held.release().await.unwrap();
        assert_eq!(store.count("jobs").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let store = MemoryStore::new();
        let limit = ConcurrencyLimit::new(
            store.clone(),
            limit_config("jobs", 1).with_timeout(Duration::from_secs(1)),
        )
        .unwrap();

        let _held = limit.acquire().await.unwrap();

        let start = Instant::now();
        let error = limit.acquire().await.unwrap_err();
        assert!(error.is_limit_exceeded(), "{}", error);
        assert!(start.elapsed() > Duration::from_secs(1));
        assert_eq!(
            error.to_string(),
            "Concurrency limit of 1 for key \"jobs\" exceeded, gave up after 1s"
        );
        assert_eq!(store.count("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn limits_are_independent_per_key() {
        let store = MemoryStore::new();
        let reports = ConcurrencyLimit::new(store.clone(), limit_config("reports", 1)).unwrap();
        let exports = ConcurrencyLimit::new(store.clone(), limit_config("exports", 1)).unwrap();

        let _report = reports.acquire().await.unwrap();
        let export = exports.acquire().await.unwrap();
        assert_eq!(export.count(), 1);
    }

    /// Pretends the hash is always empty, so every attempt races.
    #[derive(Debug, Default)]
    struct RacyStore {
        inner: MemoryStore,
        unregistered: AtomicUsize,
    }

    #[async_trait]
    impl LockStore for RacyStore {
        async fn count(&self, _key: &str) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn register(
            &self,
            key: &str,
            id: &str,
            expires_at: i64,
            ttl: Duration,
        ) -> Result<usize, StoreError> {
            self.inner.register(key, id, expires_at, ttl).await
        }

        async fn unregister(&self, key: &str, id: &str) -> Result<usize, StoreError> {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            self.inner.unregister(key, id).await
        }

        async fn holders(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
            self.inner.holders(key).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(pattern).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_when_registration_overshoots() {
        let store = RacyStore::default();
        store
            .inner
            .register("jobs", "other", i64::MAX, Duration::from_secs(30))
            .await
            .unwrap();

        let limit = ConcurrencyLimit::new(
            store,
            limit_config("jobs", 1).with_timeout(Duration::from_millis(250)),
        )
        .unwrap();

        let error = limit.acquire().await.unwrap_err();
        assert!(error.is_limit_exceeded());

        let store = limit.store();
        assert_eq!(store.inner.count("jobs").await.unwrap(), 1);
        assert_eq!(
            store.inner.holders("jobs").await.unwrap()[0].0,
            "other".to_owned()
        );
        // One undo per attempt at 0, 100, 200 and 300ms, plus the final cleanup.
        assert_eq!(store.unregistered.load(Ordering::SeqCst), 5);
    }

    /// Writes the holder right away but takes a while to reply.
    #[derive(Debug, Default)]
    struct SlowReplyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl LockStore for SlowReplyStore {
        async fn count(&self, key: &str) -> Result<usize, StoreError> {
            self.inner.count(key).await
        }

        async fn register(
            &self,
            key: &str,
            id: &str,
            expires_at: i64,
            ttl: Duration,
        ) -> Result<usize, StoreError> {
            let count = self.inner.register(key, id, expires_at, ttl).await?;
            sleep(Duration::from_millis(50)).await;
            Ok(count)
        }

        async fn unregister(&self, key: &str, id: &str) -> Result<usize, StoreError> {
            self.inner.unregister(key, id).await
        }

        async fn holders(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
            self.inner.holders(key).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(pattern).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_removes_its_holder() {
        let store = SlowReplyStore::default();
        let inner = store.inner.clone();
        let limit = ConcurrencyLimit::new(store, limit_config("jobs", 1)).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(10), limit.acquire()).await;
        assert!(result.is_err());

        for _ in 0..10 {
            if inner.count("jobs").await.unwrap() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(inner.count("jobs").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_until_removes_the_holder_before_returning() {
        let store = SlowReplyStore::default();
        let inner = store.inner.clone();
        let limit = ConcurrencyLimit::new(store, limit_config("jobs", 1)).unwrap();

        let slot = limit
            .acquire_until(sleep(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(slot.is_none());
        assert_eq!(inner.count("jobs").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_until_waits_for_a_slot() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 1);

        let held = limit.acquire().await.unwrap();
        let cancelled = limit
            .acquire_until(sleep(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(cancelled.is_none());
        assert_eq!(store.count("jobs").await.unwrap(), 1);

        held.release().await.unwrap();
        let slot = limit
            .acquire_until(sleep(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot.count(), 1);
    }

    #[tokio::test]
    async fn far_expiry_is_not_written_as_stale() {
        let store = MemoryStore::new();
        let mut config = limit_config("jobs", 1);
        config.expire_secs = crate::config::MAX_SECS;
        let limit = ConcurrencyLimit::new(store.clone(), config).unwrap();

        let _slot = limit.acquire().await.unwrap();
        let expires_at = store.holders("jobs").await.unwrap()[0]
            .1
            .parse::<i64>()
            .unwrap();
        assert!(expires_at > Utc::now().timestamp());
        assert_eq!(limit.clean().await.unwrap(), 0);
    }

    /// Every write fails.
    #[derive(Debug, Default)]
    struct BrokenStore {
        unregistered: AtomicUsize,
    }

    fn broken() -> StoreError {
        StoreError::Command {
            command: "HSET",
            source: redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")),
        }
    }

    #[async_trait]
    impl LockStore for BrokenStore {
        async fn count(&self, _key: &str) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn register(
            &self,
            _key: &str,
            _id: &str,
            _expires_at: i64,
            _ttl: Duration,
        ) -> Result<usize, StoreError> {
            Err(broken())
        }

        async fn unregister(&self, _key: &str, _id: &str) -> Result<usize, StoreError> {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            Err(broken())
        }

        async fn holders(&self, _key: &str) -> Result<Vec<(String, String)>, StoreError> {
            Err(broken())
        }

        async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
            Err(broken())
        }
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let limit = ConcurrencyLimit::new(BrokenStore::default(), limit_config("jobs", 1)).unwrap();

        let error = limit.acquire().await.unwrap_err();
        assert!(matches!(error, LimitError::Store { .. }), "{:?}", error);
        assert!(error.to_string().starts_with("Redis command HSET failed"));
        assert_eq!(limit.store().unregistered.load(Ordering::SeqCst), 1);

        assert!(matches!(
            limit.clean().await.unwrap_err(),
            LimitError::Store { .. }
        ));
        assert!(keys(limit.store(), "*").await.is_err());
    }

    #[tokio::test]
    async fn run_releases_the_slot() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 1);

        let output = limit
            .run(|count| async move {
                assert_eq!(count, 1);
                count * 10
            })
            .await
            .unwrap();
        assert_eq!(output, 10);
        assert_eq!(store.count("jobs").await.unwrap(), 0);

        let output: Result<(), &str> = limit.run(|_| async { Err("boom") }).await.unwrap();
        assert_eq!(output, Err("boom"));
        assert_eq!(store.count("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_holds_the_slot_while_running() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 1);

        let seen = limit
            .run(|_| async { store.count("jobs").await.unwrap() })
            .await
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn dropped_slot_is_released() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 1);

        drop(limit.acquire().await.unwrap());

        for _ in 0..10 {
            if store.count("jobs").await.unwrap() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.count("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clean_removes_stale_holders() {
        let store = MemoryStore::new();
        let limit = memory_limit(&store, 5);

        let live = limit.acquire().await.unwrap();
        store.insert_raw("jobs", "expired", "1");
        store.insert_raw("jobs", "garbage", "not-a-timestamp");
        store.insert_raw("jobs", "fractional", "99999999999.5");
        store.insert_raw(
            "jobs",
            "padded",
            &format!(" {} ", Utc::now().timestamp() + 600),
        );

        assert_eq!(limit.clean().await.unwrap(), 3);

        let mut remaining = store
            .holders("jobs")
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        remaining.sort();
        let mut expected = vec![live.id().to_owned(), "padded".to_owned()];
        expected.sort();
        assert_eq!(remaining, expected);

        assert_eq!(limit.clean().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clean_frees_slots_for_new_holders() {
        let store = MemoryStore::new();
        let limit = ConcurrencyLimit::new(
            store.clone(),
            limit_config("jobs", 1).with_timeout(Duration::ZERO),
        )
        .unwrap();

        store.insert_raw("jobs", "crashed-worker", "0");
        assert!(limit.acquire().await.unwrap_err().is_limit_exceeded());

        assert_eq!(limit.clean().await.unwrap(), 1);
        assert_eq!(limit.acquire().await.unwrap().count(), 1);
    }

    #[tokio::test]
    async fn lists_keys() {
        let store = MemoryStore::new();
        let reports = ConcurrencyLimit::new(store.clone(), limit_config("limit:reports", 1)).unwrap();
        let exports = ConcurrencyLimit::new(store.clone(), limit_config("limit:exports", 1)).unwrap();

        let _report = reports.acquire().await.unwrap();
        let _export = exports.acquire().await.unwrap();

        assert_eq!(
            keys(&store, "limit:*").await.unwrap(),
            vec!["limit:exports".to_owned(), "limit:reports".to_owned()]
        );
        assert!(keys(&store, "queue:*").await.unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_config() {
        let error = ConcurrencyLimit::new(MemoryStore::new(), LimitConfig::new("", 0)).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Invalid limit configuration: Limit key must not be empty; Limit for key \"\" must be at least 1"
        );
    }
}
