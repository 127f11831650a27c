//! A capacity- and TTL-bounded cache.
//!
//! Entries expire a fixed duration after they were last written. Reads never extend an entry's lifetime. When an
//! insert would push the cache over capacity, the least-recently-written entries are evicted first.
//!
//! Expired entries are removed lazily as they are encountered by reads and iteration, and in bulk by an optional
//! background task (see [`ExpiringCache::spawn_expiration`]).

use std::{
    hash::Hash,
    marker::PhantomData,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use entity_error::{generic_error, GenericError};
use indexmap::IndexMap;
use serde::{ser::SerializeMap as _, Serialize, Serializer};
use tokio::{
    select,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{sync::MutexExt as _, task::spawn_traced_named};

const DEFAULT_EXPIRATION_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for creating an [`ExpiringCache`].
pub struct CacheBuilder<K, V> {
    identifier: String,
    capacity: NonZeroUsize,
    time_to_live: Option<Duration>,
    expiration_interval: Duration,
    _key: PhantomData<K>,
    _value: PhantomData<V>,
}

impl<K, V> CacheBuilder<K, V> {
    /// Creates a new `CacheBuilder` with the given cache identifier.
    ///
    /// The identifier is attached to log lines emitted by the cache and its expiration task.
    ///
    /// # Errors
    ///
    /// If the given cache identifier is empty, an error is returned.
    pub fn from_identifier<N: Into<String>>(identifier: N) -> Result<Self, GenericError> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(generic_error!("cache identifier must not be empty"));
        }

        Ok(Self {
            identifier,
            capacity: NonZeroUsize::MAX,
            time_to_live: None,
            expiration_interval: DEFAULT_EXPIRATION_INTERVAL,
            _key: PhantomData,
            _value: PhantomData,
        })
    }

    /// Sets the maximum number of entries held by the cache.
    ///
    /// Defaults to unlimited capacity.
    pub fn with_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets how long an entry lives after it was last written.
    ///
    /// If the given value is `None`, entries never expire. Defaults to no expiration.
    pub fn with_time_to_live(mut self, time_to_live: Option<Duration>) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    /// Sets how often the background expiration task sweeps the cache.
    ///
    /// Only relevant when expiration is enabled and the task is running. Defaults to 1 second.
    pub fn with_expiration_interval(mut self, expiration_interval: Duration) -> Self {
        self.expiration_interval = expiration_interval;
        self
    }

    /// Builds an [`ExpiringCache`] from the current configuration.
    pub fn build(self) -> ExpiringCache<K, V> {
        ExpiringCache {
            inner: Arc::new(Inner {
                identifier: self.identifier,
                capacity: self.capacity.get(),
                time_to_live: self.time_to_live,
                expiration_interval: self.expiration_interval,
                entries: Mutex::new(IndexMap::new()),
            }),
        }
    }
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

struct Inner<K, V> {
    identifier: String,
    capacity: usize,
    time_to_live: Option<Duration>,
    expiration_interval: Duration,

    // Kept in write order: the front is always the least-recently-written entry. Since every write gets the same
    // time-to-live, the front is also the entry closest to expiring.
    entries: Mutex<IndexMap<K, Entry<V>>>,
}

/// A concurrent cache with write-refreshed expiration and oldest-first eviction.
///
/// Cloning the cache is cheap and all clones share the same entries.
pub struct ExpiringCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for ExpiringCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash,
{
    /// Returns the identifier of this cache.
    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// Returns the maximum number of entries held by the cache.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns the configured time-to-live, if any.
    pub fn time_to_live(&self) -> Option<Duration> {
        self.inner.time_to_live
    }

    /// Inserts or overwrites an entry, resetting its time-to-live.
    ///
    /// The entry becomes the most-recently-written one. If the cache is over capacity afterwards, the
    /// least-recently-written entries are evicted until it is not.
    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let expires_at = self.inner.time_to_live.map(|ttl| now + ttl);

        let mut entries = self.inner.entries.lock_unpoisoned();

        // Removing first moves an overwritten key to the back.
        entries.shift_remove(&key);
        entries.insert(key, Entry { value, expires_at });

        let overflow = entries.len().saturating_sub(self.inner.capacity);
        if overflow > 0 {
            entries.drain(..overflow);
        }
    }

    /// Removes an entry by key.
    pub fn remove(&self, key: &K) {
        self.inner.entries.lock_unpoisoned().shift_remove(key);
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        let mut entries = self.inner.entries.lock_unpoisoned();
        remove_expired(&mut entries, Instant::now());
        entries.len()
    }

    /// Returns `true` if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the instant at which the entry for `key` expires.
    ///
    /// Returns `None` if the entry is missing, already expired, or the cache has no time-to-live.
    pub fn expires_at(&self, key: &K) -> Option<Instant> {
        let now = Instant::now();
        let entries = self.inner.entries.lock_unpoisoned();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
    }

    /// Calls `f` for every live entry, from least- to most-recently-written.
    ///
    /// The cache is locked for the duration of the call, so `f` must not call back into the cache.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        let mut entries = self.inner.entries.lock_unpoisoned();
        remove_expired(&mut entries, Instant::now());
        for (key, entry) in entries.iter() {
            f(key, &entry.value);
        }
    }

    /// Removes all expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.inner.entries.lock_unpoisoned();
        remove_expired(&mut entries, Instant::now())
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Gets a copy of the value for `key`, if it is present and has not expired.
    ///
    /// Expired entries found this way are removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock_unpoisoned();

        let expired = entries.get(key)?.is_expired(now);
        if expired {
            entries.shift_remove(key);
            return None;
        }

        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Returns a point-in-time copy of every live entry, from least- to most-recently-written.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let mut snapshot = Vec::new();
        self.for_each(|key, value| snapshot.push((key.clone(), value.clone())));
        snapshot
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    /// Spawns a background task that periodically removes expired entries.
    ///
    /// The task runs until `shutdown` is cancelled. When the cache has no time-to-live there is nothing to sweep, and
    /// the returned task exits immediately.
    pub fn spawn_expiration(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let task_name = format!("{}-expiration", self.inner.identifier);
        spawn_traced_named(task_name, drive_expiration(cache, shutdown))
    }
}

async fn drive_expiration<K, V>(cache: ExpiringCache<K, V>, shutdown: CancellationToken)
where
    K: Eq + Hash,
{
    if cache.inner.time_to_live.is_none() {
        return;
    }

    let cache_id = cache.identifier().to_string();
    loop {
        select! {
            _ = shutdown.cancelled() => {
                debug!(cache_id = %cache_id, "Stopping cache expiration.");
                break;
            },
            _ = sleep(cache.inner.expiration_interval) => {
                let num_expired_items = cache.purge_expired();
                if num_expired_items != 0 {
                    debug!(cache_id = %cache_id, num_expired_items, "Removed expired items.");
                }
            },
        }
    }
}

fn remove_expired<K, V>(entries: &mut IndexMap<K, Entry<V>>, now: Instant) -> usize
where
    K: Eq + Hash,
{
    // Entries are ordered by expiry, so expired entries always form a prefix.
    let expired = entries
        .values()
        .position(|entry| !entry.is_expired(now))
        .unwrap_or(entries.len());
    if expired > 0 {
        entries.drain(..expired);
    }
    expired
}

impl<K, V> Serialize for ExpiringCache<K, V>
where
    K: Eq + Hash + Serialize,
    V: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let now = Instant::now();
        let entries = self.inner.entries.lock_unpoisoned();

        let live = entries.iter().filter(|(_, entry)| !entry.is_expired(now));
        let mut map = serializer.serialize_map(None)?;
        for (key, entry) in live {
            map.serialize_entry(key, &entry.value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    fn test_cache(capacity: usize) -> ExpiringCache<String, u32> {
        CacheBuilder::from_identifier("test")
            .unwrap()
            .with_capacity(NonZeroUsize::new(capacity).unwrap())
            .with_time_to_live(Some(TTL))
            .build()
    }

    #[test]
    fn empty_cache_identifier() {
        let result = CacheBuilder::<u64, u64>::from_identifier("");
        assert!(result.is_err(), "expected error for empty cache identifier");
    }

    #[tokio::test(start_paused = true)]
    async fn basic() {
        let cache = test_cache(4);
        assert!(cache.is_empty());

        cache.insert("pod-a".to_string(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"pod-a".to_string()), Some(1));

        cache.remove(&"pod-a".to_string());
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"pod-a".to_string()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_refreshes_ttl_without_duplicating() {
        let cache = test_cache(4);
        let key = "pod-a".to_string();

        cache.insert(key.clone(), 1);
        let first_expiry = cache.expires_at(&key).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        cache.insert(key.clone(), 2);
        let second_expiry = cache.expires_at(&key).unwrap();

        assert!(second_expiry > first_expiry);
        assert_eq!(second_expiry, Instant::now() + TTL);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_do_not_refresh_ttl() {
        let cache = test_cache(4);
        let key = "pod-a".to_string();
        cache.insert(key.clone(), 1);

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_written() {
        let cache = test_cache(256);
        for i in 0..300 {
            cache.insert(format!("pod-{}", i), i);
        }

        assert_eq!(cache.len(), 256);
        for i in 0..44 {
            assert_eq!(cache.get(&format!("pod-{}", i)), None);
        }
        for i in 44..300 {
            assert_eq!(cache.get(&format!("pod-{}", i)), Some(i));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rewritten_entry_survives_eviction() {
        let cache = test_cache(2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        cache.insert("a".to_string(), 3);
        cache.insert("c".to_string(), 4);

        let keys = cache.snapshot().into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn background_expiration() {
        let cache = test_cache(4);
        let shutdown = CancellationToken::new();
        let task = cache.spawn_expiration(shutdown.clone());

        cache.insert("a".to_string(), 1);
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.insert("b".to_string(), 2);

        // Let the sweep run past the first entry's expiry, but not the second's.
        tokio::time::sleep(Duration::from_secs(110)).await;
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.snapshot(), vec![("b".to_string(), 2)]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn serializes_live_entries_as_map() {
        let cache = test_cache(4);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);

        let value = serde_json::to_value(&cache).unwrap();
        assert_eq!(value, serde_json::json!({ "a": 1, "b": 2 }));

        tokio::time::advance(TTL).await;
        let value = serde_json::to_value(&cache).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn expiration_task_exits_without_ttl() {
        let cache = CacheBuilder::<String, u32>::from_identifier("no-ttl").unwrap().build();
        let shutdown = CancellationToken::new();

        tokio_test::block_on(async {
            cache.spawn_expiration(shutdown).await.unwrap();
        });
    }
}
