//  Copyright 2025 Larder Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The cache facade: hashing, striping, and fan-out operations.

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use larder_common::code::{HashBuilder, Key, Value};

use crate::{
    error::{Error, Result},
    loader::Loader,
    stats::{CacheStats, StatsCounter},
    stripe::{CacheShared, Stripe},
};

/// Passes over the whole cache before `contains_value` accepts a negative.
/// A false negative is still possible under adversarial interleavings.
const CONTAINS_VALUE_RETRIES: usize = 3;

/// Bit-mixing spreader applied over the hash builder's output.
///
/// Defends against poor user hashes: the stripe selector uses the top bits
/// and the bucket selector the bottom bits, so both must be well mixed.
pub(crate) fn spread(mut h: u32) -> u32 {
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

pub(crate) struct CacheInner<K, V, S> {
    pub stripes: Box<[Arc<Stripe<K, V>>]>,
    pub shared: Arc<CacheShared<K, V>>,
    pub hash_builder: S,
    /// Right shift applied to a hash to select a stripe by its top bits.
    pub stripe_shift: u32,
    /// Cache-level counter for batch loads, which belong to no stripe.
    pub global_stats: StatsCounter,
}

impl<K, V, S> CacheInner<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    fn hash_of(&self, key: &K) -> u32 {
        let h = self.hash_builder.hash_one(key);
        spread((h ^ (h >> 32)) as u32)
    }

    fn stripe_for(&self, hash: u32) -> &Arc<Stripe<K, V>> {
        let index = ((hash as u64) >> self.stripe_shift) as usize & (self.stripes.len() - 1);
        &self.stripes[index]
    }
}

/// A concurrent in-process cache with bounded capacity, expiration, and
/// removal notifications.
///
/// Handles are cheap clones sharing one cache. Values are handed out as
/// `Arc<V>`; entry-creating operations accept anything convertible into
/// `Arc<K>`/`Arc<V>` so callers of weak-keyed or weak-valued caches can keep
/// the strong reference on their side.
pub struct Cache<K, V, S = ahash::RandomState> {
    pub(crate) inner: Arc<CacheInner<K, V, S>>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, S> std::fmt::Debug for Cache<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("stripes", &self.inner.stripes.len()).finish()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.inner.hash_of(key);
        self.inner.stripe_for(hash).get_if_present(hash, key)
    }

    /// Returns the cached value for `key`, loading it through `loader` on a
    /// miss. Concurrent callers for the same key share one load.
    pub fn get_with<L>(&self, key: impl Into<Arc<K>>, loader: &L) -> Result<Arc<V>>
    where
        L: Loader<K, V>,
    {
        let key = key.into();
        let hash = self.inner.hash_of(&key);
        self.inner.stripe_for(hash).get_or_load(hash, key, loader)
    }

    /// Associates `value` with `key`, returning the previous value.
    pub fn insert(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) -> Option<Arc<V>> {
        let key = key.into();
        let hash = self.inner.hash_of(&key);
        self.inner.stripe_for(hash).put(hash, key, value.into(), false)
    }

    /// Associates `value` with `key` unless a live value exists, in which
    /// case the existing value is returned without writing.
    pub fn insert_if_absent(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) -> Option<Arc<V>> {
        let key = key.into();
        let hash = self.inner.hash_of(&key);
        self.inner.stripe_for(hash).put(hash, key, value.into(), true)
    }

    /// Replaces the value of `key` only if a live value exists.
    pub fn replace(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) -> Option<Arc<V>> {
        let key = key.into();
        let hash = self.inner.hash_of(&key);
        self.inner.stripe_for(hash).replace(hash, key, value.into())
    }

    /// Replaces the value of `key` only if the live value equals `expected`.
    pub fn replace_if_equals(&self, key: impl Into<Arc<K>>, expected: &V, value: impl Into<Arc<V>>) -> bool
    where
        V: PartialEq,
    {
        let key = key.into();
        let hash = self.inner.hash_of(&key);
        self.inner
            .stripe_for(hash)
            .replace_if_equals(hash, key, expected, value.into())
    }

    /// Removes `key`, returning its live value and emitting an `Explicit`
    /// notification.
    pub fn invalidate(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.inner.hash_of(key);
        self.inner.stripe_for(hash).remove(hash, key)
    }

    /// Removes `key` only if its live value equals `expected`.
    pub fn remove_if_equals(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let hash = self.inner.hash_of(key);
        self.inner.stripe_for(hash).remove_if_equals(hash, key, expected)
    }

    pub fn invalidate_keys<'a>(&self, keys: impl IntoIterator<Item = &'a K>)
    where
        K: 'a,
    {
        for key in keys {
            self.invalidate(key);
        }
    }

    /// Removes every entry, emitting `Explicit` notifications.
    pub fn invalidate_all(&self) {
        for stripe in self.inner.stripes.iter() {
            stripe.clear();
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.inner.hash_of(key);
        self.inner.stripe_for(hash).contains_key(hash, key)
    }

    /// Whether any live entry maps to `value`.
    ///
    /// Retries up to three passes and accepts the negative once the
    /// modification counts were stable across a pass.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let now = self.inner.shared.ticker.read();
        let mut last = u64::MAX;
        for _ in 0..CONTAINS_VALUE_RETRIES {
            let mut sum: u64 = 0;
            for stripe in self.inner.stripes.iter() {
                let (found, mod_count) = stripe.contains_value(value, now);
                if found {
                    return true;
                }
                sum = sum.wrapping_add(mod_count);
            }
            if sum == last {
                break;
            }
            last = sum;
        }
        false
    }

    /// The number of live entries, saturating at `usize::MAX`.
    pub fn len(&self) -> usize {
        self.inner
            .stripes
            .iter()
            .fold(0usize, |sum, stripe| sum.saturating_add(stripe.count()))
    }

    /// Two-pass emptiness check using per-stripe modification counts to
    /// detect movement between passes.
    pub fn is_empty(&self) -> bool {
        let mut sum: u64 = 0;
        for stripe in self.inner.stripes.iter() {
            if stripe.count() != 0 {
                return false;
            }
            sum = sum.wrapping_add(stripe.mod_count());
        }
        if sum != 0 {
            for stripe in self.inner.stripes.iter() {
                if stripe.count() != 0 {
                    return false;
                }
                sum = sum.wrapping_sub(stripe.mod_count());
            }
            if sum != 0 {
                return false;
            }
        }
        true
    }

    /// Returns the live values for the requested keys, without loading.
    pub fn get_all_present<I>(&self, keys: I) -> HashMap<Arc<K>, Arc<V>>
    where
        I: IntoIterator,
        I::Item: Into<Arc<K>>,
    {
        let mut found = HashMap::new();
        for item in keys {
            let key: Arc<K> = item.into();
            if found.contains_key(&key) {
                continue;
            }
            if let Some(value) = self.get_if_present(&key) {
                found.insert(key, value);
            }
        }
        found
    }

    /// A weakly-consistent iterator over live entries.
    ///
    /// May miss entries inserted after it started and may yield entries
    /// removed afterwards; it never observes a torn state and never fails.
    pub fn iter(&self) -> Iter<K, V, S> {
        let stripe = self.inner.stripes.len() as isize - 1;
        let bucket = self.inner.stripes[stripe as usize].bucket_count() as isize - 1;
        Iter {
            inner: Arc::clone(&self.inner),
            stripe,
            bucket,
            pending: Vec::new(),
        }
    }

    /// Aggregated statistics across all stripes.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        self.inner.global_stats.fold_into(&mut stats);
        for stripe in self.inner.stripes.iter() {
            stripe.stats().fold_into(&mut stats);
        }
        stats
    }

    /// Runs pending maintenance on every stripe: reclamation, expiration,
    /// and notification delivery.
    pub fn clean_up(&self) {
        for stripe in self.inner.stripes.iter() {
            stripe.run_cleanup();
        }
    }
}

/// See [`Cache::iter`].
pub struct Iter<K, V, S = ahash::RandomState> {
    inner: Arc<CacheInner<K, V, S>>,
    stripe: isize,
    bucket: isize,
    pending: Vec<(Arc<K>, Arc<V>)>,
}

impl<K, V, S> Iterator for Iter<K, V, S>
where
    K: Key,
    V: Value,
    S: HashBuilder,
{
    type Item = (Arc<K>, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.pending.pop() {
                return Some(pair);
            }
            if self.stripe < 0 {
                return None;
            }
            if self.bucket < 0 {
                self.stripe -= 1;
                if self.stripe < 0 {
                    return None;
                }
                self.bucket = self.inner.stripes[self.stripe as usize].bucket_count() as isize - 1;
                continue;
            }
            let now = self.inner.shared.ticker.read();
            self.pending = self.inner.stripes[self.stripe as usize].snapshot_bucket(self.bucket as usize, now);
            self.bucket -= 1;
        }
    }
}

/// A [`Cache`] bound to a default [`Loader`].
pub struct LoadingCache<K, V, L, S = ahash::RandomState> {
    pub(crate) cache: Cache<K, V, S>,
    pub(crate) loader: Arc<L>,
}

impl<K, V, L, S> Clone for LoadingCache<K, V, L, S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            loader: Arc::clone(&self.loader),
        }
    }
}

impl<K, V, L, S> std::ops::Deref for LoadingCache<K, V, L, S> {
    type Target = Cache<K, V, S>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl<K, V, L, S> LoadingCache<K, V, L, S>
where
    K: Key,
    V: Value,
    L: Loader<K, V>,
    S: HashBuilder,
{
    /// Returns the value for `key`, loading it on a miss.
    pub fn get(&self, key: impl Into<Arc<K>>) -> Result<Arc<V>> {
        self.cache.get_with(key, &*self.loader)
    }

    /// Returns a mapping for all requested keys, loading the missing ones.
    ///
    /// Uses the loader's batch `load_all` when supported, falling back to
    /// per-key loads. A batch result that omits a requested key is an
    /// [`Error::InvalidLoad`].
    pub fn get_all<I>(&self, keys: I) -> Result<HashMap<Arc<K>, Arc<V>>>
    where
        I: IntoIterator,
        I::Item: Into<Arc<K>>,
    {
        let mut found = HashMap::new();
        let mut missing: Vec<Arc<K>> = Vec::new();
        let mut missing_set = HashSet::new();
        for item in keys {
            let key: Arc<K> = item.into();
            if found.contains_key(&key) || missing_set.contains(&key) {
                continue;
            }
            match self.cache.get_if_present(&key) {
                Some(value) => {
                    found.insert(key, value);
                }
                None => {
                    missing_set.insert(key.clone());
                    missing.push(key);
                }
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let global = &self.cache.inner.global_stats;
        let ticker = &self.cache.inner.shared.ticker;
        let start = ticker.read();
        let batch = std::panic::catch_unwind(AssertUnwindSafe(|| self.loader.load_all(&missing)));
        let elapsed = ticker.read().saturating_sub(start);
        match batch {
            Err(_) => {
                global.record_load_failure(elapsed);
                Err(Error::LoadPanic)
            }
            Ok(None) => {
                // No batch support: load key by key.
                for key in missing {
                    let value = self.get(key.clone())?;
                    found.insert(key, value);
                }
                Ok(found)
            }
            Ok(Some(Err(cause))) => {
                global.record_load_failure(elapsed);
                Err(Error::Load(cause))
            }
            Ok(Some(Ok(mut loaded))) => {
                global.record_load_success(elapsed);
                for key in &missing {
                    let Some(value) = loaded.remove(&**key) else {
                        return Err(Error::InvalidLoad);
                    };
                    let value = Arc::new(value);
                    self.cache.insert(key.clone(), value.clone());
                    found.insert(key.clone(), value);
                }
                // Extra entries returned by the batch are cached as well.
                for (key, value) in loaded {
                    self.cache.insert(key, value);
                }
                Ok(found)
            }
        }
    }

    /// Triggers a reload of `key`, loading it if absent. Never fails:
    /// errors are logged and the previous value stays visible.
    pub fn refresh(&self, key: impl Into<Arc<K>>) {
        let key = key.into();
        let hash = self.cache.inner.hash_of(&key);
        self.cache.inner.stripe_for(hash).refresh(hash, key, &*self.loader);
    }

    pub fn loader(&self) -> &Arc<L> {
        &self.loader
    }
}

impl<K, V, L, S> std::fmt::Debug for LoadingCache<K, V, L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::SmallRng, RngCore, SeedableRng};

    use super::*;
    use crate::builder::CacheBuilder;

    fn is_send_sync_clone<T: Send + Sync + Clone + 'static>() {}

    #[test]
    fn test_send_sync_clone() {
        is_send_sync_clone::<Cache<u64, u64>>();
        is_send_sync_clone::<Cache<String, Vec<u8>>>();
    }

    #[test]
    fn test_spread_is_deterministic() {
        assert_eq!(spread(0), spread(0));
        assert_eq!(spread(0xdead_beef), spread(0xdead_beef));
        // Low-entropy inputs must differ after mixing.
        assert_ne!(spread(1), spread(2));
        assert_ne!(spread(1) & 0xff, spread(257) & 0xff);
    }

    #[test]
    fn test_cache_fuzzy() {
        const CAPACITY: u64 = 256;

        let cache: Cache<u64, u64> = CacheBuilder::new()
            .with_concurrency_level(4)
            .with_max_weight(CAPACITY)
            .build();

        let mut rng = SmallRng::seed_from_u64(114514);
        for _ in 0..100_000 {
            let key = rng.next_u64() % 1024;
            if let Some(value) = cache.get_if_present(&key) {
                assert_eq!(*value, key);
                continue;
            }
            cache.insert(key, key);
        }
        // Unit weights: the live count fits the cap plus per-stripe slack.
        assert!(cache.len() as u64 <= CAPACITY + 4);
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_iter_sees_live_entries() {
        let cache: Cache<u64, u64> = CacheBuilder::new().build();
        for i in 0..64 {
            cache.insert(i, i * 10);
        }
        cache.invalidate(&7);

        let collected: HashMap<u64, u64> = cache.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(collected.len(), 63);
        assert!(!collected.contains_key(&7));
        assert_eq!(collected.get(&8), Some(&80));
    }

    #[test]
    fn test_contains_value() {
        let cache: Cache<u64, String> = CacheBuilder::new().build();
        cache.insert(1, "one".to_string());
        assert!(cache.contains_value(&"one".to_string()));
        assert!(!cache.contains_value(&"two".to_string()));
    }
}
