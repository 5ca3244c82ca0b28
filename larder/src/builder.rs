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

use std::{sync::Arc, time::Duration};

use itertools::Itertools;
use larder_common::{
    code::{HashBuilder, Key, Value},
    ticker::{SystemTicker, Ticker},
};

use crate::{
    cache::{Cache, CacheInner, LoadingCache},
    entry::{Shape, Strength},
    listener::{NoopListener, RemovalBus, RemovalListener},
    loader::Loader,
    stats::StatsCounter,
    stripe::{CacheShared, Stripe},
};

/// Computes the weight a value contributes toward the cap.
///
/// Invoked under the stripe lock; must be cheap, side-effect free, and
/// stable for a given pair. The default weighs every entry at 1.
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u32 + Send + Sync>;

/// Configures and builds a [`Cache`] or [`LoadingCache`].
///
/// ```
/// use std::time::Duration;
///
/// use larder::CacheBuilder;
///
/// let cache = CacheBuilder::new()
///     .with_max_weight(1024)
///     .with_expire_after_access(Duration::from_secs(30))
///     .build::<u64, String>();
/// ```
pub struct CacheBuilder<S = ahash::RandomState> {
    initial_capacity: usize,
    concurrency_level: usize,
    max_weight: Option<u64>,
    expire_after_access: Option<Duration>,
    expire_after_write: Option<Duration>,
    refresh_after_write: Option<Duration>,
    key_strength: Strength,
    value_strength: Strength,
    ticker: Option<Arc<dyn Ticker>>,
    hash_builder: S,
}

impl CacheBuilder<ahash::RandomState> {
    pub fn new() -> Self {
        Self {
            initial_capacity: 16,
            concurrency_level: 4,
            max_weight: None,
            expire_after_access: None,
            expire_after_write: None,
            refresh_after_write: None,
            key_strength: Strength::Strong,
            value_strength: Strength::Strong,
            ticker: None,
            hash_builder: ahash::RandomState::default(),
        }
    }
}

impl Default for CacheBuilder<ahash::RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CacheBuilder<S>
where
    S: HashBuilder,
{
    /// Sizing hint for the hash tables; not a bound on the entry count.
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// An estimate of how many threads will mutate the cache concurrently.
    /// The stripe count is the smallest power of two at least this large.
    pub fn with_concurrency_level(mut self, concurrency_level: usize) -> Self {
        self.concurrency_level = concurrency_level.max(1);
        self
    }

    /// Bounds the total weight of the cache. Each stripe enforces its share,
    /// evicting in per-stripe least-recently-used order.
    pub fn with_max_weight(mut self, max_weight: u64) -> Self {
        self.max_weight = Some(max_weight);
        self
    }

    /// Expires entries this long after their last read or write.
    pub fn with_expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    /// Expires entries this long after they were written.
    pub fn with_expire_after_write(mut self, duration: Duration) -> Self {
        self.expire_after_write = Some(duration);
        self
    }

    /// Makes loading reads older than this trigger a refresh-ahead: the
    /// stale value is served while the reload runs.
    pub fn with_refresh_after_write(mut self, duration: Duration) -> Self {
        self.refresh_after_write = Some(duration);
        self
    }

    pub fn with_key_strength(mut self, strength: Strength) -> Self {
        self.key_strength = strength;
        self
    }

    pub fn with_value_strength(mut self, strength: Strength) -> Self {
        self.value_strength = strength;
        self
    }

    /// Replaces the time source. For tests.
    pub fn with_ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    pub fn with_hash_builder<S2: HashBuilder>(self, hash_builder: S2) -> CacheBuilder<S2> {
        CacheBuilder {
            initial_capacity: self.initial_capacity,
            concurrency_level: self.concurrency_level,
            max_weight: self.max_weight,
            expire_after_access: self.expire_after_access,
            expire_after_write: self.expire_after_write,
            refresh_after_write: self.refresh_after_write,
            key_strength: self.key_strength,
            value_strength: self.value_strength,
            ticker: self.ticker,
            hash_builder,
        }
    }

    pub fn build<K, V>(self) -> Cache<K, V, S>
    where
        K: Key,
        V: Value,
    {
        self.build_inner(Arc::new(NoopListener), Arc::new(|_: &K, _: &V| 1))
    }

    /// Builds with a removal listener.
    pub fn build_with_listener<K, V>(self, listener: impl RemovalListener<K, V>) -> Cache<K, V, S>
    where
        K: Key,
        V: Value,
    {
        self.build_inner(Arc::new(listener), Arc::new(|_: &K, _: &V| 1))
    }

    /// Builds with a removal listener and a weigher. The weigher only takes
    /// effect together with [`CacheBuilder::with_max_weight`].
    pub fn build_with_weigher<K, V>(
        self,
        weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static,
        listener: impl RemovalListener<K, V>,
    ) -> Cache<K, V, S>
    where
        K: Key,
        V: Value,
    {
        assert!(
            self.max_weight.is_some(),
            "a weigher requires a maximum weight to act against"
        );
        self.build_inner(Arc::new(listener), Arc::new(weigher))
    }

    /// Builds a [`LoadingCache`] around `loader`.
    pub fn build_with<K, V, L>(self, loader: L) -> LoadingCache<K, V, L, S>
    where
        K: Key,
        V: Value,
        L: Loader<K, V>,
    {
        LoadingCache {
            cache: self.build(),
            loader: Arc::new(loader),
        }
    }

    /// Builds a [`LoadingCache`] with a removal listener.
    pub fn build_loading_with_listener<K, V, L>(
        self,
        loader: L,
        listener: impl RemovalListener<K, V>,
    ) -> LoadingCache<K, V, L, S>
    where
        K: Key,
        V: Value,
        L: Loader<K, V>,
    {
        LoadingCache {
            cache: self.build_with_listener(listener),
            loader: Arc::new(loader),
        }
    }

    fn build_inner<K, V>(self, listener: Arc<dyn RemovalListener<K, V>>, weigher: Weigher<K, V>) -> Cache<K, V, S>
    where
        K: Key,
        V: Value,
    {
        let access_ttl = self.expire_after_access.map_or(0, |d| d.as_nanos() as u64);
        let write_ttl = self.expire_after_write.map_or(0, |d| d.as_nanos() as u64);
        let refresh_nanos = self.refresh_after_write.map_or(0, |d| d.as_nanos() as u64);
        let evicts = self.max_weight.is_some();

        let mut shape = Shape::empty();
        if self.key_strength == Strength::Weak {
            shape |= Shape::WEAK_KEY;
        }
        if access_ttl > 0 || evicts {
            shape |= Shape::ACCESS;
        }
        if write_ttl > 0 {
            shape |= Shape::WRITE;
        }

        // Smallest power of two >= the concurrency level, halved so each
        // size-capped stripe covers at least twenty weight units.
        let mut stripe_count: usize = 1;
        while stripe_count < self.concurrency_level
            && self.max_weight.map_or(true, |w| (stripe_count as u64) * 20 <= w)
        {
            stripe_count <<= 1;
        }
        let stripe_shift = 32 - stripe_count.trailing_zeros();

        // Per-stripe weight shares sum to the cap; the remainder is spread
        // over the first stripes.
        let stripe_weights: Vec<Option<u64>> = match self.max_weight {
            None => vec![None; stripe_count],
            Some(max_weight) => {
                let base = max_weight / stripe_count as u64;
                let remainder = (max_weight % stripe_count as u64) as usize;
                (0..stripe_count)
                    .map(|stripe| Some(base + u64::from(stripe < remainder)))
                    .collect()
            }
        };

        let per_stripe_capacity = self.initial_capacity.div_ceil(stripe_count);
        let initial_buckets = per_stripe_capacity.next_power_of_two().max(1);

        let shared = Arc::new(CacheShared {
            shape,
            key_strength: self.key_strength,
            value_strength: self.value_strength,
            access_ttl,
            write_ttl,
            refresh_nanos,
            records_write_time: write_ttl > 0 || refresh_nanos > 0,
            weigher,
            ticker: self.ticker.unwrap_or_else(|| Arc::new(SystemTicker::new())),
            bus: RemovalBus::new(listener),
        });

        let stripes = stripe_weights
            .into_iter()
            .map(|max_weight| Arc::new(Stripe::new(shared.clone(), initial_buckets, max_weight)))
            .collect_vec()
            .into_boxed_slice();

        Cache {
            inner: Arc::new(CacheInner {
                stripes,
                shared,
                hash_builder: self.hash_builder,
                stripe_shift,
                global_stats: StatsCounter::default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripe_count_follows_concurrency() {
        let cache: Cache<u64, u64> = CacheBuilder::new().with_concurrency_level(6).build();
        assert_eq!(cache.inner.stripes.len(), 8);

        let cache: Cache<u64, u64> = CacheBuilder::new().with_concurrency_level(1).build();
        assert_eq!(cache.inner.stripes.len(), 1);
    }

    #[test]
    fn test_small_caps_bound_stripes() {
        // 64 stripes would leave fewer than twenty units each.
        let cache: Cache<u64, u64> = CacheBuilder::new()
            .with_concurrency_level(64)
            .with_max_weight(100)
            .build();
        assert!(cache.inner.stripes.len() <= 8);
    }

    #[test]
    fn test_weight_shares_sum_to_cap() {
        let cache: Cache<u64, u64> = CacheBuilder::new()
            .with_concurrency_level(4)
            .with_max_weight(103)
            .build();
        // 4 stripes share 103: three get 26, one gets 25.
        assert_eq!(cache.inner.stripes.len(), 4);
    }
}
