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

//! One lock-partitioned stripe of the cache.
//!
//! A stripe owns an intra-stripe hash table (bucket heads chaining entries by
//! arena index), the access and write ordering deques, the lock-free recency
//! and reclamation channels, and a statistics counter. All mutation happens
//! under the stripe's write lock; reads share the read lock and stage their
//! bookkeeping through the lock-free channels. Removal notifications are
//! enqueued under the lock and delivered after it is released.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::ThreadId,
};

use larder_common::{
    code::{Key, Value},
    promise::Promise,
    ticker::Ticker,
};
use larder_intrusive::{IndexedDeque, Link, LinkView, NIL};
use parking_lot::RwLock;

use crate::{
    builder::Weigher,
    entry::{Arena, Entry, KeySlot, LoadOutcome, LoadingHolder, Shape, Strength, ValueHolder},
    error::{Error, Result},
    listener::{RemovalBus, RemovalCause, RemovalNotification},
    loader::{Loader, Reload},
    recency::RecencyBuffer,
    reclaim::{ReclaimQueue, RECLAIM_DRAIN_LIMIT},
    stats::StatsCounter,
};

/// Reads between amortized cleanup attempts, minus one.
const READ_CLEANUP_MASK: usize = 63;

/// Per-stripe tables stop doubling at this many buckets.
const MAX_BUCKETS: usize = 1 << 30;

/// Cache-wide state shared by every stripe.
pub(crate) struct CacheShared<K, V> {
    pub shape: Shape,
    pub key_strength: Strength,
    pub value_strength: Strength,
    /// Nanoseconds; zero disables the policy.
    pub access_ttl: u64,
    pub write_ttl: u64,
    pub refresh_nanos: u64,
    /// Write timestamps are kept for write expiration and for refresh.
    pub records_write_time: bool,
    pub weigher: Weigher<K, V>,
    pub ticker: Arc<dyn Ticker>,
    pub bus: RemovalBus<K, V>,
}

/// What a lock-free read observed for a key.
pub(crate) enum ReadRecord<V> {
    Hit {
        value: Arc<V>,
        /// Live, not loading, and older than the refresh interval.
        refreshable: bool,
    },
    Loading {
        promise: Promise<LoadOutcome<V>>,
        loader_thread: ThreadId,
    },
    Miss,
}

pub(crate) struct Stripe<K, V> {
    shared: Arc<CacheShared<K, V>>,
    inner: RwLock<StripeInner<K, V>>,
    /// Mirror of the inner entry count, written under the lock. Lets the
    /// read path bail out of empty stripes and the facade size itself
    /// without locking.
    count: AtomicUsize,
    mod_count: AtomicU64,
    read_count: AtomicUsize,
    recency: RecencyBuffer,
    key_reclaim: ReclaimQueue,
    value_reclaim: ReclaimQueue,
    /// This stripe's share of the weight cap, `None` when unbounded.
    max_weight: Option<u64>,
    stats: StatsCounter,
}

struct StripeInner<K, V> {
    arena: Arena<K, V>,
    /// Power-of-two bucket heads; `NIL` marks an empty bucket.
    buckets: Vec<u32>,
    /// Live entries. Fresh loading placeholders are in the table but not
    /// counted until their value lands.
    count: usize,
    total_weight: u64,
    /// Entry count that triggers a table doubling.
    threshold: usize,
    access_queue: IndexedDeque,
    write_queue: IndexedDeque,
}

struct AccessLinks<'a, K, V>(&'a mut Arena<K, V>);

impl<K, V> LinkView for AccessLinks<'_, K, V> {
    fn link(&self, index: u32) -> Link {
        self.0.entry(index).access_link
    }

    fn set_link(&mut self, index: u32, link: Link) {
        self.0.entry_mut(index).access_link = link;
    }
}

struct WriteLinks<'a, K, V>(&'a mut Arena<K, V>);

impl<K, V> LinkView for WriteLinks<'_, K, V> {
    fn link(&self, index: u32) -> Link {
        self.0.entry(index).write_link
    }

    fn set_link(&mut self, index: u32, link: Link) {
        self.0.entry_mut(index).write_link = link;
    }
}

enum LockedLoad<V> {
    Hit(Arc<V>),
    Wait(Promise<LoadOutcome<V>>, ThreadId),
    Load(Promise<LoadOutcome<V>>),
}

enum RefreshStep<V: Value> {
    Done(LoadOutcome<V>),
    Pending(crate::loader::ReloadFuture<V>),
}

impl<K, V> Stripe<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new(shared: Arc<CacheShared<K, V>>, initial_buckets: usize, max_weight: Option<u64>) -> Self {
        debug_assert!(initial_buckets.is_power_of_two());
        Self {
            shared,
            inner: RwLock::new(StripeInner {
                arena: Arena::new(),
                buckets: vec![NIL; initial_buckets],
                count: 0,
                total_weight: 0,
                threshold: initial_buckets * 3 / 4,
                access_queue: IndexedDeque::new(),
                write_queue: IndexedDeque::new(),
            }),
            count: AtomicUsize::new(0),
            mod_count: AtomicU64::new(0),
            read_count: AtomicUsize::new(0),
            recency: RecencyBuffer::new(),
            key_reclaim: ReclaimQueue::new(),
            value_reclaim: ReclaimQueue::new(),
            max_weight,
            stats: StatsCounter::default(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &StatsCounter {
        &self.stats
    }

    fn is_expired(&self, entry: &Entry<K, V>, now: u64) -> bool {
        let shared = &self.shared;
        (shared.access_ttl > 0
            && now.saturating_sub(entry.access_time.load(Ordering::Relaxed)) >= shared.access_ttl)
            || (shared.write_ttl > 0 && now.saturating_sub(entry.write_time) >= shared.write_ttl)
    }

    /// Runs `f` under the stripe lock, then publishes the entry count and
    /// delivers pending removal notifications outside the lock.
    fn with_lock<R>(&self, f: impl FnOnce(&mut StripeInner<K, V>) -> R) -> R {
        let result = {
            let mut inner = self.inner.write();
            let result = f(&mut inner);
            self.count.store(inner.count, Ordering::Release);
            result
        };
        self.shared.bus.drain();
        result
    }

    /// Non-blocking cleanup; skipped when another thread holds the lock.
    fn try_locked_cleanup(&self, now: u64) {
        if let Some(mut inner) = self.inner.try_write() {
            inner.cleanup(self, now);
            self.count.store(inner.count, Ordering::Release);
        }
    }

    fn post_read(&self, now: u64) {
        if (self.read_count.fetch_add(1, Ordering::Relaxed) + 1) & READ_CLEANUP_MASK == 0 {
            self.try_locked_cleanup(now);
            self.shared.bus.drain();
        }
    }

    /// The lock-free read path.
    ///
    /// Walks one bucket chain under the shared guard, checks liveness, and
    /// stages access bookkeeping in the recency buffer. Entries observed with
    /// a dead key or value are queued for reclamation; an expired observation
    /// triggers an opportunistic cleanup after the guard drops.
    pub fn read(&self, hash: u32, key: &K, now: u64, touch: bool) -> ReadRecord<V> {
        let mut needs_cleanup = false;
        let record = if self.count.load(Ordering::Acquire) == 0 {
            ReadRecord::Miss
        } else {
            let inner = self.inner.read();
            let mask = inner.buckets.len() - 1;
            let mut index = inner.buckets[(hash as usize) & mask];
            let mut record = ReadRecord::Miss;
            while index != NIL {
                let entry = inner.arena.entry(index);
                if entry.hash == hash {
                    match entry.key.matches(key) {
                        None => {
                            self.key_reclaim.push(index, inner.arena.generation(index));
                            needs_cleanup = true;
                        }
                        Some(true) => {
                            record = self.inspect(&inner, index, now, touch, &mut needs_cleanup);
                            break;
                        }
                        Some(false) => {}
                    }
                }
                index = entry.next;
            }
            record
        };
        if needs_cleanup {
            self.try_locked_cleanup(now);
            self.shared.bus.drain();
        }
        if touch {
            self.post_read(now);
        }
        record
    }

    fn inspect(
        &self,
        inner: &StripeInner<K, V>,
        index: u32,
        now: u64,
        touch: bool,
        needs_cleanup: &mut bool,
    ) -> ReadRecord<V> {
        let entry = inner.arena.entry(index);
        match entry.holder.get() {
            Some(value) => {
                if self.is_expired(entry, now) {
                    *needs_cleanup = true;
                    return ReadRecord::Miss;
                }
                if touch && self.shared.shape.contains(Shape::ACCESS) {
                    entry.access_time.store(now, Ordering::Relaxed);
                    self.recency.record(index, inner.arena.generation(index));
                }
                let refreshable = self.shared.refresh_nanos > 0
                    && !entry.holder.is_loading()
                    && now.saturating_sub(entry.write_time) > self.shared.refresh_nanos;
                ReadRecord::Hit { value, refreshable }
            }
            None => match &entry.holder {
                ValueHolder::Loading(loading) => ReadRecord::Loading {
                    promise: loading.promise.clone(),
                    loader_thread: loading.loader_thread,
                },
                ValueHolder::Weak { .. } => {
                    self.value_reclaim.push(index, inner.arena.generation(index));
                    *needs_cleanup = true;
                    ReadRecord::Miss
                }
                _ => ReadRecord::Miss,
            },
        }
    }

    pub fn get_if_present(&self, hash: u32, key: &K) -> Option<Arc<V>> {
        let now = self.shared.ticker.read();
        match self.read(hash, key, now, true) {
            ReadRecord::Hit { value, .. } => {
                self.stats.record_hits(1);
                Some(value)
            }
            ReadRecord::Loading { .. } | ReadRecord::Miss => {
                self.stats.record_misses(1);
                None
            }
        }
    }

    /// Liveness check without stats or recency side effects.
    pub fn contains_key(&self, hash: u32, key: &K) -> bool {
        let now = self.shared.ticker.read();
        matches!(self.read(hash, key, now, false), ReadRecord::Hit { .. })
    }

    pub fn put(&self, hash: u32, key: Arc<K>, value: Arc<V>, only_if_absent: bool) -> Option<Arc<V>> {
        let now = self.shared.ticker.read();
        self.with_lock(|inner| {
            inner.cleanup(self, now);
            if inner.count + 1 > inner.threshold {
                inner.expand();
            }
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            inner.purge_dead_keys(self, bucket);

            if let Some(index) = inner.find(hash, &key, bucket) {
                match inner.arena.entry(index).holder.get() {
                    None => {
                        // The previous value was collected, or a load is in
                        // flight: install the new value over it. Waiters of a
                        // clobbered load observe the written value.
                        self.mod_count.fetch_add(1, Ordering::Relaxed);
                        let old =
                            std::mem::replace(&mut inner.arena.entry_mut(index).holder, ValueHolder::Unset);
                        let was_counted = old.counts();
                        inner.retire_holder(self, Some(key.clone()), old, RemovalCause::Collected, Some(&value));
                        if !was_counted {
                            inner.count += 1;
                        }
                        inner.set_value(self, index, &key, value, now);
                        inner.evict_entries(self, index);
                        None
                    }
                    Some(existing) => {
                        if only_if_absent {
                            inner.record_locked_read(self, index, now);
                            Some(existing)
                        } else {
                            self.mod_count.fetch_add(1, Ordering::Relaxed);
                            let old = std::mem::replace(
                                &mut inner.arena.entry_mut(index).holder,
                                ValueHolder::Unset,
                            );
                            inner.retire_holder(self, Some(key.clone()), old, RemovalCause::Replaced, Some(&value));
                            inner.set_value(self, index, &key, value, now);
                            inner.evict_entries(self, index);
                            Some(existing)
                        }
                    }
                }
            } else {
                self.mod_count.fetch_add(1, Ordering::Relaxed);
                let index = inner.link_new_entry(self, hash, &key, bucket, ValueHolder::Unset);
                inner.set_value(self, index, &key, value, now);
                inner.count += 1;
                inner.evict_entries(self, index);
                None
            }
        })
    }

    pub fn remove(&self, hash: u32, key: &K) -> Option<Arc<V>> {
        let now = self.shared.ticker.read();
        self.with_lock(|inner| {
            inner.cleanup(self, now);
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            inner.purge_dead_keys(self, bucket);
            let index = inner.find(hash, key, bucket)?;
            let holder = &inner.arena.entry(index).holder;
            let value = holder.get();
            let cause = if value.is_some() {
                RemovalCause::Explicit
            } else if holder.is_active() {
                RemovalCause::Collected
            } else {
                // A bare loading placeholder is left for its loader.
                return None;
            };
            inner.remove_entry(self, index, cause);
            value
        })
    }

    pub fn remove_if_equals(&self, hash: u32, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let now = self.shared.ticker.read();
        self.with_lock(|inner| {
            inner.cleanup(self, now);
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            inner.purge_dead_keys(self, bucket);
            let Some(index) = inner.find(hash, key, bucket) else {
                return false;
            };
            let holder = &inner.arena.entry(index).holder;
            match holder.get() {
                Some(value) if *value == *expected => {
                    inner.remove_entry(self, index, RemovalCause::Explicit);
                    true
                }
                Some(_) => false,
                None => {
                    if holder.is_active() {
                        inner.remove_entry(self, index, RemovalCause::Collected);
                    }
                    false
                }
            }
        })
    }

    pub fn replace(&self, hash: u32, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
        let now = self.shared.ticker.read();
        self.with_lock(|inner| {
            inner.cleanup(self, now);
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            inner.purge_dead_keys(self, bucket);
            let index = inner.find(hash, &key, bucket)?;
            match inner.arena.entry(index).holder.get() {
                None => {
                    // Partially collected entry: clean it out, replace nothing.
                    if inner.arena.entry(index).holder.is_active() {
                        inner.remove_entry(self, index, RemovalCause::Collected);
                    }
                    None
                }
                Some(existing) => {
                    self.mod_count.fetch_add(1, Ordering::Relaxed);
                    let old =
                        std::mem::replace(&mut inner.arena.entry_mut(index).holder, ValueHolder::Unset);
                    inner.retire_holder(self, Some(key.clone()), old, RemovalCause::Replaced, Some(&value));
                    inner.set_value(self, index, &key, value, now);
                    inner.evict_entries(self, index);
                    Some(existing)
                }
            }
        })
    }

    pub fn replace_if_equals(&self, hash: u32, key: Arc<K>, expected: &V, value: Arc<V>) -> bool
    where
        V: PartialEq,
    {
        let now = self.shared.ticker.read();
        self.with_lock(|inner| {
            inner.cleanup(self, now);
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            inner.purge_dead_keys(self, bucket);
            let Some(index) = inner.find(hash, &key, bucket) else {
                return false;
            };
            match inner.arena.entry(index).holder.get() {
                None => {
                    if inner.arena.entry(index).holder.is_active() {
                        inner.remove_entry(self, index, RemovalCause::Collected);
                    }
                    false
                }
                Some(existing) if *existing == *expected => {
                    self.mod_count.fetch_add(1, Ordering::Relaxed);
                    let old =
                        std::mem::replace(&mut inner.arena.entry_mut(index).holder, ValueHolder::Unset);
                    inner.retire_holder(self, Some(key.clone()), old, RemovalCause::Replaced, Some(&value));
                    inner.set_value(self, index, &key, value, now);
                    inner.evict_entries(self, index);
                    true
                }
                Some(_) => {
                    inner.record_locked_read(self, index, now);
                    false
                }
            }
        })
    }

    /// Returns the cached value or coordinates a load so that concurrent
    /// misses on one key call the loader once.
    pub fn get_or_load<L>(self: &Arc<Self>, hash: u32, key: Arc<K>, loader: &L) -> Result<Arc<V>>
    where
        L: Loader<K, V>,
    {
        let now = self.shared.ticker.read();
        match self.read(hash, &key, now, true) {
            ReadRecord::Hit { value, refreshable } => {
                self.stats.record_hits(1);
                if refreshable {
                    if let Some(refreshed) = self.schedule_refresh(hash, key, loader, value.clone()) {
                        return Ok(refreshed);
                    }
                }
                Ok(value)
            }
            ReadRecord::Loading { promise, loader_thread } => self.wait_for_load(promise, loader_thread),
            ReadRecord::Miss => self.locked_get_or_load(hash, key, loader, now),
        }
    }

    /// Waits (uninterruptibly) for the load another caller is performing.
    fn wait_for_load(&self, promise: Promise<LoadOutcome<V>>, loader_thread: ThreadId) -> Result<Arc<V>> {
        if loader_thread == std::thread::current().id() {
            return Err(Error::RecursiveLoad);
        }
        let outcome = promise.wait();
        self.stats.record_misses(1);
        match outcome {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(Error::InvalidLoad),
            Err(error) => Err(error),
        }
    }

    fn locked_get_or_load<L>(self: &Arc<Self>, hash: u32, key: Arc<K>, loader: &L, now: u64) -> Result<Arc<V>>
    where
        L: Loader<K, V>,
    {
        let action = self.with_lock(|inner| {
            inner.cleanup(self, now);
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            inner.purge_dead_keys(self, bucket);

            if let Some(index) = inner.find(hash, &key, bucket) {
                if let ValueHolder::Loading(loading) = &inner.arena.entry(index).holder {
                    return LockedLoad::Wait(loading.promise.clone(), loading.loader_thread);
                }
                let value = inner.arena.entry(index).holder.get();
                let expired = value.is_some() && self.is_expired(inner.arena.entry(index), now);
                match value {
                    Some(value) if !expired => {
                        inner.record_locked_read(self, index, now);
                        LockedLoad::Hit(value)
                    }
                    value => {
                        // Collected or expired: notify, detach, and reuse the
                        // slot for a fresh load.
                        let cause = if value.is_some() {
                            RemovalCause::Expired
                        } else {
                            RemovalCause::Collected
                        };
                        self.mod_count.fetch_add(1, Ordering::Relaxed);
                        let old =
                            std::mem::replace(&mut inner.arena.entry_mut(index).holder, ValueHolder::Unset);
                        if old.counts() {
                            inner.count -= 1;
                        }
                        inner.detach_links(index);
                        inner.retire_holder(self, Some(key.clone()), old, cause, None);
                        let loading = LoadingHolder::new(ValueHolder::Unset);
                        let promise = loading.promise.clone();
                        inner.arena.entry_mut(index).holder = ValueHolder::Loading(loading);
                        LockedLoad::Load(promise)
                    }
                }
            } else {
                let loading = LoadingHolder::new(ValueHolder::Unset);
                let promise = loading.promise.clone();
                inner.link_new_entry(self, hash, &key, bucket, ValueHolder::Loading(loading));
                LockedLoad::Load(promise)
            }
        });
        match action {
            LockedLoad::Hit(value) => {
                self.stats.record_hits(1);
                Ok(value)
            }
            LockedLoad::Wait(promise, loader_thread) => self.wait_for_load(promise, loader_thread),
            LockedLoad::Load(promise) => self.load_and_store(hash, &key, loader, promise),
        }
    }

    /// Runs the loader outside the lock, broadcasts the outcome to waiters,
    /// and publishes the value into the table.
    fn load_and_store<L>(
        self: &Arc<Self>,
        hash: u32,
        key: &Arc<K>,
        loader: &L,
        promise: Promise<LoadOutcome<V>>,
    ) -> Result<Arc<V>>
    where
        L: Loader<K, V>,
    {
        let start = self.shared.ticker.read();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| loader.load(key)));
        let elapsed = self.shared.ticker.read().saturating_sub(start);
        let outcome: LoadOutcome<V> = match result {
            Ok(Ok(Some(value))) => Ok(Some(Arc::new(value))),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(cause)) => Err(Error::Load(cause)),
            Err(_) => Err(Error::LoadPanic),
        };
        self.stats.record_misses(1);
        promise.complete(outcome);
        // A concurrent write may have completed the promise with its own
        // value; honor the settled outcome so every coordinated caller
        // returns the same value.
        let settled = promise.wait();
        match settled {
            Ok(Some(value)) => {
                self.stats.record_load_success(elapsed);
                self.store_loaded_value(hash, key, &promise, value.clone());
                Ok(value)
            }
            Ok(None) => {
                self.stats.record_load_failure(elapsed);
                self.remove_loading(hash, key, &promise);
                Err(Error::InvalidLoad)
            }
            Err(error) => {
                self.stats.record_load_failure(elapsed);
                self.remove_loading(hash, key, &promise);
                Err(error)
            }
        }
    }

    /// Publishes a loaded value if the entry still holds the loading
    /// placeholder identified by `expected`.
    ///
    /// A concurrent writer that clobbered the placeholder wins: the loaded
    /// value is dropped and emitted as `Replaced`.
    pub(crate) fn store_loaded_value(
        &self,
        hash: u32,
        key: &Arc<K>,
        expected: &Promise<LoadOutcome<V>>,
        value: Arc<V>,
    ) -> bool {
        let now = self.shared.ticker.read();
        self.with_lock(|inner| {
            inner.cleanup(self, now);
            if inner.count + 1 > inner.threshold {
                inner.expand();
            }
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            inner.purge_dead_keys(self, bucket);

            if let Some(index) = inner.find(hash, key, bucket) {
                let (ours, collected) = {
                    let holder = &inner.arena.entry(index).holder;
                    let ours = matches!(holder, ValueHolder::Loading(l) if l.promise.ptr_eq(expected));
                    let collected = holder.get().is_none() && !matches!(holder, ValueHolder::Unset);
                    (ours, collected)
                };
                if ours || collected {
                    self.mod_count.fetch_add(1, Ordering::Relaxed);
                    let old = std::mem::replace(&mut inner.arena.entry_mut(index).holder, ValueHolder::Unset);
                    let was_counted = old.counts();
                    let cause = if old.get().is_some() {
                        RemovalCause::Replaced
                    } else {
                        RemovalCause::Collected
                    };
                    inner.retire_holder(self, Some(key.clone()), old, cause, Some(&value));
                    if !was_counted {
                        inner.count += 1;
                    }
                    inner.set_value(self, index, key, value, now);
                    inner.evict_entries(self, index);
                    true
                } else {
                    // The load lost to a direct write.
                    self.shared.bus.enqueue(RemovalNotification {
                        key: Some(key.clone()),
                        value: Some(value),
                        cause: RemovalCause::Replaced,
                    });
                    false
                }
            } else {
                self.mod_count.fetch_add(1, Ordering::Relaxed);
                let index = inner.link_new_entry(self, hash, key, bucket, ValueHolder::Unset);
                inner.set_value(self, index, key, value, now);
                inner.count += 1;
                inner.evict_entries(self, index);
                true
            }
        })
    }

    /// Unwinds a failed load: restores the previous holder for a refresh,
    /// drops the placeholder entry for a fresh load.
    pub(crate) fn remove_loading(&self, hash: u32, key: &Arc<K>, expected: &Promise<LoadOutcome<V>>) {
        self.with_lock(|inner| {
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            let Some(index) = inner.find(hash, key, bucket) else {
                return;
            };
            let (ours, had_old) = match &inner.arena.entry(index).holder {
                ValueHolder::Loading(loading) => (loading.promise.ptr_eq(expected), loading.old.is_active()),
                _ => (false, false),
            };
            if !ours {
                return;
            }
            if had_old {
                let holder = std::mem::replace(&mut inner.arena.entry_mut(index).holder, ValueHolder::Unset);
                match holder {
                    ValueHolder::Loading(loading) => {
                        inner.arena.entry_mut(index).holder = *loading.old;
                    }
                    _ => unreachable!("loading holder changed under the stripe lock"),
                }
            } else {
                inner.remove_entry(self, index, RemovalCause::Explicit);
            }
        })
    }

    /// Triggers a refresh if one is not already running; returns the new
    /// value when the reload completed synchronously.
    fn schedule_refresh<L>(self: &Arc<Self>, hash: u32, key: Arc<K>, loader: &L, _old: Arc<V>) -> Option<Arc<V>>
    where
        L: Loader<K, V>,
    {
        self.refresh_inner(hash, key, loader, true)
    }

    /// Explicit refresh: reloads even when the entry is fresh, loads when it
    /// is absent. Failures are logged and swallowed.
    pub fn refresh<L>(self: &Arc<Self>, hash: u32, key: Arc<K>, loader: &L)
    where
        L: Loader<K, V>,
    {
        let _ = self.refresh_inner(hash, key, loader, false);
    }

    fn refresh_inner<L>(self: &Arc<Self>, hash: u32, key: Arc<K>, loader: &L, check_time: bool) -> Option<Arc<V>>
    where
        L: Loader<K, V>,
    {
        let now = self.shared.ticker.read();
        let installed = self.with_lock(|inner| {
            inner.cleanup(self, now);
            let bucket = (hash as usize) & (inner.buckets.len() - 1);
            inner.purge_dead_keys(self, bucket);
            if let Some(index) = inner.find(hash, &key, bucket) {
                {
                    let entry = inner.arena.entry(index);
                    if entry.holder.is_loading()
                        || (check_time
                            && self.shared.refresh_nanos > 0
                            && now.saturating_sub(entry.write_time) < self.shared.refresh_nanos)
                    {
                        // Already refreshing, or another caller just did.
                        return None;
                    }
                }
                self.mod_count.fetch_add(1, Ordering::Relaxed);
                let old = std::mem::replace(&mut inner.arena.entry_mut(index).holder, ValueHolder::Unset);
                let loading = LoadingHolder::new(old);
                let promise = loading.promise.clone();
                let old_value = loading.old.get();
                inner.arena.entry_mut(index).holder = ValueHolder::Loading(loading);
                Some((promise, old_value))
            } else {
                let loading = LoadingHolder::new(ValueHolder::Unset);
                let promise = loading.promise.clone();
                inner.link_new_entry(self, hash, &key, bucket, ValueHolder::Loading(loading));
                Some((promise, None))
            }
        })?;
        let (promise, old_value) = installed;

        let start = self.shared.ticker.read();
        let step = match old_value {
            None => {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| loader.load(&key)));
                RefreshStep::Done(match result {
                    Ok(Ok(Some(value))) => Ok(Some(Arc::new(value))),
                    Ok(Ok(None)) => Ok(None),
                    Ok(Err(cause)) => Err(Error::Load(cause)),
                    Err(_) => Err(Error::LoadPanic),
                })
            }
            Some(old) => match std::panic::catch_unwind(AssertUnwindSafe(|| loader.reload(&key, old))) {
                Ok(Reload::Done(result)) => RefreshStep::Done(match result {
                    Ok(Some(value)) => Ok(Some(Arc::new(value))),
                    Ok(None) => Ok(None),
                    Err(cause) => Err(Error::Load(cause)),
                }),
                Ok(Reload::Pending(future)) => RefreshStep::Pending(future),
                Err(_) => RefreshStep::Done(Err(Error::LoadPanic)),
            },
        };

        match step {
            RefreshStep::Done(outcome) => {
                let elapsed = self.shared.ticker.read().saturating_sub(start);
                promise.complete(outcome.clone());
                match outcome {
                    Ok(Some(value)) => {
                        self.stats.record_load_success(elapsed);
                        self.store_loaded_value(hash, &key, &promise, value.clone());
                        Some(value)
                    }
                    Ok(None) => {
                        self.stats.record_load_failure(elapsed);
                        tracing::warn!("refresh produced no value; keeping the previous value");
                        self.remove_loading(hash, &key, &promise);
                        None
                    }
                    Err(error) => {
                        self.stats.record_load_failure(elapsed);
                        tracing::warn!(error = %error, "refresh failed; keeping the previous value");
                        self.remove_loading(hash, &key, &promise);
                        None
                    }
                }
            }
            RefreshStep::Pending(future) => {
                // The reload completes on the completer's thread; publish the
                // result from there. The reader keeps the old value.
                let stripe = self.clone();
                let completion = promise.clone();
                future.promise.on_complete(move |result| {
                    let elapsed = stripe.shared.ticker.read().saturating_sub(start);
                    let outcome: LoadOutcome<V> = match result {
                        Ok(Some(value)) => Ok(Some(value.clone())),
                        Ok(None) => Ok(None),
                        Err(cause) => Err(Error::Load(cause.clone())),
                    };
                    completion.complete(outcome.clone());
                    match outcome {
                        Ok(Some(value)) => {
                            stripe.stats.record_load_success(elapsed);
                            stripe.store_loaded_value(hash, &key, &completion, value);
                        }
                        Ok(None) => {
                            stripe.stats.record_load_failure(elapsed);
                            tracing::warn!("refresh produced no value; keeping the previous value");
                            stripe.remove_loading(hash, &key, &completion);
                        }
                        Err(error) => {
                            stripe.stats.record_load_failure(elapsed);
                            tracing::warn!(error = %error, "refresh failed; keeping the previous value");
                            stripe.remove_loading(hash, &key, &completion);
                        }
                    }
                });
                None
            }
        }
    }

    /// Searches the whole stripe for `value`. Returns the stripe's
    /// modification count alongside for the caller's stability check.
    pub fn contains_value(&self, value: &V, now: u64) -> (bool, u64)
    where
        V: PartialEq,
    {
        // Acquire-read the count first so the table walk observes the writes
        // it published.
        let _ = self.count.load(Ordering::Acquire);
        let inner = self.inner.read();
        for bucket in 0..inner.buckets.len() {
            let mut index = inner.buckets[bucket];
            while index != NIL {
                let entry = inner.arena.entry(index);
                if entry.key.get().is_some() && !self.is_expired(entry, now) {
                    if let Some(live) = entry.holder.get() {
                        if *live == *value {
                            return (true, self.mod_count());
                        }
                    }
                }
                index = entry.next;
            }
        }
        (false, self.mod_count())
    }

    /// Live `(key, value)` pairs of one bucket, for the weakly-consistent
    /// iterator.
    pub fn snapshot_bucket(&self, bucket: usize, now: u64) -> Vec<(Arc<K>, Arc<V>)> {
        let inner = self.inner.read();
        if bucket >= inner.buckets.len() {
            return Vec::new();
        }
        let mut pairs = Vec::new();
        let mut index = inner.buckets[bucket];
        while index != NIL {
            let entry = inner.arena.entry(index);
            if !self.is_expired(entry, now) {
                if let (Some(key), Some(value)) = (entry.key.get(), entry.holder.get()) {
                    pairs.push((key, value));
                }
            }
            index = entry.next;
        }
        pairs
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.read().buckets.len()
    }

    /// Locked maintenance: drains the reclamation channels and the recency
    /// buffer, expires past-due entries, then delivers notifications.
    pub fn run_cleanup(&self) {
        let now = self.shared.ticker.read();
        self.with_lock(|inner| inner.cleanup(self, now));
    }

    pub fn clear(&self) {
        self.with_lock(|inner| {
            if inner.arena.len() == 0 {
                return;
            }
            for bucket in 0..inner.buckets.len() {
                let mut index = inner.buckets[bucket];
                while index != NIL {
                    let entry = inner.arena.entry(index);
                    if entry.holder.is_active() {
                        self.shared.bus.enqueue(RemovalNotification {
                            key: entry.key.get(),
                            value: entry.holder.get(),
                            cause: RemovalCause::Explicit,
                        });
                    }
                    index = entry.next;
                }
            }
            for bucket in inner.buckets.iter_mut() {
                *bucket = NIL;
            }
            inner.access_queue.clear();
            inner.write_queue.clear();
            inner.arena.clear();
            inner.count = 0;
            inner.total_weight = 0;
            self.key_reclaim.drain_discard();
            self.value_reclaim.drain_discard();
            while self.recency.pop().is_some() {}
            self.read_count.store(0, Ordering::Relaxed);
            self.mod_count.fetch_add(1, Ordering::Relaxed);
        })
    }
}

impl<K, V> StripeInner<K, V>
where
    K: Key,
    V: Value,
{
    /// Pre-write and amortized cleanup: reclamation channels, recency drain,
    /// expiration. Resets the read counter.
    fn cleanup(&mut self, stripe: &Stripe<K, V>, now: u64) {
        self.drain_reclaim(stripe);
        self.expire_entries(stripe, now);
        stripe.read_count.store(0, Ordering::Relaxed);
    }

    fn drain_reclaim(&mut self, stripe: &Stripe<K, V>) {
        if stripe.shared.key_strength == Strength::Strong && stripe.shared.value_strength == Strength::Strong {
            return;
        }
        for _ in 0..RECLAIM_DRAIN_LIMIT {
            let Some((index, generation)) = stripe.key_reclaim.pop() else {
                break;
            };
            let dead = matches!(self.arena.get(index, generation), Some(entry) if entry.key.get().is_none());
            if dead {
                self.remove_entry(stripe, index, RemovalCause::Collected);
            }
        }
        for _ in 0..RECLAIM_DRAIN_LIMIT {
            let Some((index, generation)) = stripe.value_reclaim.pop() else {
                break;
            };
            let dead = matches!(
                self.arena.get(index, generation),
                Some(entry) if matches!(&entry.holder, ValueHolder::Weak { value, .. } if value.upgrade().is_none())
            );
            if dead {
                self.remove_entry(stripe, index, RemovalCause::Collected);
            }
        }
    }

    /// Applies staged recency records to the access queue.
    ///
    /// Records whose entry was removed (or whose slot was recycled) in the
    /// meantime no longer match their generation and are dropped.
    fn drain_recency(&mut self, stripe: &Stripe<K, V>) {
        if !stripe.shared.shape.contains(Shape::ACCESS) {
            return;
        }
        while let Some((index, generation)) = stripe.recency.pop() {
            if self.arena.get(index, generation).is_none() {
                continue;
            }
            if !self.arena.entry(index).access_link.is_detached(index) {
                self.access_queue.move_to_back(&mut AccessLinks(&mut self.arena), index);
            }
        }
    }

    /// Expires past-due entries from the heads of both ordering queues.
    fn expire_entries(&mut self, stripe: &Stripe<K, V>, now: u64) {
        self.drain_recency(stripe);
        if stripe.shared.write_ttl > 0 {
            while let Some(head) = self.write_queue.front() {
                if stripe.is_expired(self.arena.entry(head), now) {
                    self.remove_entry(stripe, head, RemovalCause::Expired);
                } else {
                    break;
                }
            }
        }
        if stripe.shared.access_ttl > 0 {
            while let Some(head) = self.access_queue.front() {
                if stripe.is_expired(self.arena.entry(head), now) {
                    self.remove_entry(stripe, head, RemovalCause::Expired);
                } else {
                    break;
                }
            }
        }
    }

    /// Removes dead-key entries from one bucket chain before a locked walk.
    fn purge_dead_keys(&mut self, stripe: &Stripe<K, V>, bucket: usize) {
        if !stripe.shared.shape.contains(Shape::WEAK_KEY) {
            return;
        }
        loop {
            let mut dead = NIL;
            let mut index = self.buckets[bucket];
            while index != NIL {
                let entry = self.arena.entry(index);
                if entry.key.get().is_none() {
                    dead = index;
                    break;
                }
                index = entry.next;
            }
            if dead == NIL {
                break;
            }
            self.remove_entry(stripe, dead, RemovalCause::Collected);
        }
    }

    fn find(&self, hash: u32, key: &K, bucket: usize) -> Option<u32> {
        let mut index = self.buckets[bucket];
        while index != NIL {
            let entry = self.arena.entry(index);
            if entry.hash == hash && entry.key.matches(key) == Some(true) {
                return Some(index);
            }
            index = entry.next;
        }
        None
    }

    /// Allocates an entry and links it at the head of its bucket chain.
    fn link_new_entry(
        &mut self,
        stripe: &Stripe<K, V>,
        hash: u32,
        key: &Arc<K>,
        bucket: usize,
        holder: ValueHolder<V>,
    ) -> u32 {
        let slot = KeySlot::new(key.clone(), stripe.shared.key_strength);
        let head = self.buckets[bucket];
        let index = self.arena.insert_with(|index| Entry::new(index, slot, hash, head, holder));
        self.buckets[bucket] = index;
        index
    }

    /// Installs a value holder and records the write: timestamps, ordering
    /// queues, and the weight total.
    fn set_value(&mut self, stripe: &Stripe<K, V>, index: u32, key: &Arc<K>, value: Arc<V>, now: u64) {
        let weight = (stripe.shared.weigher)(key, &value);
        let holder = ValueHolder::for_value(value, weight, stripe.shared.value_strength);
        self.arena.entry_mut(index).holder = holder;
        self.record_write(stripe, index, weight, now);
    }

    fn record_write(&mut self, stripe: &Stripe<K, V>, index: u32, weight: u32, now: u64) {
        let shape = stripe.shared.shape;
        {
            let entry = self.arena.entry_mut(index);
            if shape.contains(Shape::ACCESS) {
                entry.access_time.store(now, Ordering::Relaxed);
            }
            if stripe.shared.records_write_time {
                entry.write_time = now;
            }
        }
        self.total_weight += weight as u64;
        if shape.contains(Shape::ACCESS) {
            if self.arena.entry(index).access_link.is_detached(index) {
                self.access_queue.push_back(&mut AccessLinks(&mut self.arena), index);
            } else {
                self.access_queue.move_to_back(&mut AccessLinks(&mut self.arena), index);
            }
        }
        if shape.contains(Shape::WRITE) {
            if self.arena.entry(index).write_link.is_detached(index) {
                self.write_queue.push_back(&mut WriteLinks(&mut self.arena), index);
            } else {
                self.write_queue.move_to_back(&mut WriteLinks(&mut self.arena), index);
            }
        }
    }

    /// Access bookkeeping for a hit observed under the lock.
    fn record_locked_read(&mut self, stripe: &Stripe<K, V>, index: u32, now: u64) {
        if !stripe.shared.shape.contains(Shape::ACCESS) {
            return;
        }
        self.arena.entry(index).access_time.store(now, Ordering::Relaxed);
        if self.arena.entry(index).access_link.is_detached(index) {
            self.access_queue.push_back(&mut AccessLinks(&mut self.arena), index);
        } else {
            self.access_queue.move_to_back(&mut AccessLinks(&mut self.arena), index);
        }
    }

    fn detach_links(&mut self, index: u32) {
        if !self.arena.entry(index).access_link.is_detached(index) {
            self.access_queue.remove(&mut AccessLinks(&mut self.arena), index);
        }
        if !self.arena.entry(index).write_link.is_detached(index) {
            self.write_queue.remove(&mut WriteLinks(&mut self.arena), index);
        }
    }

    /// Removes the entry at `index` from the table and both queues, then
    /// retires its holder.
    fn remove_entry(&mut self, stripe: &Stripe<K, V>, index: u32, cause: RemovalCause) {
        let hash = self.arena.entry(index).hash;
        let bucket = (hash as usize) & (self.buckets.len() - 1);
        let mut prev = NIL;
        let mut cursor = self.buckets[bucket];
        while cursor != NIL && cursor != index {
            prev = cursor;
            cursor = self.arena.entry(cursor).next;
        }
        assert_eq!(cursor, index, "entry missing from its bucket chain");
        let next = self.arena.entry(index).next;
        if prev == NIL {
            self.buckets[bucket] = next;
        } else {
            self.arena.entry_mut(prev).next = next;
        }
        self.detach_links(index);
        let entry = self.arena.remove(index);
        if entry.holder.counts() {
            self.count -= 1;
        }
        stripe.mod_count.fetch_add(1, Ordering::Relaxed);
        self.retire_holder(stripe, entry.key.get(), entry.holder, cause, None);
    }

    /// Settles a holder that left the table: releases its weight, completes a
    /// clobbered load with the value that replaced it, and emits exactly one
    /// notification unless the holder was a superseded placeholder.
    fn retire_holder(
        &mut self,
        stripe: &Stripe<K, V>,
        key: Option<Arc<K>>,
        holder: ValueHolder<V>,
        cause: RemovalCause,
        replacement: Option<&Arc<V>>,
    ) {
        self.total_weight = self.total_weight.saturating_sub(holder.weight() as u64);
        if let (ValueHolder::Loading(loading), Some(value)) = (&holder, replacement) {
            loading.promise.complete(Ok(Some(value.clone())));
        }
        let value = holder.get();
        if holder.is_active() || value.is_some() {
            if cause.was_evicted() {
                stripe.stats.record_evictions(1);
            }
            stripe.shared.bus.enqueue(RemovalNotification { key, value, cause });
        }
    }

    /// Weight-based eviction, run after every write.
    ///
    /// Per-stripe LRU approximation: an entry heavier than the whole stripe
    /// cap is removed outright, then least-recently-accessed entries with
    /// positive weight go until the stripe fits.
    fn evict_entries(&mut self, stripe: &Stripe<K, V>, just_written: u32) {
        let Some(max) = stripe.max_weight else {
            return;
        };
        self.drain_recency(stripe);
        if self.arena.entry(just_written).holder.weight() as u64 > max {
            self.remove_entry(stripe, just_written, RemovalCause::Size);
        }
        while self.total_weight > max {
            // Every weighted entry is access-linked, so a candidate must
            // exist while the total is positive.
            let Some(victim) = self.next_evictable() else {
                panic!("over the weight cap with no evictable entry");
            };
            self.remove_entry(stripe, victim, RemovalCause::Size);
        }
    }

    /// The eldest access-queue entry with positive weight.
    fn next_evictable(&self) -> Option<u32> {
        let mut cursor = self.access_queue.front()?;
        loop {
            let entry = self.arena.entry(cursor);
            if entry.holder.weight() > 0 {
                return Some(cursor);
            }
            let next = entry.access_link.next();
            if next == NIL {
                return None;
            }
            cursor = next;
        }
    }

    /// Doubles the bucket table and redistributes the chains.
    fn expand(&mut self) {
        let old_len = self.buckets.len();
        if old_len >= MAX_BUCKETS {
            return;
        }
        let new_len = old_len * 2;
        let mask = new_len - 1;
        let mut new_buckets = vec![NIL; new_len];
        for bucket in 0..old_len {
            let mut index = self.buckets[bucket];
            while index != NIL {
                let next = self.arena.entry(index).next;
                let new_bucket = (self.arena.entry(index).hash as usize) & mask;
                self.arena.entry_mut(index).next = new_buckets[new_bucket];
                new_buckets[new_bucket] = index;
                index = next;
            }
        }
        self.buckets = new_buckets;
        self.threshold = new_len * 3 / 4;
    }
}
