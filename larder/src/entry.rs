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

use std::{
    sync::{
        atomic::AtomicU64,
        Arc, Weak,
    },
    thread::ThreadId,
};

use larder_common::{code::Value, promise::Promise};
use larder_intrusive::{Link, NIL};

use crate::error::Result;

bitflags::bitflags! {
    /// The entry shape of a cache, fixed at construction.
    ///
    /// Selects which reference strengths, timestamps, and queue links the
    /// entries of the cache maintain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Shape: u8 {
        /// Keys are held through a `Weak` reference.
        const WEAK_KEY = 0b001;
        /// Access order is tracked (access expiration or size eviction).
        const ACCESS = 0b010;
        /// Write order is tracked (write expiration).
        const WRITE = 0b100;
    }
}

/// How strongly the cache holds its keys or values.
///
/// `Weak` entries are reclaimed cooperatively once the last `Arc` outside
/// the cache is dropped, emitting a `Collected` removal notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strength {
    #[default]
    Strong,
    Weak,
}

/// A key held by an entry, either owned or reclaimable.
pub(crate) enum KeySlot<K> {
    Strong(Arc<K>),
    Weak(Weak<K>),
}

impl<K> KeySlot<K> {
    pub fn new(key: Arc<K>, strength: Strength) -> Self {
        match strength {
            Strength::Strong => Self::Strong(key),
            Strength::Weak => Self::Weak(Arc::downgrade(&key)),
        }
    }

    pub fn get(&self) -> Option<Arc<K>> {
        match self {
            Self::Strong(key) => Some(key.clone()),
            Self::Weak(key) => key.upgrade(),
        }
    }

    /// Compares against `key`, or returns `None` if this key was reclaimed.
    pub fn matches(&self, key: &K) -> Option<bool>
    where
        K: Eq,
    {
        match self {
            Self::Strong(own) => Some(**own == *key),
            Self::Weak(own) => own.upgrade().map(|own| *own == *key),
        }
    }
}

/// The result of a load, broadcast to every waiter of a loading holder.
pub(crate) type LoadOutcome<V> = Result<Option<Arc<V>>>;

/// An in-flight load occupying an entry.
///
/// Preserves the previous holder so readers keep observing the old value
/// during a refresh, and records the loading thread to fail recursive loads
/// fast instead of deadlocking.
pub(crate) struct LoadingHolder<V> {
    pub old: Box<ValueHolder<V>>,
    pub promise: Promise<LoadOutcome<V>>,
    pub loader_thread: ThreadId,
}

impl<V> LoadingHolder<V>
where
    V: Value,
{
    pub fn new(old: ValueHolder<V>) -> Self {
        Self {
            old: Box::new(old),
            promise: Promise::pending(),
            loader_thread: std::thread::current().id(),
        }
    }
}

/// The carrier of an entry's value.
pub(crate) enum ValueHolder<V> {
    /// Placeholder of a freshly allocated entry before its first value.
    Unset,
    Strong {
        value: Arc<V>,
        weight: u32,
    },
    Weak {
        value: Weak<V>,
        weight: u32,
    },
    Loading(LoadingHolder<V>),
}

impl<V> ValueHolder<V>
where
    V: Value,
{
    pub fn for_value(value: Arc<V>, weight: u32, strength: Strength) -> Self {
        match strength {
            Strength::Strong => Self::Strong { value, weight },
            Strength::Weak => Self::Weak {
                value: Arc::downgrade(&value),
                weight,
            },
        }
    }

    /// The current value, or `None` if unset, reclaimed, or freshly loading.
    ///
    /// A loading holder reports the value it is refreshing over.
    pub fn get(&self) -> Option<Arc<V>> {
        match self {
            Self::Unset => None,
            Self::Strong { value, .. } => Some(value.clone()),
            Self::Weak { value, .. } => value.upgrade(),
            Self::Loading(loading) => loading.old.get(),
        }
    }

    /// The weight charged against the stripe cap.
    ///
    /// A loading holder carries the weight of the value it wraps, so the
    /// stripe total stays balanced until the new value is stored.
    pub fn weight(&self) -> u32 {
        match self {
            Self::Unset => 0,
            Self::Strong { weight, .. } | Self::Weak { weight, .. } => *weight,
            Self::Loading(loading) => loading.old.weight(),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading(_))
    }

    /// Whether a real value was ever populated.
    ///
    /// A fresh loading placeholder is not active; a loading holder wrapping a
    /// prior value is.
    pub fn is_active(&self) -> bool {
        match self {
            Self::Unset => false,
            Self::Strong { .. } | Self::Weak { .. } => true,
            Self::Loading(loading) => loading.old.is_active(),
        }
    }

    /// Whether this holder contributes to the stripe's entry count.
    ///
    /// Loading placeholders without a prior value are in the table but not
    /// counted until their value lands.
    pub fn counts(&self) -> bool {
        !self.is_loading() || self.is_active()
    }
}

/// One cached mapping.
///
/// Entries are owned by a stripe arena and linked by index: `next` chains
/// within a hash bucket, `access_link`/`write_link` thread the two ordering
/// deques. `access_time` is atomic because the read path updates it without
/// the stripe lock; everything else is guarded by the lock.
pub(crate) struct Entry<K, V> {
    pub key: KeySlot<K>,
    pub hash: u32,
    pub next: u32,
    pub holder: ValueHolder<V>,
    pub access_time: AtomicU64,
    pub write_time: u64,
    pub access_link: Link,
    pub write_link: Link,
}

impl<K, V> Entry<K, V> {
    pub fn new(index: u32, key: KeySlot<K>, hash: u32, next: u32, holder: ValueHolder<V>) -> Self {
        Self {
            key,
            hash,
            next,
            holder,
            access_time: AtomicU64::new(0),
            write_time: 0,
            access_link: Link::detached(index),
            write_link: Link::detached(index),
        }
    }
}

enum SlotState<K, V> {
    Vacant { next_free: u32 },
    Occupied(Entry<K, V>),
}

struct Slot<K, V> {
    generation: u32,
    state: SlotState<K, V>,
}

/// Slab of entries addressed by `u32` index.
///
/// Each slot carries a generation bumped on removal, so indices staged in the
/// lock-free recency and reclamation channels can be validated after the
/// fact: a popped `(index, generation)` that no longer matches refers to an
/// entry that was removed (and possibly replaced) concurrently.
pub(crate) struct Arena<K, V> {
    slots: Vec<Slot<K, V>>,
    free_head: u32,
    len: usize,
}

impl<K, V> Arena<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Inserts the entry produced by `f`, which receives the entry's index.
    pub fn insert_with(&mut self, f: impl FnOnce(u32) -> Entry<K, V>) -> u32 {
        self.len += 1;
        if self.free_head != NIL {
            let index = self.free_head;
            let slot = &mut self.slots[index as usize];
            self.free_head = match slot.state {
                SlotState::Vacant { next_free } => next_free,
                SlotState::Occupied(_) => unreachable!("occupied slot on the free list"),
            };
            slot.state = SlotState::Occupied(f(index));
            index
        } else {
            let index = self.slots.len() as u32;
            debug_assert_ne!(index, NIL);
            self.slots.push(Slot {
                generation: 0,
                state: SlotState::Occupied(f(index)),
            });
            index
        }
    }

    pub fn entry(&self, index: u32) -> &Entry<K, V> {
        match &self.slots[index as usize].state {
            SlotState::Occupied(entry) => entry,
            SlotState::Vacant { .. } => unreachable!("vacant arena slot referenced by index {index}"),
        }
    }

    pub fn entry_mut(&mut self, index: u32) -> &mut Entry<K, V> {
        match &mut self.slots[index as usize].state {
            SlotState::Occupied(entry) => entry,
            SlotState::Vacant { .. } => unreachable!("vacant arena slot referenced by index {index}"),
        }
    }

    pub fn generation(&self, index: u32) -> u32 {
        self.slots[index as usize].generation
    }

    /// The entry at `index` if it is still the occupancy observed at
    /// `generation`.
    pub fn get(&self, index: u32, generation: u32) -> Option<&Entry<K, V>> {
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        match &slot.state {
            SlotState::Occupied(entry) => Some(entry),
            SlotState::Vacant { .. } => None,
        }
    }

    pub fn remove(&mut self, index: u32) -> Entry<K, V> {
        let slot = &mut self.slots[index as usize];
        let state = std::mem::replace(
            &mut slot.state,
            SlotState::Vacant {
                next_free: self.free_head,
            },
        );
        match state {
            SlotState::Occupied(entry) => {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_head = index;
                self.len -= 1;
                entry
            }
            SlotState::Vacant { .. } => unreachable!("removing vacant arena slot {index}"),
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::Occupied(_)) {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.slots.clear();
        self.free_head = NIL;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strong_entry(index: u32, key: u64, value: u64) -> Entry<u64, u64> {
        Entry::new(
            index,
            KeySlot::new(Arc::new(key), Strength::Strong),
            key as u32,
            NIL,
            ValueHolder::Strong {
                value: Arc::new(value),
                weight: 1,
            },
        )
    }

    #[test]
    fn test_holder_states() {
        let unset: ValueHolder<u64> = ValueHolder::Unset;
        assert!(!unset.is_active());
        assert!(!unset.is_loading());
        assert_eq!(unset.weight(), 0);
        assert!(unset.get().is_none());

        let strong = ValueHolder::Strong {
            value: Arc::new(7u64),
            weight: 3,
        };
        assert!(strong.is_active());
        assert_eq!(strong.weight(), 3);
        assert_eq!(strong.get().map(|v| *v), Some(7));

        // A fresh loading holder is invisible and uncounted.
        let fresh = ValueHolder::Loading(LoadingHolder::new(ValueHolder::<u64>::Unset));
        assert!(fresh.is_loading());
        assert!(!fresh.is_active());
        assert!(!fresh.counts());
        assert!(fresh.get().is_none());

        // A refreshing holder keeps serving the old value and its weight.
        let refreshing = ValueHolder::Loading(LoadingHolder::new(strong));
        assert!(refreshing.is_loading());
        assert!(refreshing.is_active());
        assert!(refreshing.counts());
        assert_eq!(refreshing.weight(), 3);
        assert_eq!(refreshing.get().map(|v| *v), Some(7));
    }

    #[test]
    fn test_weak_holder_reclaim() {
        let value = Arc::new(11u64);
        let holder = ValueHolder::for_value(value.clone(), 1, Strength::Weak);
        assert_eq!(holder.get().map(|v| *v), Some(11));
        assert!(holder.is_active());

        drop(value);
        assert!(holder.get().is_none());
        // Still active: the holder once carried a real value.
        assert!(holder.is_active());
    }

    #[test]
    fn test_arena_generations() {
        let mut arena = Arena::new();
        let a = arena.insert_with(|index| strong_entry(index, 1, 10));
        let b = arena.insert_with(|index| strong_entry(index, 2, 20));
        assert_eq!(arena.len(), 2);

        let generation = arena.generation(a);
        assert!(arena.get(a, generation).is_some());

        arena.remove(a);
        assert_eq!(arena.len(), 1);
        assert!(arena.get(a, generation).is_none());

        // Slot is recycled with a new generation.
        let c = arena.insert_with(|index| strong_entry(index, 3, 30));
        assert_eq!(c, a);
        assert_ne!(arena.generation(c), generation);
        assert!(arena.get(c, generation).is_none());
        assert_eq!(*arena.entry(b).holder.get().unwrap(), 20);
    }
}
