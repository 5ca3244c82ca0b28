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

use std::{panic::AssertUnwindSafe, sync::Arc};

use crossbeam::queue::SegQueue;
use larder_common::code::{Key, Value};

/// Why an entry was removed from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// Removed by `invalidate` or a map-style remove.
    Explicit,
    /// Overwritten by a later write for the same key.
    Replaced,
    /// The key or value was reclaimed after its last strong reference was
    /// dropped.
    Collected,
    /// Past its access or write expiration.
    Expired,
    /// Evicted to keep the stripe under its weight cap.
    Size,
}

impl RemovalCause {
    /// Whether the removal was automatic rather than requested by a caller.
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Collected | Self::Expired | Self::Size)
    }
}

/// A removal event delivered to a [`RemovalListener`].
///
/// The key or value is absent when it had already been reclaimed.
#[derive(Debug, Clone)]
pub struct RemovalNotification<K, V> {
    pub key: Option<Arc<K>>,
    pub value: Option<Arc<V>>,
    pub cause: RemovalCause,
}

/// User sink for removal events.
///
/// May be invoked from any thread that operates on the cache, never while a
/// stripe lock is held. Panics are caught and logged.
pub trait RemovalListener<K, V>: Send + Sync + 'static {
    fn on_removal(&self, notification: RemovalNotification<K, V>);
}

/// Adapts a closure into a [`RemovalListener`].
pub struct ListenerFn<F>(F);

impl<F> ListenerFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<K, V, F> RemovalListener<K, V> for ListenerFn<F>
where
    K: Key,
    V: Value,
    F: Fn(RemovalNotification<K, V>) + Send + Sync + 'static,
{
    fn on_removal(&self, notification: RemovalNotification<K, V>) {
        (self.0)(notification)
    }
}

/// Listener that drops every notification, the default.
#[derive(Debug, Default)]
pub struct NoopListener;

impl<K, V> RemovalListener<K, V> for NoopListener
where
    K: Key,
    V: Value,
{
    fn on_removal(&self, _: RemovalNotification<K, V>) {}
}

/// The removal-notification bus.
///
/// Events are enqueued while a stripe lock is held and drained into the
/// listener after the lock is released, so a slow listener never extends a
/// critical section.
pub(crate) struct RemovalBus<K, V> {
    queue: SegQueue<RemovalNotification<K, V>>,
    listener: Arc<dyn RemovalListener<K, V>>,
}

impl<K, V> RemovalBus<K, V>
where
    K: Key,
    V: Value,
{
    pub fn new(listener: Arc<dyn RemovalListener<K, V>>) -> Self {
        Self {
            queue: SegQueue::new(),
            listener,
        }
    }

    pub fn enqueue(&self, notification: RemovalNotification<K, V>) {
        self.queue.push(notification);
    }

    pub fn drain(&self) {
        while let Some(notification) = self.queue.pop() {
            let listener = &self.listener;
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_removal(notification))).is_err() {
                tracing::warn!("removal listener panicked; notification dropped");
            }
        }
    }
}

impl<K, V> std::fmt::Debug for RemovalBus<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemovalBus").field("pending", &self.queue.len()).finish()
    }
}
