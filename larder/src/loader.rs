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

use std::{collections::HashMap, sync::Arc};

use larder_common::{
    code::{Key, Value},
    promise::Promise,
};

use crate::error::LoadError;

/// Result of one upstream load.
///
/// `Ok(None)` is the "no value exists for this key" domain outcome and is
/// distinct from a loader failure; the cache surfaces it to loading callers
/// as [`Error::InvalidLoad`](crate::Error::InvalidLoad).
pub type LoadResult<V> = std::result::Result<Option<V>, LoadError>;

pub(crate) type ReloadOutcome<V> = std::result::Result<Option<Arc<V>>, LoadError>;

/// Computes values for the cache.
///
/// `load` runs on the thread that missed, while every other concurrent caller
/// for the same key waits for its result. `reload` and `load_all` are
/// optional refinements for refresh-ahead and bulk lookup.
pub trait Loader<K, V>: Send + Sync + 'static
where
    K: Key,
    V: Value,
{
    fn load(&self, key: &K) -> LoadResult<V>;

    /// Recomputes the value of `key` during refresh-ahead.
    ///
    /// The default performs a synchronous `load` on the calling thread.
    /// Return [`Reload::Pending`] to complete the reload from another thread;
    /// readers keep observing `old` until the pending reload completes.
    fn reload(&self, key: &K, old: Arc<V>) -> Reload<V> {
        let _ = old;
        Reload::Done(self.load(key))
    }

    /// Loads values for several keys at once.
    ///
    /// `None` means the loader has no batch support and the cache falls back
    /// to per-key loads. A returned map may contain extra keys (they are
    /// cached too), but omitting a requested key is an
    /// [`Error::InvalidLoad`](crate::Error::InvalidLoad).
    fn load_all(&self, keys: &[Arc<K>]) -> Option<std::result::Result<HashMap<K, V>, LoadError>> {
        let _ = keys;
        None
    }
}

/// Outcome of [`Loader::reload`].
pub enum Reload<V: Value> {
    /// The reload finished synchronously.
    Done(LoadResult<V>),
    /// The reload completes later through the paired [`ReloadCompleter`].
    Pending(ReloadFuture<V>),
}

impl<V> Reload<V>
where
    V: Value,
{
    /// Creates a pending reload and the completer that fulfills it.
    pub fn pending() -> (Self, ReloadCompleter<V>) {
        let promise = Promise::pending();
        (
            Self::Pending(ReloadFuture {
                promise: promise.clone(),
            }),
            ReloadCompleter { promise },
        )
    }
}

/// Handle the cache uses to observe a pending reload.
pub struct ReloadFuture<V: Value> {
    pub(crate) promise: Promise<ReloadOutcome<V>>,
}

/// Write side of a pending reload.
///
/// Dropping the completer without completing it fails the reload, so an
/// abandoned refresh can never strand the cache entry in its loading state.
pub struct ReloadCompleter<V: Value> {
    promise: Promise<ReloadOutcome<V>>,
}

impl<V> ReloadCompleter<V>
where
    V: Value,
{
    /// Publishes the reload result. The new value is stored and swapped in by
    /// the cache on this thread.
    pub fn complete(self, result: LoadResult<V>) {
        self.promise.complete(result.map(|value| value.map(Arc::new)));
    }
}

impl<V: Value> Drop for ReloadCompleter<V> {
    fn drop(&mut self) {
        if !self.promise.is_ready() {
            self.promise.complete(Err(Arc::new(AbandonedReload)));
        }
    }
}

#[derive(Debug)]
struct AbandonedReload;

impl std::fmt::Display for AbandonedReload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("reload completer dropped without a result")
    }
}

impl std::error::Error for AbandonedReload {}

/// Adapts a closure into a [`Loader`].
pub struct LoaderFn<F>(F);

impl<F> LoaderFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<K, V, F> Loader<K, V> for LoaderFn<F>
where
    K: Key,
    V: Value,
    F: Fn(&K) -> LoadResult<V> + Send + Sync + 'static,
{
    fn load(&self, key: &K) -> LoadResult<V> {
        (self.0)(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_fn() {
        let loader = LoaderFn::new(|key: &u64| -> LoadResult<u64> { Ok(Some(key * 2)) });
        assert_eq!(Loader::<u64, u64>::load(&loader, &21).unwrap(), Some(42));
        assert!(Loader::<u64, u64>::load_all(&loader, &[]).is_none());
    }

    #[test]
    fn test_default_reload_is_synchronous() {
        let loader = LoaderFn::new(|key: &u64| -> LoadResult<u64> { Ok(Some(key + 1)) });
        match Loader::<u64, u64>::reload(&loader, &1, Arc::new(0)) {
            Reload::Done(result) => assert_eq!(result.unwrap(), Some(2)),
            Reload::Pending(_) => panic!("default reload must run inline"),
        }
    }

    #[test]
    fn test_pending_reload_pair() {
        let (reload, completer) = Reload::<u64>::pending();
        let future = match reload {
            Reload::Pending(future) => future,
            Reload::Done(_) => unreachable!(),
        };
        assert!(future.promise.try_get().is_none());
        completer.complete(Ok(Some(7)));
        assert_eq!(future.promise.try_get().unwrap().unwrap().map(|v| *v), Some(7));
    }
}
