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

//! larder - a concurrent in-process loading cache.
//!
//! larder backs memoization under high concurrency with predictable latency
//! and bounded memory. The cache is partitioned into lock-striped segments,
//! each owning its own hash table, LRU/FIFO ordering queues, and statistics.
//! Reads stay on the shared path and stage their bookkeeping through
//! lock-free buffers; maintenance is amortized over caller operations, so no
//! background thread exists.
//!
//! Core capabilities:
//!
//! - weight-bounded capacity with per-stripe LRU eviction
//! - expiration after access and/or after write
//! - at-most-one-load coordination across concurrent misses
//! - refresh-ahead that serves the stale value while a reload runs
//! - `Arc`/`Weak`-backed key and value strengths with cooperative reclamation
//! - removal listeners and hit/miss/load statistics
//!
//! ```
//! use larder::{CacheBuilder, LoadResult, LoaderFn};
//!
//! let cache = CacheBuilder::new()
//!     .with_max_weight(10_000)
//!     .build_with(LoaderFn::new(|key: &String| -> LoadResult<usize> { Ok(Some(key.len())) }));
//!
//! assert_eq!(*cache.get("answer".to_string()).unwrap(), 6);
//! ```

mod builder;
mod cache;
mod entry;
mod error;
mod listener;
mod loader;
mod recency;
mod reclaim;
mod stats;
mod stripe;

pub mod prelude;

pub use builder::{CacheBuilder, Weigher};
pub use cache::{Cache, Iter, LoadingCache};
pub use entry::Strength;
pub use error::{Error, LoadError, Result};
pub use larder_common::ticker::{ManualTicker, SystemTicker, Ticker};
pub use listener::{ListenerFn, NoopListener, RemovalCause, RemovalListener, RemovalNotification};
pub use loader::{LoadResult, Loader, LoaderFn, Reload, ReloadCompleter, ReloadFuture};
pub use stats::CacheStats;
