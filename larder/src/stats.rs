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

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-stripe statistics counter.
///
/// Aggregated across stripes by [`Cache::stats`](crate::Cache::stats).
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    total_load_time_nanos: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounter {
    pub fn record_hits(&self, count: u64) {
        self.hits.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_misses(&self, count: u64) {
        self.misses.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_load_success(&self, load_time_nanos: u64) {
        self.load_successes.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_nanos.fetch_add(load_time_nanos, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self, load_time_nanos: u64) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_nanos.fetch_add(load_time_nanos, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn fold_into(&self, stats: &mut CacheStats) {
        stats.hit_count += self.hits.load(Ordering::Relaxed);
        stats.miss_count += self.misses.load(Ordering::Relaxed);
        stats.load_success_count += self.load_successes.load(Ordering::Relaxed);
        stats.load_failure_count += self.load_failures.load(Ordering::Relaxed);
        stats.total_load_time_nanos += self.total_load_time_nanos.load(Ordering::Relaxed);
        stats.eviction_count += self.evictions.load(Ordering::Relaxed);
    }
}

/// A snapshot of cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub load_success_count: u64,
    pub load_failure_count: u64,
    pub total_load_time_nanos: u64,
    pub eviction_count: u64,
}

impl CacheStats {
    pub fn request_count(&self) -> u64 {
        self.hit_count + self.miss_count
    }

    pub fn load_count(&self) -> u64 {
        self.load_success_count + self.load_failure_count
    }

    /// Ratio of requests that were hits, `1.0` when no requests were made.
    pub fn hit_rate(&self) -> f64 {
        match self.request_count() {
            0 => 1.0,
            n => self.hit_count as f64 / n as f64,
        }
    }

    /// Average nanoseconds spent per load, `0.0` when nothing was loaded.
    pub fn average_load_penalty_nanos(&self) -> f64 {
        match self.load_count() {
            0 => 0.0,
            n => self.total_load_time_nanos as f64 / n as f64,
        }
    }
}
