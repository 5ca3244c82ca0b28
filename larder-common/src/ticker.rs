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
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// A monotonic nanosecond time source.
///
/// Injectable so expiration and refresh can be tested deterministically.
pub trait Ticker: Send + Sync + 'static {
    /// Returns the number of nanoseconds elapsed since a fixed origin.
    fn read(&self) -> u64;
}

/// Ticker backed by [`Instant`], the default for production caches.
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Ticker that only advances when told to. For tests.
#[derive(Debug, Default)]
pub struct ManualTicker {
    now: AtomicU64,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `nanos`.
    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Ticker for ManualTicker {
    fn read(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
