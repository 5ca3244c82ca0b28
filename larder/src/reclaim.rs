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

use crossbeam::queue::SegQueue;

/// How many reclaimed entries one cleanup pass processes per channel.
pub(crate) const RECLAIM_DRAIN_LIMIT: usize = 16;

/// Channel of entries whose weak key or value was observed dead.
///
/// Readers cannot unlink an entry without the stripe lock, so they push the
/// `(index, generation)` of the dead entry here; locked cleanup drains the
/// channel (bounded per pass to avoid long pauses) and removes the entries
/// with cause `Collected`. Caches with strong keys and values never feed it.
pub(crate) struct ReclaimQueue {
    queue: SegQueue<(u32, u32)>,
}

impl ReclaimQueue {
    pub fn new() -> Self {
        Self { queue: SegQueue::new() }
    }

    pub fn push(&self, index: u32, generation: u32) {
        self.queue.push((index, generation));
    }

    pub fn pop(&self) -> Option<(u32, u32)> {
        self.queue.pop()
    }

    pub fn drain_discard(&self) {
        while self.queue.pop().is_some() {}
    }
}

impl std::fmt::Debug for ReclaimQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimQueue").field("pending", &self.queue.len()).finish()
    }
}
