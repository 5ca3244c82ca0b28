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

use crossbeam::queue::ArrayQueue;

/// Lock-free staging of recently read entries.
///
/// Readers append `(index, generation)` records without taking the stripe
/// lock; the next locked cleanup drains the buffer and moves the still-live
/// entries to the access-queue tail. A full buffer drops the record: losing
/// one recency update only perturbs the LRU approximation.
pub(crate) struct RecencyBuffer {
    queue: ArrayQueue<(u32, u32)>,
}

const RECENCY_BUFFER_CAPACITY: usize = 256;

impl RecencyBuffer {
    pub fn new() -> Self {
        Self {
            queue: ArrayQueue::new(RECENCY_BUFFER_CAPACITY),
        }
    }

    pub fn record(&self, index: u32, generation: u32) {
        let _ = self.queue.push((index, generation));
    }

    pub fn pop(&self) -> Option<(u32, u32)> {
        self.queue.pop()
    }
}

impl std::fmt::Debug for RecencyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecencyBuffer").field("pending", &self.queue.len()).finish()
    }
}
