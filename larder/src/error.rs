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

use std::sync::Arc;

/// The cause of a failed load, as reported by a [`Loader`](crate::Loader).
///
/// Shared so one failure can be broadcast to every caller waiting on the same
/// load.
pub type LoadError = Arc<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the loading operations.
///
/// Internal invariant violations (e.g. the eviction queue yielding an entry
/// that is not in the table) are programming errors and panic instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The loader produced no value for a requested key.
    #[error("loader returned no value for the requested key")]
    InvalidLoad,
    /// The loader failed with an error.
    #[error("loader failed")]
    Load(#[source] LoadError),
    /// The loader panicked.
    #[error("loader panicked")]
    LoadPanic,
    /// A loader re-entered the cache for the key it is currently loading.
    #[error("recursive load of a key from its own loading thread")]
    RecursiveLoad,
}

pub type Result<T> = std::result::Result<T, Error>;
