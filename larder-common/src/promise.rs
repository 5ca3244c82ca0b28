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

use parking_lot::{Condvar, Mutex};

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

enum State<T> {
    Pending { callbacks: Vec<Callback<T>> },
    Ready(T),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// A single-shot shared future.
///
/// Any clone may complete it; the first completion wins. Waiters block on a
/// condvar, so the wait cannot be interrupted and spurious wakes are absorbed
/// by the wait loop. Callbacks registered with [`Promise::on_complete`] run on
/// the completing thread, which is how work is chained onto a completion
/// without a dedicated background thread.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise").field("ready", &self.is_ready()).finish()
    }
}

impl<T> Promise<T> {
    pub fn is_ready(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Ready(_))
    }

    /// Whether `self` and `other` are handles to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending { callbacks: vec![] }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn ready(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Ready(value)),
                cond: Condvar::new(),
            }),
        }
    }

    /// Completes the promise, waking all waiters and running the registered
    /// callbacks on the calling thread.
    ///
    /// Returns `false` if the promise was already completed; the value is
    /// dropped in that case.
    pub fn complete(&self, value: T) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Ready(_) => return false,
                State::Pending { callbacks } => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Ready(value.clone());
                    self.inner.cond.notify_all();
                    callbacks
                }
            }
        };
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Blocks until the promise is completed and returns the value.
    pub fn wait(&self) -> T {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Ready(value) = &*state {
                return value.clone();
            }
            self.inner.cond.wait(&mut state);
        }
    }

    pub fn try_get(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Ready(value) => Some(value.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Registers a callback to run when the promise completes.
    ///
    /// Runs immediately on the calling thread if the promise is already
    /// complete, otherwise later on the completing thread.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let value = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { callbacks } => {
                    callbacks.push(Box::new(f));
                    return;
                }
                State::Ready(value) => value.clone(),
            }
        };
        f(&value);
    }
}
