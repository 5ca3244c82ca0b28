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
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc, Barrier, Mutex, OnceLock,
    },
    thread,
    time::Duration,
};

use larder::{
    Cache, CacheBuilder, Error, ListenerFn, LoadError, LoadResult, Loader, LoaderFn, ManualTicker,
    Reload, ReloadCompleter, RemovalCause, RemovalNotification, Strength,
};
use rand::{rngs::SmallRng, RngCore, SeedableRng};

type EventLog<K, V> = Arc<Mutex<Vec<(Option<K>, Option<V>, RemovalCause)>>>;

fn event_log<K, V>() -> (
    EventLog<K, V>,
    ListenerFn<impl Fn(RemovalNotification<K, V>) + Send + Sync + 'static>,
)
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let log: EventLog<K, V> = Arc::default();
    let sink = log.clone();
    let listener = ListenerFn::new(move |notification: RemovalNotification<K, V>| {
        sink.lock().unwrap().push((
            notification.key.map(|k| (*k).clone()),
            notification.value.map(|v| (*v).clone()),
            notification.cause,
        ));
    });
    (log, listener)
}

fn io_error(message: &'static str) -> LoadError {
    Arc::new(std::io::Error::other(message))
}

#[test]
fn test_basic_put_get_remove() {
    let (events, listener) = event_log::<String, u64>();
    let cache = CacheBuilder::new().build_with_listener(listener);

    assert_eq!(cache.insert("a".to_string(), 1u64), None);
    assert_eq!(cache.get_if_present(&"a".to_string()).map(|v| *v), Some(1));
    assert_eq!(cache.insert("a".to_string(), 2u64).map(|v| *v), Some(1));
    assert_eq!(cache.get_if_present(&"a".to_string()).map(|v| *v), Some(2));
    assert_eq!(cache.invalidate(&"a".to_string()).map(|v| *v), Some(2));
    assert_eq!(cache.get_if_present(&"a".to_string()), None);

    let stats = cache.stats();
    assert_eq!(stats.hit_count, 2);
    assert_eq!(stats.miss_count, 1);
    assert_eq!(stats.eviction_count, 0);

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            (Some("a".to_string()), Some(1), RemovalCause::Replaced),
            (Some("a".to_string()), Some(2), RemovalCause::Explicit),
        ]
    );
}

#[test]
fn test_size_eviction_lru() {
    let (events, listener) = event_log::<String, u64>();
    let cache = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_max_weight(3)
        .build_with_listener(listener);

    cache.insert("a".to_string(), 1u64);
    cache.insert("b".to_string(), 2u64);
    cache.insert("c".to_string(), 3u64);
    assert_eq!(cache.len(), 3);

    cache.insert("d".to_string(), 4u64);
    assert_eq!(cache.len(), 3);

    // "a" was least recently used.
    assert_eq!(cache.get_if_present(&"a".to_string()), None);
    assert_eq!(cache.get_if_present(&"b".to_string()).map(|v| *v), Some(2));
    assert_eq!(cache.get_if_present(&"c".to_string()).map(|v| *v), Some(3));
    assert_eq!(cache.get_if_present(&"d".to_string()).map(|v| *v), Some(4));

    assert_eq!(
        *events.lock().unwrap(),
        vec![(Some("a".to_string()), Some(1), RemovalCause::Size)]
    );
    assert_eq!(cache.stats().eviction_count, 1);
}

#[test]
fn test_eviction_follows_recency_not_insertion() {
    let cache: Cache<u64, u64> = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_max_weight(3)
        .build();

    cache.insert(1u64, 1u64);
    cache.insert(2u64, 2u64);
    cache.insert(3u64, 3u64);
    // Touch the eldest so 2 becomes the eviction candidate.
    assert!(cache.get_if_present(&1).is_some());

    cache.insert(4u64, 4u64);
    assert!(cache.get_if_present(&1).is_some());
    assert_eq!(cache.get_if_present(&2), None);
    assert!(cache.get_if_present(&3).is_some());
    assert!(cache.get_if_present(&4).is_some());
}

#[test]
fn test_access_expiration() {
    let ticker = Arc::new(ManualTicker::new());
    let (events, listener) = event_log::<String, u64>();
    let cache = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_expire_after_access(Duration::from_nanos(100))
        .with_ticker(ticker.clone())
        .build_with_listener(listener);

    cache.insert("k".to_string(), 1u64);

    ticker.advance(50);
    assert_eq!(cache.get_if_present(&"k".to_string()).map(|v| *v), Some(1));

    // 90ns since the last access: still live, and the read renews the clock.
    ticker.advance(90);
    assert_eq!(cache.get_if_present(&"k".to_string()).map(|v| *v), Some(1));

    // A full interval with no access expires the entry.
    ticker.advance(100);
    assert_eq!(cache.get_if_present(&"k".to_string()), None);
    assert_eq!(cache.len(), 0);

    assert_eq!(
        *events.lock().unwrap(),
        vec![(Some("k".to_string()), Some(1), RemovalCause::Expired)]
    );
}

#[test]
fn test_write_expiration() {
    let ticker = Arc::new(ManualTicker::new());
    let (events, listener) = event_log::<String, u64>();
    let cache = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_expire_after_write(Duration::from_nanos(100))
        .with_ticker(ticker.clone())
        .build_with_listener(listener);

    cache.insert("k".to_string(), 1u64);

    ticker.advance(99);
    assert_eq!(cache.get_if_present(&"k".to_string()).map(|v| *v), Some(1));

    // Reads do not renew the write clock.
    ticker.advance(1);
    assert_eq!(cache.get_if_present(&"k".to_string()), None);

    // Cleanup without further reads also reaps past-due entries.
    cache.clean_up();
    assert_eq!(cache.len(), 0);
    assert!(cache.is_empty());

    assert_eq!(
        *events.lock().unwrap(),
        vec![(Some("k".to_string()), Some(1), RemovalCause::Expired)]
    );
}

#[test]
fn test_rewrite_renews_write_expiration() {
    let ticker = Arc::new(ManualTicker::new());
    let cache: Cache<String, u64> = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_expire_after_write(Duration::from_nanos(100))
        .with_ticker(ticker.clone())
        .build();

    cache.insert("k".to_string(), 1u64);
    ticker.advance(80);
    cache.insert("k".to_string(), 2u64);
    ticker.advance(80);
    // 160ns after the first write, 80ns after the second.
    assert_eq!(cache.get_if_present(&"k".to_string()).map(|v| *v), Some(2));
}

#[test]
fn test_loader_coordination() {
    const CALLERS: usize = 10;

    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    let loader = LoaderFn::new(move |_key: &u64| -> LoadResult<u64> {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        Ok(Some(42))
    });
    let cache = CacheBuilder::new().build_with(loader);

    let barrier = Arc::new(Barrier::new(CALLERS));
    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                *cache.get(7u64).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 42);
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    let stats = cache.stats();
    assert_eq!(stats.miss_count, CALLERS as u64);
    assert_eq!(stats.load_success_count, 1);
    assert_eq!(stats.hit_count, 0);
}

#[derive(Default)]
struct RefreshLoader {
    loads: AtomicU64,
    pending: Mutex<Option<ReloadCompleter<u64>>>,
}

impl Loader<String, u64> for RefreshLoader {
    fn load(&self, _key: &String) -> LoadResult<u64> {
        Ok(Some(self.loads.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn reload(&self, _key: &String, _old: Arc<u64>) -> Reload<u64> {
        let (reload, completer) = Reload::pending();
        *self.pending.lock().unwrap() = Some(completer);
        reload
    }
}

#[test]
fn test_refresh_ahead_serves_stale_value() {
    let ticker = Arc::new(ManualTicker::new());
    let cache = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_refresh_after_write(Duration::from_nanos(100))
        .with_ticker(ticker.clone())
        .build_with(RefreshLoader::default());

    assert_eq!(*cache.get("k".to_string()).unwrap(), 1);

    // Older than the refresh interval: the read triggers a reload but keeps
    // serving the old value until the reload completes.
    ticker.advance(200);
    assert_eq!(*cache.get("k".to_string()).unwrap(), 1);

    let completer = cache.loader().pending.lock().unwrap().take().unwrap();
    completer.complete(Ok(Some(2)));

    assert_eq!(*cache.get("k".to_string()).unwrap(), 2);

    let stats = cache.stats();
    assert_eq!(stats.miss_count, 1, "refresh must not count misses");
    assert_eq!(stats.hit_count, 2);
    assert_eq!(stats.load_success_count, 2);
}

#[test]
fn test_refresh_failure_keeps_old_value() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let loader = LoaderFn::new(move |_key: &String| -> LoadResult<u64> {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Some(1))
        } else {
            Err(io_error("reload failed"))
        }
    });
    let cache = CacheBuilder::new().with_concurrency_level(1).build_with(loader);

    assert_eq!(*cache.get("k".to_string()).unwrap(), 1);

    // Explicit refresh runs the loader again and swallows the failure.
    cache.refresh("k".to_string());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get_if_present(&"k".to_string()).map(|v| *v), Some(1));
    assert_eq!(cache.stats().load_failure_count, 1);
}

#[test]
fn test_weak_values_collected() {
    let (events, listener) = event_log::<String, u64>();
    let cache = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_value_strength(Strength::Weak)
        .build_with_listener(listener);

    let value = Arc::new(7u64);
    cache.insert("k".to_string(), value.clone());
    assert_eq!(cache.get_if_present(&"k".to_string()).map(|v| *v), Some(7));

    // The caller held the last strong reference.
    drop(value);
    assert_eq!(cache.get_if_present(&"k".to_string()), None);

    cache.clean_up();
    assert_eq!(cache.len(), 0);
    assert_eq!(
        *events.lock().unwrap(),
        vec![(Some("k".to_string()), None, RemovalCause::Collected)]
    );
}

#[test]
fn test_weak_keys_collected() {
    let (events, listener) = event_log::<u64, u64>();
    let cache = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_key_strength(Strength::Weak)
        .build_with_listener(listener);

    let key = Arc::new(5u64);
    cache.insert(key.clone(), 50u64);
    assert_eq!(cache.get_if_present(&5).map(|v| *v), Some(50));

    drop(key);
    assert_eq!(cache.get_if_present(&5), None);

    cache.clean_up();
    assert_eq!(cache.len(), 0);
    assert_eq!(*events.lock().unwrap(), vec![(None, Some(50), RemovalCause::Collected)]);
}

#[test]
fn test_loader_failure_and_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let loader = LoaderFn::new(move |_key: &u64| -> LoadResult<u64> {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(io_error("backend down"))
        } else {
            Ok(Some(5))
        }
    });
    let cache = CacheBuilder::new().build_with(loader);

    match cache.get(1u64) {
        Err(Error::Load(_)) => {}
        other => panic!("expected a load failure, got {other:?}"),
    }
    // The failed load leaves no residue.
    assert_eq!(cache.len(), 0);

    assert_eq!(*cache.get(1u64).unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = cache.stats();
    assert_eq!(stats.load_failure_count, 1);
    assert_eq!(stats.load_success_count, 1);
    assert_eq!(stats.miss_count, 2);
}

#[test]
fn test_absent_load_is_invalid() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let loader = LoaderFn::new(move |_key: &u64| -> LoadResult<u64> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    });
    let cache = CacheBuilder::new().build_with(loader);

    assert!(matches!(cache.get(1u64), Err(Error::InvalidLoad)));
    assert_eq!(cache.len(), 0);
    // Nothing was cached, so the next lookup loads again.
    assert!(matches!(cache.get(1u64), Err(Error::InvalidLoad)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[derive(Default)]
struct RecursiveLoader {
    cache: OnceLock<Cache<u64, u64>>,
    saw_recursion: AtomicBool,
}

impl Loader<u64, u64> for RecursiveLoader {
    fn load(&self, key: &u64) -> LoadResult<u64> {
        match *key {
            // Re-enters the cache for the key being loaded.
            1 => match self.cache.get().unwrap().get_with(1u64, self) {
                Err(Error::RecursiveLoad) => {
                    self.saw_recursion.store(true, Ordering::SeqCst);
                    Ok(Some(99))
                }
                other => panic!("expected recursion detection, got {other:?}"),
            },
            // Loads another key on the same stripe mid-load.
            3 => {
                let four = self
                    .cache
                    .get()
                    .unwrap()
                    .get_with(4u64, self)
                    .map_err(|e| Arc::new(e) as LoadError)?;
                Ok(Some(*four + 30))
            }
            k => Ok(Some(k)),
        }
    }
}

#[test]
fn test_recursive_load_fails_fast() {
    let loader = Arc::new(RecursiveLoader::default());
    let cache: Cache<u64, u64> = CacheBuilder::new().with_concurrency_level(1).build();
    let _ = loader.cache.set(cache.clone());

    assert_eq!(*cache.get_with(1u64, &*loader).unwrap(), 99);
    assert!(loader.saw_recursion.load(Ordering::SeqCst));
}

#[test]
fn test_loader_may_load_other_keys() {
    let loader = Arc::new(RecursiveLoader::default());
    let cache: Cache<u64, u64> = CacheBuilder::new().with_concurrency_level(1).build();
    let _ = loader.cache.set(cache.clone());

    // Key 3 loads key 4 from inside its own load; both land in the cache.
    assert_eq!(*cache.get_with(3u64, &*loader).unwrap(), 34);
    assert_eq!(cache.get_if_present(&4).map(|v| *v), Some(4));
}

struct GateLoader {
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<u64>>,
}

impl Loader<u64, u64> for GateLoader {
    fn load(&self, _key: &u64) -> LoadResult<u64> {
        self.started.lock().unwrap().send(()).unwrap();
        let value = self.release.lock().unwrap().recv().unwrap();
        Ok(Some(value))
    }
}

#[test]
fn test_direct_write_wins_over_inflight_load() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let cache = CacheBuilder::new().build_with(GateLoader {
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });

    let loading = cache.clone();
    let caller = thread::spawn(move || *loading.get(1u64).unwrap());

    started_rx.recv().unwrap();
    // Clobber the in-flight load with a direct write.
    assert_eq!(cache.insert(1u64, 5u64), None);
    release_tx.send(7).unwrap();

    // The write won; the stale load result is dropped.
    assert_eq!(caller.join().unwrap(), 5);
    assert_eq!(cache.get_if_present(&1).map(|v| *v), Some(5));
}

#[test]
fn test_map_style_operations() {
    let cache: Cache<String, u64> = CacheBuilder::new().build();

    assert!(cache.is_empty());
    assert_eq!(cache.insert_if_absent("a".to_string(), 1u64), None);
    assert_eq!(cache.insert_if_absent("a".to_string(), 2u64).map(|v| *v), Some(1));
    assert_eq!(cache.get_if_present(&"a".to_string()).map(|v| *v), Some(1));
    assert!(!cache.is_empty());

    // Replace only acts on existing entries.
    assert_eq!(cache.replace("b".to_string(), 9u64), None);
    assert!(!cache.contains_key(&"b".to_string()));
    cache.insert("b".to_string(), 1u64);
    assert_eq!(cache.replace("b".to_string(), 2u64).map(|v| *v), Some(1));

    assert!(!cache.replace_if_equals("b".to_string(), &5, 7u64));
    assert!(cache.replace_if_equals("b".to_string(), &2, 7u64));
    assert_eq!(cache.get_if_present(&"b".to_string()).map(|v| *v), Some(7));

    assert!(!cache.remove_if_equals(&"b".to_string(), &9));
    assert!(cache.remove_if_equals(&"b".to_string(), &7));
    assert!(!cache.contains_key(&"b".to_string()));

    assert_eq!(cache.len(), 1);
    assert!(cache.contains_value(&1));
    assert!(!cache.contains_value(&7));
}

struct BatchLoader {
    batches: AtomicUsize,
}

impl Loader<u64, u64> for BatchLoader {
    fn load(&self, key: &u64) -> LoadResult<u64> {
        Ok(Some(key * 10))
    }

    fn load_all(&self, keys: &[Arc<u64>]) -> Option<Result<HashMap<u64, u64>, LoadError>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut loaded: HashMap<u64, u64> = keys.iter().map(|k| (**k, **k * 10)).collect();
        // An extra entry beyond what was requested.
        loaded.insert(100, 1000);
        Some(Ok(loaded))
    }
}

#[test]
fn test_get_all_uses_batch_loader() {
    let cache = CacheBuilder::new().build_with(BatchLoader {
        batches: AtomicUsize::new(0),
    });

    cache.insert(1u64, 10u64);
    let result = cache.get_all([1u64, 2, 3, 2]).unwrap();

    assert_eq!(result.len(), 3);
    assert_eq!(result.get(&Arc::new(1u64)).map(|v| **v), Some(10));
    assert_eq!(result.get(&Arc::new(2u64)).map(|v| **v), Some(20));
    assert_eq!(result.get(&Arc::new(3u64)).map(|v| **v), Some(30));

    // One batch for the two missing keys, and the extra entry was cached.
    assert_eq!(cache.loader().batches.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get_if_present(&2).map(|v| *v), Some(20));
    assert_eq!(cache.get_if_present(&100).map(|v| *v), Some(1000));
}

#[test]
fn test_get_all_falls_back_to_per_key_loads() {
    let loader = LoaderFn::new(|key: &u64| -> LoadResult<u64> { Ok(Some(key + 1)) });
    let cache = CacheBuilder::new().build_with(loader);

    let result = cache.get_all([1u64, 2]).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result.get(&Arc::new(2u64)).map(|v| **v), Some(3));
    assert_eq!(cache.get_if_present(&1).map(|v| *v), Some(2));
}

struct HoleyBatchLoader;

impl Loader<u64, u64> for HoleyBatchLoader {
    fn load(&self, key: &u64) -> LoadResult<u64> {
        Ok(Some(*key))
    }

    fn load_all(&self, keys: &[Arc<u64>]) -> Option<Result<HashMap<u64, u64>, LoadError>> {
        // Omits every odd key.
        Some(Ok(keys.iter().filter(|k| ***k % 2 == 0).map(|k| (**k, **k)).collect()))
    }
}

#[test]
fn test_get_all_missing_key_is_invalid_load() {
    let cache = CacheBuilder::new().build_with(HoleyBatchLoader);
    assert!(matches!(cache.get_all([2u64, 3]), Err(Error::InvalidLoad)));
}

#[test]
fn test_weigher_and_overweight_entry() {
    let (events, listener) = event_log::<u64, u64>();
    let cache = CacheBuilder::new()
        .with_concurrency_level(1)
        .with_max_weight(10)
        .build_with_weigher(|_key: &u64, value: &u64| *value as u32, listener);

    cache.insert(1u64, 4u64);
    cache.insert(2u64, 5u64);
    assert_eq!(cache.len(), 2);

    // Heavier than the whole cap: evicted on the spot.
    cache.insert(3u64, 20u64);
    assert_eq!(cache.get_if_present(&3), None);
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get_if_present(&1).map(|v| *v), Some(4));
    assert_eq!(cache.get_if_present(&2).map(|v| *v), Some(5));

    assert_eq!(*events.lock().unwrap(), vec![(Some(3), Some(20), RemovalCause::Size)]);
}

#[test]
fn test_invalidate_all_notifies_explicit() {
    let (events, listener) = event_log::<u64, u64>();
    let cache = CacheBuilder::new().build_with_listener(listener);

    for key in 0..3u64 {
        cache.insert(key, key);
    }
    cache.invalidate_all();

    assert_eq!(cache.len(), 0);
    assert!(cache.is_empty());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|(_, _, cause)| *cause == RemovalCause::Explicit));
    let mut keys: Vec<u64> = events.iter().map(|(k, _, _)| k.unwrap()).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![0, 1, 2]);
}

#[test]
fn test_concurrent_mixed_workload() {
    const THREADS: u64 = 8;
    const OPS: u64 = 10_000;
    const CAP: u64 = 128;

    let cache: Cache<u64, u64> = CacheBuilder::new()
        .with_concurrency_level(THREADS as usize)
        .with_max_weight(CAP)
        .build();

    let handles: Vec<_> = (0..THREADS)
        .map(|seed| {
            let cache = cache.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(seed);
                for _ in 0..OPS {
                    let key = rng.next_u64() % 256;
                    match cache.get_if_present(&key) {
                        // Values are never synthesized.
                        Some(value) => assert_eq!(*value, key * 3),
                        None => {
                            cache.insert(key, key * 3);
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    cache.clean_up();
    assert!(cache.len() as u64 <= CAP + THREADS);
    for (key, value) in cache.iter() {
        assert_eq!(*value, *key * 3);
    }
}

#[test]
fn test_get_all_present_skips_loader() {
    let loader = LoaderFn::new(|_key: &u64| -> LoadResult<u64> { panic!("must not load") });
    let cache = CacheBuilder::new().build_with(loader);

    cache.insert(1u64, 10u64);
    cache.insert(2u64, 20u64);

    let present = cache.get_all_present([1u64, 2, 3]);
    assert_eq!(present.len(), 2);
    assert_eq!(present.get(&Arc::new(1u64)).map(|v| **v), Some(10));
    assert!(!present.contains_key(&Arc::new(3u64)));
}
