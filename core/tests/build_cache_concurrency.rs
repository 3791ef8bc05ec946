// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use arrow::array::Int32Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use comet_hash_join::errors::{CometError, CometResult};
use comet_hash_join::execution::joins::{BuildCache, CacheKey, HashEntryStore};
use comet_hash_join::execution::TaskAttempt;
use datafusion::physical_expr::expressions::Column;
use datafusion::physical_expr::PhysicalExpr;

const NUM_TASKS: usize = 8;

fn build_store(ids: Vec<i32>) -> CometResult<HashEntryStore> {
    let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(ids))])?;
    let keys: Vec<Arc<dyn PhysicalExpr>> = vec![Arc::new(Column::new("id", 0))];
    HashEntryStore::try_new(batch, &keys)
}

#[test]
fn concurrent_requests_build_once() {
    let cache = BuildCache::new(50).unwrap();
    let key = CacheKey::new(vec![0, 1], 7);
    let builds = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(NUM_TASKS));
    let tasks: Vec<_> = (0..NUM_TASKS)
        .map(|i| Arc::new(TaskAttempt::new(i as i64, i)))
        .collect();

    let stores: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = tasks
            .iter()
            .map(|task| {
                let cache = cache.clone();
                let key = key.clone();
                let builds = Arc::clone(&builds);
                let barrier = Arc::clone(&barrier);
                s.spawn(move || {
                    barrier.wait();
                    cache
                        .get(&key, task, 10, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            build_store(vec![1, 2, 3])
                        })
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(stores.iter().all(|store| Arc::ptr_eq(store, &stores[0])));
    assert_eq!(cache.stats().builds, 1);
    assert_eq!(cache.stats().hits, NUM_TASKS as u64 - 1);

    // tasks may complete in any order
    for task in tasks.iter().rev() {
        assert!(cache.contains(&key));
        task.mark_completed();
    }
    assert!(cache.is_empty());
}

#[test]
fn unrelated_keys_build_concurrently() {
    let cache = BuildCache::new(50).unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(NUM_TASKS));

    thread::scope(|s| {
        for i in 0..NUM_TASKS {
            let cache = cache.clone();
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let barrier = Arc::clone(&barrier);
            s.spawn(move || {
                let task = TaskAttempt::new(i as i64, i);
                barrier.wait();
                cache
                    .get(&CacheKey::new(vec![0], i as i64), &task, 10, || {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        build_store(vec![i as i32])
                    })
                    .unwrap();
            });
        }
    });

    assert!(max_in_flight.load(Ordering::SeqCst) > 1);
    assert_eq!(cache.stats().builds, NUM_TASKS as u64);
    // every task was dropped at the end of its thread
    assert!(cache.is_empty());
}

#[test]
fn out_of_memory_build_is_retried_while_others_hold_entries() {
    let cache = BuildCache::new(50).unwrap();
    let holder = TaskAttempt::new(0, 0);
    let held = cache
        .get(&CacheKey::new(vec![0], 1), &holder, 10, || build_store(vec![1]))
        .unwrap();

    let task = TaskAttempt::new(1, 1);
    let mut failures = 2;
    let store = cache
        .get(&CacheKey::new(vec![0], 2), &task, 10, || {
            if failures > 0 {
                failures -= 1;
                Err(CometError::ResourcesExhausted(
                    "Failed to allocate additional 1048576 bytes".to_string(),
                ))
            } else {
                build_store(vec![4, 5, 6])
            }
        })
        .unwrap();

    assert_eq!(store.num_rows(), 3);
    assert!(cache.stats().invalidations >= 1);
    // the invalidated entry is gone from the index but still usable by its holder
    assert!(!cache.contains(&CacheKey::new(vec![0], 1)));
    assert_eq!(held.num_rows(), 1);

    holder.mark_completed();
    task.mark_completed();
    assert!(cache.is_empty());
}

/// Counts how many builders of one key run at the same time.
#[derive(Default)]
struct BuildTracker {
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl BuildTracker {
    fn build(&self, pause: Duration, ids: Vec<i32>) -> CometResult<HashEntryStore> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        thread::sleep(pause);
        self.running.fetch_sub(1, Ordering::SeqCst);
        build_store(ids)
    }
}

/// Starts a slow build of `key` on its own thread and returns once the builder
/// is running. Then runs `interfere` and requests `key` again from a second
/// task while the first build is still in flight.
fn second_request_during_build(
    cache: &BuildCache,
    key: &CacheKey,
    interfere: impl FnOnce(),
) -> Arc<BuildTracker> {
    let tracker = Arc::new(BuildTracker::default());
    let started = Barrier::new(2);
    thread::scope(|s| {
        let first = s.spawn(|| {
            let task = TaskAttempt::new(1, 0);
            let mut signalled = false;
            cache
                .get(key, &task, 10, || {
                    if !signalled {
                        signalled = true;
                        started.wait();
                    }
                    tracker.build(Duration::from_millis(300), vec![1, 2])
                })
                .unwrap()
        });
        started.wait();
        interfere();
        let second = s.spawn(|| {
            let task = TaskAttempt::new(2, 1);
            cache
                .get(key, &task, 10, || {
                    tracker.build(Duration::from_millis(10), vec![1, 2])
                })
                .unwrap()
        });
        let a = first.join().unwrap();
        let b = second.join().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    });
    tracker
}

#[test]
fn build_in_flight_survives_out_of_memory_invalidation() {
    let cache = BuildCache::new(50).unwrap();
    let key = CacheKey::new(vec![0, 1], 10);
    let tracker = second_request_during_build(&cache, &key, || {
        let task = TaskAttempt::new(3, 2);
        let mut failed = false;
        cache
            .get(&CacheKey::new(vec![0, 1], 11), &task, 10, || {
                if failed {
                    build_store(vec![7])
                } else {
                    failed = true;
                    Err(CometError::ResourcesExhausted("pool is full".to_string()))
                }
            })
            .unwrap();
        assert!(cache.contains(&key));
    });

    assert_eq!(tracker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().invalidations, 1);
    assert!(cache.is_empty());
}

#[test]
fn build_in_flight_survives_capacity_eviction() {
    let cache = BuildCache::new(1).unwrap();
    let key = CacheKey::new(vec![0, 1], 20);
    let other = TaskAttempt::new(3, 2);
    let tracker = second_request_during_build(&cache, &key, || {
        cache
            .get(&CacheKey::new(vec![0, 1], 21), &other, 10, || {
                build_store(vec![7])
            })
            .unwrap();
        assert!(cache.contains(&key));
    });

    assert_eq!(tracker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().evictions, 0);
    other.mark_completed();
    assert!(cache.is_empty());
}

#[test]
fn waiters_share_a_failed_build() {
    let cache = BuildCache::new(50).unwrap();
    let key = CacheKey::new(vec![0], 30);
    let calls = AtomicUsize::new(0);
    let barrier = Barrier::new(NUM_TASKS);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..NUM_TASKS)
            .map(|i| {
                let (cache, key, calls, barrier) = (&cache, &key, &calls, &barrier);
                s.spawn(move || {
                    let task = TaskAttempt::new(i as i64, i);
                    barrier.wait();
                    cache.get(key, &task, 10, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Err(CometError::Internal("corrupt broadcast".to_string()))
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(CometError::DataAccess { .. }))));
    assert!(results
        .iter()
        .all(|r| r.as_ref().is_err_and(|e| e.to_string().contains("corrupt broadcast"))));
    assert_eq!(cache.stats().invalidations, 0);
    assert!(cache.is_empty());

    // the failure is not remembered past the build that hit it
    let task = TaskAttempt::new(100, 0);
    let store = cache.get(&key, &task, 10, || build_store(vec![1])).unwrap();
    assert_eq!(store.num_rows(), 1);
}
