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

//! Worker-wide cache of hash tables built over replicated relations.
//!
//! Tasks of one worker that join against the same replicated relation share a
//! single [`HashEntryStore`]. Every task holding an entry keeps it alive
//! through a completion listener; the entry leaves the cache when the last of
//! those tasks ends.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use lru::LruCache;
use parking_lot::Mutex;

use crate::errors::{CometError, CometResult};
use crate::execution::joins::hash_table::HashEntryStore;
use crate::execution::task::TaskAttempt;

const C1: u64 = 0x87c37b91114253d5;
const C2: u64 = 0x4cf5ad432745937f;
const SEED: u64 = 42;

#[inline]
fn mix_k1(k1: u64) -> u64 {
    k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2)
}

#[inline]
fn mix_h1(h1: u64, k1: u64) -> u64 {
    (h1 ^ mix_k1(k1))
        .rotate_left(27)
        .wrapping_mul(5)
        .wrapping_add(0x52dce729)
}

#[inline]
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^ (h >> 33)
}

/// Identity of one physical build-side relation: the ids of its output
/// columns, in order, and the id of the data source producing it.
///
/// The hash is computed once and travels with the key through
/// [`CacheKey::encode`] and [`CacheKey::decode`].
#[derive(Clone, Debug)]
pub struct CacheKey {
    columns: Vec<i64>,
    source_id: i64,
    hash: u64,
}

impl CacheKey {
    pub fn new(columns: Vec<i64>, source_id: i64) -> Self {
        let mut h = SEED;
        for column in &columns {
            h = mix_h1(h, *column as u64);
        }
        h = mix_h1(h, source_id as u64);
        h ^= (columns.len() as u64 + 1) * 8;
        let hash = fmix64(h);
        Self {
            columns,
            source_id,
            hash,
        }
    }

    pub fn columns(&self) -> &[i64] {
        &self.columns
    }

    pub fn source_id(&self) -> i64 {
        self.source_id
    }

    pub fn hash_code(&self) -> u64 {
        self.hash
    }

    /// Layout: column count (u32), columns (i64 each), source id (i64),
    /// hash (u64), all little endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 8 * (self.columns.len() + 2));
        buf.extend_from_slice(&(self.columns.len() as u32).to_le_bytes());
        for column in &self.columns {
            buf.extend_from_slice(&column.to_le_bytes());
        }
        buf.extend_from_slice(&self.source_id.to_le_bytes());
        buf.extend_from_slice(&self.hash.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> CometResult<Self> {
        let mut reader = ByteReader { bytes, pos: 0 };
        let num_columns = reader.read_u32()? as usize;
        if bytes.len() != 4 + 8 * (num_columns + 2) {
            return Err(CometError::Internal(format!(
                "Invalid cache key: {} bytes for {num_columns} columns",
                bytes.len()
            )));
        }
        let columns = (0..num_columns)
            .map(|_| reader.read_u64().map(|v| v as i64))
            .collect::<CometResult<Vec<_>>>()?;
        let source_id = reader.read_u64()? as i64;
        let hash = reader.read_u64()?;
        Ok(Self {
            columns,
            source_id,
            hash,
        })
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl ByteReader<'_> {
    fn take<const N: usize>(&mut self) -> CometResult<[u8; N]> {
        let end = self.pos + N;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .ok_or_else(|| CometError::Internal("Invalid cache key: truncated".to_string()))?;
        self.pos = end;
        Ok(chunk)
    }

    fn read_u32(&mut self) -> CometResult<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn read_u64(&mut self) -> CometResult<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }
}

/// Keys are equal when their columns and source match. The carried hash only
/// picks the bucket.
impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.source_id == other.source_id && self.columns == other.columns
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheKey(source={}, columns={:?})",
            self.source_id, self.columns
        )
    }
}

struct SlotState {
    store: Option<Arc<HashEntryStore>>,
    ref_count: i64,
    /// Set once the slot has left the cache for good. Waiters that find a
    /// retired slot look the key up again.
    retired: bool,
    /// Outcome of a build that gave up. Waiters queued behind that build
    /// share it instead of building again.
    failure: Option<BuildFailure>,
}

/// What waiters of a failed build are told.
struct BuildFailure {
    message: String,
    resources_exhausted: bool,
}

impl BuildFailure {
    fn new(err: &CometError) -> Self {
        Self {
            message: err.to_string(),
            resources_exhausted: err.is_resources_exhausted(),
        }
    }

    fn to_error(&self, key: &CacheKey) -> CometError {
        let cause = if self.resources_exhausted {
            CometError::ResourcesExhausted(self.message.clone())
        } else {
            CometError::Internal(self.message.clone())
        };
        CometError::data_access(
            format!("Concurrent build of hash table for {key} failed"),
            cause,
        )
    }
}

/// One cache entry. Its lock serializes the build for its key.
struct CacheSlot {
    key: CacheKey,
    state: Mutex<SlotState>,
}

impl CacheSlot {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            state: Mutex::new(SlotState {
                store: None,
                ref_count: 0,
                retired: false,
                failure: None,
            }),
        }
    }

    /// Retires the slot if nothing is building it or using its lock right now.
    /// A slot that is locked, or indexed but not built yet, must stay visible
    /// so that later requesters of its key wait on it.
    fn try_retire(&self) -> bool {
        match self.state.try_lock() {
            Some(mut state) if state.store.is_some() || state.retired => {
                state.store = None;
                state.retired = true;
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    builds: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time counters of a [`BuildCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildCacheStats {
    pub hits: u64,
    pub builds: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

struct Inner {
    /// Capacity is enforced by [`Inner::evict_over_capacity`], which skips
    /// slots with a build in flight.
    index: Mutex<LruCache<CacheKey, Arc<CacheSlot>>>,
    capacity: usize,
    stats: CacheStats,
}

impl Inner {
    /// Removes `slot` from the index unless the key already maps to a newer slot.
    fn unlink(&self, slot: &Arc<CacheSlot>) {
        let mut index = self.index.lock();
        if index
            .peek(&slot.key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            index.pop(&slot.key);
        }
    }

    /// Drops every built table from the index along with the cache's own
    /// reference to it. Slots with a build in flight, including the caller's
    /// own when it holds that slot's lock, stay indexed.
    fn invalidate_all(&self) {
        let mut index = self.index.lock();
        let retired: Vec<CacheKey> = index
            .iter()
            .filter(|(_, slot)| slot.try_retire())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &retired {
            index.pop(key);
        }
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        info!(
            "Invalidated {} build cache entries, {} in flight kept",
            retired.len(),
            index.len()
        );
    }

    /// Evicts least recently used built tables until the index fits its
    /// capacity. Runs with the index lock held.
    fn evict_over_capacity(&self, index: &mut LruCache<CacheKey, Arc<CacheSlot>>) {
        while index.len() > self.capacity {
            let victim = index
                .iter()
                .rev()
                .find(|(_, slot)| slot.try_retire())
                .map(|(key, _)| key.clone());
            match victim {
                Some(key) => {
                    index.pop(&key);
                    debug!("Evicted {key} from build cache");
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    debug!(
                        "Build cache holds {} entries over capacity {}, all in flight",
                        index.len(),
                        self.capacity
                    );
                    break;
                }
            }
        }
    }
}

/// Reference-counted cache of hash tables over replicated build relations.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct BuildCache {
    inner: Arc<Inner>,
}

impl BuildCache {
    pub fn new(capacity: usize) -> CometResult<Self> {
        if capacity == 0 {
            return Err(CometError::Config(
                "Build cache capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                index: Mutex::new(LruCache::unbounded()),
                capacity,
                stats: CacheStats::default(),
            }),
        })
    }

    /// Returns the hash table for `key`, building it with `builder` when no
    /// other task has. At most one build runs per key at a time; concurrent
    /// callers wait for it and share its result.
    ///
    /// The caller's reference is released when `task` completes. A build
    /// refused for lack of memory invalidates the whole cache and is retried,
    /// for at most `max_retries` attempts in total. When a build gives up,
    /// callers that were waiting on it get its failure rather than building
    /// again themselves.
    pub fn get<F>(
        &self,
        key: &CacheKey,
        task: &TaskAttempt,
        max_retries: usize,
        mut builder: F,
    ) -> CometResult<Arc<HashEntryStore>>
    where
        F: FnMut() -> CometResult<HashEntryStore>,
    {
        let (slot, store) = loop {
            let slot = self.find_or_create_slot(key);
            let mut state = slot.state.lock();
            if let Some(failure) = &state.failure {
                return Err(failure.to_error(key));
            }
            if state.retired {
                continue;
            }
            let store = match state.store.clone() {
                Some(store) => {
                    self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                    store
                }
                None => match self.build(&slot, max_retries, &mut builder) {
                    Ok(store) => {
                        state.store = Some(Arc::clone(&store));
                        store
                    }
                    Err(e) => {
                        state.failure = Some(BuildFailure::new(&e));
                        state.retired = true;
                        drop(state);
                        self.inner.unlink(&slot);
                        return Err(e);
                    }
                },
            };
            state.ref_count += 1;
            drop(state);
            break (slot, store);
        };

        let inner = Arc::downgrade(&self.inner);
        task.add_completion_listener(move || release(&inner, &slot));
        Ok(store)
    }

    fn find_or_create_slot(&self, key: &CacheKey) -> Arc<CacheSlot> {
        let existing = self.inner.index.lock().get(key).map(Arc::clone);
        match existing {
            Some(slot) => slot,
            None => {
                let mut index = self.inner.index.lock();
                // raced with another creator between the two locks
                if let Some(slot) = index.get(key) {
                    return Arc::clone(slot);
                }
                let slot = Arc::new(CacheSlot::new(key.clone()));
                index.push(key.clone(), Arc::clone(&slot));
                self.inner.evict_over_capacity(&mut index);
                slot
            }
        }
    }

    /// Runs `builder` with the lock of `slot` held by the caller.
    fn build<F>(
        &self,
        slot: &Arc<CacheSlot>,
        max_retries: usize,
        builder: &mut F,
    ) -> CometResult<Arc<HashEntryStore>>
    where
        F: FnMut() -> CometResult<HashEntryStore>,
    {
        let max_attempts = max_retries.max(1);
        let mut attempt = 1;
        loop {
            match builder() {
                Ok(store) => {
                    self.inner.stats.builds.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Built hash table for {} with {} rows ({} bytes)",
                        slot.key,
                        store.num_rows(),
                        store.mem_size()
                    );
                    return Ok(Arc::new(store));
                }
                Err(e) if e.is_resources_exhausted() => {
                    warn!(
                        "Out of memory building hash table for {} (attempt {attempt} of {max_attempts}): {e}",
                        slot.key
                    );
                    self.inner.invalidate_all();
                    if attempt >= max_attempts {
                        return Err(CometError::data_access(
                            format!(
                                "Failed to build hash table for {} after {attempt} attempts",
                                slot.key
                            ),
                            e,
                        ));
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(CometError::data_access(
                        format!("Failed to build hash table for {}", slot.key),
                        e,
                    ))
                }
            }
        }
    }

    /// Drops every entry from the cache. Tables already handed out stay valid
    /// for their holders.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    pub fn close(&self) {
        info!("Closing build cache");
        self.invalidate_all();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.index.lock().contains(key)
    }

    /// Number of keys currently visible to lookups.
    pub fn len(&self) -> usize {
        self.inner.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BuildCacheStats {
        let stats = &self.inner.stats;
        BuildCacheStats {
            hits: stats.hits.load(Ordering::Relaxed),
            builds: stats.builds.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            invalidations: stats.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildCache")
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Completion listener of a task holding `slot`.
fn release(inner: &Weak<Inner>, slot: &Arc<CacheSlot>) {
    let mut state = slot.state.lock();
    state.ref_count -= 1;
    if state.ref_count > 0 || state.retired {
        return;
    }
    state.retired = true;
    state.store = None;
    drop(state);
    debug!("Released last reference to {}", slot.key);
    if let Some(inner) = inner.upgrade() {
        inner.unlink(slot);
    }
}
