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

//! Hash table holding the build side of a join.
//!
//! Build rows are concatenated into one batch. Their key columns are encoded
//! with Arrow's row format, and every distinct key gets a group in an
//! open-addressing table (linear probing, no tombstones since nothing is ever
//! removed). Rows sharing a key are chained in build order.

use std::mem::size_of;
use std::sync::Arc;

use ahash::RandomState;
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Int64Type, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField};
use datafusion::execution::memory_pool::{MemoryConsumer, MemoryPool, MemoryReservation};
use datafusion::physical_expr::PhysicalExpr;

use crate::errors::CometResult;

const EMPTY_SLOT: u32 = 0;
const END_OF_CHAIN: u32 = u32::MAX;
const MIN_SLOTS: usize = 16;

/// Fixed seeds keep the hash of a key identical across tables.
fn table_random_state() -> RandomState {
    RandomState::with_seeds(
        0x2f6a1c9e5b3d7a41,
        0x7d4e8b2a9c1f3e65,
        0x1b9d3f7a5c2e8d47,
        0x5e7c1a3b9d2f4a86,
    )
}

/// Observed range of an integral key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBounds {
    pub min: i64,
    pub max: i64,
}

impl KeyBounds {
    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyGroup {
    hash: u64,
    /// First build row with this key; also the row whose encoded key is
    /// compared against on lookup.
    head: u32,
    tail: u32,
}

/// Multi-map from a build key tuple to the build rows carrying it.
#[derive(Debug)]
pub struct HashEntryStore {
    batch: RecordBatch,
    converter: RowConverter,
    keys: Rows,
    random_state: RandomState,
    /// Group index + 1 per slot, `EMPTY_SLOT` when free. Length is a power of two.
    slots: Vec<u32>,
    groups: Vec<KeyGroup>,
    next_row: Vec<u32>,
    indexed_rows: usize,
    key_bounds: Vec<Option<KeyBounds>>,
    reservation: Option<MemoryReservation>,
}

impl HashEntryStore {
    /// Builds the table over `batch`, indexing every row whose keys are all
    /// non-null.
    pub fn try_new(batch: RecordBatch, key_exprs: &[Arc<dyn PhysicalExpr>]) -> CometResult<Self> {
        let num_rows = batch.num_rows();
        let key_columns = key_exprs
            .iter()
            .map(|expr| expr.evaluate(&batch).and_then(|cv| cv.into_array(num_rows)))
            .collect::<Result<Vec<_>, _>>()?;
        let converter = RowConverter::new(
            key_columns
                .iter()
                .map(|column| SortField::new(column.data_type().clone()))
                .collect(),
        )?;
        let keys = converter.convert_columns(&key_columns)?;
        let mut bounds = BoundsAccumulator::try_new(&key_columns)?;

        let capacity = (num_rows.max(1) * 2).next_power_of_two().max(MIN_SLOTS);
        let mut store = Self {
            batch,
            converter,
            keys,
            random_state: table_random_state(),
            slots: vec![EMPTY_SLOT; capacity],
            groups: Vec::with_capacity(num_rows),
            next_row: vec![END_OF_CHAIN; num_rows],
            indexed_rows: 0,
            key_bounds: vec![],
            reservation: None,
        };
        for row in 0..num_rows {
            if key_columns.iter().any(|column| column.is_null(row)) {
                // null keys never match, the row only matters to outer sweeps
                continue;
            }
            store.insert(row as u32);
            bounds.update(row);
        }
        store.key_bounds = bounds.finish();
        Ok(store)
    }

    /// Adds build row `row` under its encoded key.
    pub(crate) fn insert(&mut self, row: u32) {
        let hash = self.random_state.hash_one(self.keys.row(row as usize).as_ref());
        match self.find_group(hash, self.keys.row(row as usize).as_ref()) {
            Ok(group) => {
                let tail = self.groups[group].tail;
                self.next_row[tail as usize] = row;
                self.groups[group].tail = row;
            }
            Err(slot) => {
                self.groups.push(KeyGroup {
                    hash,
                    head: row,
                    tail: row,
                });
                self.slots[slot] = self.groups.len() as u32;
                if self.groups.len() * 2 > self.slots.len() {
                    self.grow();
                }
            }
        }
        self.indexed_rows += 1;
    }

    /// Probes for `key`. Returns the group index when found, otherwise the
    /// free slot where the key belongs.
    fn find_group(&self, hash: u64, key: &[u8]) -> Result<usize, usize> {
        let mask = self.slots.len() - 1;
        let mut slot = hash as usize & mask;
        loop {
            match self.slots[slot] {
                EMPTY_SLOT => return Err(slot),
                entry => {
                    let group = (entry - 1) as usize;
                    let candidate = &self.groups[group];
                    if candidate.hash == hash
                        && self.keys.row(candidate.head as usize).as_ref() == key
                    {
                        return Ok(group);
                    }
                }
            }
            slot = (slot + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = self.slots.len() * 2;
        let mask = capacity - 1;
        let mut slots = vec![EMPTY_SLOT; capacity];
        for (index, group) in self.groups.iter().enumerate() {
            let mut slot = group.hash as usize & mask;
            while slots[slot] != EMPTY_SLOT {
                slot = (slot + 1) & mask;
            }
            slots[slot] = index as u32 + 1;
        }
        self.slots = slots;
    }

    /// Returns the build rows whose key equals `key`, in build order.
    pub fn lookup(&self, key: &[u8]) -> Matches<'_> {
        let hash = self.random_state.hash_one(key);
        let next = match self.find_group(hash, key) {
            Ok(group) => self.groups[group].head,
            Err(_) => END_OF_CHAIN,
        };
        Matches { store: self, next }
    }

    /// Single-match lookup, valid when [`Self::has_unique_keys`] holds.
    pub fn lookup_unique(&self, key: &[u8]) -> Option<u32> {
        let hash = self.random_state.hash_one(key);
        self.find_group(hash, key)
            .ok()
            .map(|group| self.groups[group].head)
    }

    /// Whether every indexed key occurs on exactly one build row.
    pub fn has_unique_keys(&self) -> bool {
        self.groups.len() == self.indexed_rows
    }

    /// Range of key column `index` when it is integral and non-empty.
    pub fn key_bounds(&self) -> &[Option<KeyBounds>] {
        &self.key_bounds
    }

    /// Encoder for probe keys; they must be converted with the same
    /// converter as the build keys to compare equal.
    pub fn converter(&self) -> &RowConverter {
        &self.converter
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_keys(&self) -> usize {
        self.groups.len()
    }

    pub fn mem_size(&self) -> usize {
        self.batch.get_array_memory_size()
            + self.keys.size()
            + self.slots.capacity() * size_of::<u32>()
            + self.groups.capacity() * size_of::<KeyGroup>()
            + self.next_row.capacity() * size_of::<u32>()
    }

    /// Memory accounted to the pool on behalf of this table. Returned to the
    /// pool when the table is dropped.
    pub fn reserved(&self) -> usize {
        self.reservation.as_ref().map_or(0, |r| r.size())
    }
}

/// Iterator over the build rows matching a key.
pub struct Matches<'a> {
    store: &'a HashEntryStore,
    next: u32,
}

impl Iterator for Matches<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == END_OF_CHAIN {
            return None;
        }
        let row = self.next;
        self.next = self.store.next_row[row as usize];
        Some(row)
    }
}

struct BoundsAccumulator {
    columns: Vec<Option<ArrayRef>>,
    bounds: Vec<Option<KeyBounds>>,
}

impl BoundsAccumulator {
    fn try_new(key_columns: &[ArrayRef]) -> CometResult<Self> {
        let columns = key_columns
            .iter()
            .map(|column| {
                if is_integral(column.data_type()) {
                    Ok(Some(cast(column, &DataType::Int64)?))
                } else {
                    Ok(None)
                }
            })
            .collect::<CometResult<Vec<_>>>()?;
        let bounds = vec![None; columns.len()];
        Ok(Self { columns, bounds })
    }

    fn update(&mut self, row: usize) {
        for (column, bounds) in self.columns.iter().zip(self.bounds.iter_mut()) {
            if let Some(column) = column {
                let value = column.as_primitive::<Int64Type>().value(row);
                *bounds = Some(match bounds {
                    Some(b) => KeyBounds {
                        min: b.min.min(value),
                        max: b.max.max(value),
                    },
                    None => KeyBounds {
                        min: value,
                        max: value,
                    },
                });
            }
        }
    }

    fn finish(self) -> Vec<Option<KeyBounds>> {
        self.bounds
    }
}

/// Integral types whose values fit an `i64`.
pub(crate) fn is_integral(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
    )
}

/// Collects the build input, reserving memory for it from `pool`, and builds
/// the hash table. A refused reservation surfaces as
/// [`crate::errors::CometError::ResourcesExhausted`].
pub fn build_hash_table<I>(
    input: I,
    schema: &SchemaRef,
    key_exprs: &[Arc<dyn PhysicalExpr>],
    pool: &Arc<dyn MemoryPool>,
) -> CometResult<HashEntryStore>
where
    I: Iterator<Item = CometResult<RecordBatch>>,
{
    let mut reservation = MemoryConsumer::new("HashJoinBuild").register(pool);
    let mut batches = Vec::new();
    for batch in input {
        let batch = batch?;
        reservation.try_grow(batch.get_array_memory_size())?;
        batches.push(batch);
    }
    let batch = concat_batches(schema, &batches)?;
    drop(batches);

    let mut store = HashEntryStore::try_new(batch, key_exprs)?;
    let mem_size = store.mem_size();
    if mem_size > reservation.size() {
        reservation.try_grow(mem_size - reservation.size())?;
    } else {
        reservation.shrink(reservation.size() - mem_size);
    }
    store.reservation = Some(reservation);
    Ok(store)
}
