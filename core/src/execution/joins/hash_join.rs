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

//! Hash join operator.
//!
//! Each partition materializes its build side into a [`HashEntryStore`],
//! either privately or through the worker's [`BuildCache`] when the build
//! relation is replicated, and then streams its stream-side batches through
//! the table.

use std::fmt;
use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, AsArray, BooleanArray, BooleanBufferBuilder, UInt32Array,
};
use arrow::compute::{cast, take};
use arrow::datatypes::{DataType, Int64Type};
use arrow::record_batch::RecordBatch;
use arrow::row::Rows;
use datafusion::physical_expr::PhysicalExpr;
use datafusion::physical_plan::metrics::{ExecutionPlanMetricsSet, MetricsSet};
use itertools::Itertools;
use log::{debug, info};

use crate::errors::{CometError, CometResult};
use crate::execution::joins::build_cache::{BuildCache, CacheKey};
use crate::execution::joins::hash_table::{build_hash_table, is_integral, HashEntryStore};
use crate::execution::joins::join_spec::{BuildSide, JoinSpec, JoinType};
use crate::execution::joins::metrics::HashJoinMetrics;
use crate::execution::runtime::JoinRuntime;
use crate::execution::task::TaskAttempt;

/// Hash join of a stream relation against a build relation.
///
/// With `replicated_build` set, the build relation is present in full on
/// every worker and its hash table is shared through the [`BuildCache`]
/// under that key.
pub struct HashJoinExec {
    spec: Arc<JoinSpec>,
    replicated_build: Option<CacheKey>,
    runtime: Arc<JoinRuntime>,
    metrics: ExecutionPlanMetricsSet,
}

impl HashJoinExec {
    pub fn try_new(
        spec: JoinSpec,
        replicated_build: Option<CacheKey>,
        runtime: Arc<JoinRuntime>,
    ) -> CometResult<Self> {
        // Every task sharing the table would sweep the same unmatched rows.
        if replicated_build.is_some() && spec.preserves_build() {
            return Err(CometError::Planning(format!(
                "{} join with build side {:?} cannot use a replicated build relation",
                spec.join_type(),
                spec.build_side()
            )));
        }
        Ok(Self {
            spec: Arc::new(spec),
            replicated_build,
            runtime,
            metrics: ExecutionPlanMetricsSet::new(),
        })
    }

    pub fn spec(&self) -> &JoinSpec {
        &self.spec
    }

    pub fn replicated_build(&self) -> Option<&CacheKey> {
        self.replicated_build.as_ref()
    }

    pub fn metrics(&self) -> MetricsSet {
        self.metrics.clone_inner()
    }

    /// Joins one partition.
    ///
    /// `build_input` opens the build side of the partition. It is called
    /// lazily, on the first poll of the returned stream, and again if the
    /// build has to be retried.
    pub fn execute<B, I, S>(
        &self,
        partition: usize,
        task: Arc<TaskAttempt>,
        build_input: B,
        stream_input: S,
    ) -> HashJoinStream<B, S>
    where
        B: FnMut() -> CometResult<I>,
        I: Iterator<Item = CometResult<RecordBatch>>,
        S: Iterator<Item = CometResult<RecordBatch>>,
    {
        debug!(
            "Executing hash join partition {partition} for task {}",
            task.task_attempt_id()
        );
        HashJoinStream {
            spec: Arc::clone(&self.spec),
            replicated_build: self.replicated_build.clone(),
            runtime: Arc::clone(&self.runtime),
            task,
            partition,
            build_input,
            stream_input,
            state: HashJoinStreamState::Uninitialized,
            table: None,
            visited: None,
            metrics: HashJoinMetrics::new(&self.metrics, partition),
        }
    }
}

impl fmt::Display for HashJoinExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on = self
            .spec
            .left_keys()
            .iter()
            .zip(self.spec.right_keys())
            .map(|(l, r)| format!("({l}, {r})"))
            .join(", ");
        write!(
            f,
            "HashJoinExec: join_type={:?}, build_side={:?}, on=[{on}]",
            self.spec.join_type(),
            self.spec.build_side(),
        )?;
        if let Some(filter) = self.spec.filter() {
            write!(f, ", filter={filter}")?;
        }
        if let Some(key) = &self.replicated_build {
            write!(f, ", replicated={key}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashJoinStreamState {
    /// The hash table has not been built yet
    Uninitialized,
    /// Probing stream-side batches
    Ready,
    /// Stream side exhausted, emitting build rows nothing matched
    SweepUnmatched,
    Done,
}

/// Joined output of one partition.
pub struct HashJoinStream<B, S> {
    spec: Arc<JoinSpec>,
    replicated_build: Option<CacheKey>,
    runtime: Arc<JoinRuntime>,
    task: Arc<TaskAttempt>,
    partition: usize,
    build_input: B,
    stream_input: S,
    state: HashJoinStreamState,
    table: Option<Arc<HashEntryStore>>,
    /// Build rows matched so far, only tracked when unmatched build rows are
    /// part of the output
    visited: Option<BooleanBufferBuilder>,
    metrics: HashJoinMetrics,
}

impl<B, I, S> HashJoinStream<B, S>
where
    B: FnMut() -> CometResult<I>,
    I: Iterator<Item = CometResult<RecordBatch>>,
{
    fn load_table(&mut self) -> CometResult<Arc<HashEntryStore>> {
        let build_time = self.metrics.build_time.clone();
        let timer = build_time.timer();

        let build_schema = Arc::clone(self.spec.build_schema());
        let build_keys = self.spec.build_keys().to_vec();
        let pool = Arc::clone(self.runtime.memory_pool());
        let build_input = &mut self.build_input;
        let mut builder = || build_hash_table(build_input()?, &build_schema, &build_keys, &pool);

        let table = match &self.replicated_build {
            Some(key) => {
                let cache: &BuildCache = self.runtime.build_cache();
                let max_retries = self.runtime.config().build_cache_max_retries;
                cache.get(key, &self.task, max_retries, builder)?
            }
            None => Arc::new(builder().map_err(|e| {
                CometError::data_access(
                    format!("Failed to build hash table for partition {}", self.partition),
                    e,
                )
            })?),
        };
        timer.done();

        self.metrics.build_data_size.add(table.mem_size());
        info!(
            "Hash join partition {} using hash table with {} rows, {} keys, {} bytes",
            self.partition,
            table.num_rows(),
            table.num_keys(),
            table.mem_size()
        );
        Ok(table)
    }
}

impl<B, S> HashJoinStream<B, S> {
    fn process_batch(
        &mut self,
        batch: &RecordBatch,
        table: &HashEntryStore,
    ) -> CometResult<RecordBatch> {
        let num_rows = batch.num_rows();
        self.metrics.input_batches.add(1);
        self.metrics.input_rows.add(num_rows);

        let key_columns = self
            .spec
            .stream_keys()
            .iter()
            .map(|expr| {
                expr.evaluate(batch)
                    .and_then(|v| v.into_array(num_rows))
                    .map_err(|source| CometError::Evaluation {
                        msg: format!("{expr}"),
                        source,
                    })
            })
            .collect::<CometResult<Vec<_>>>()?;
        let keys = table.converter().convert_columns(&key_columns)?;
        let probe_mask = self.probe_mask(&key_columns, table, num_rows)?;
        let (stream_indices, build_indices) = self.candidates(&keys, &probe_mask, table);
        let (stream_indices, build_indices) = match self.spec.filter() {
            Some(filter) => self.apply_filter(
                filter,
                batch,
                table.batch(),
                stream_indices,
                build_indices,
            )?,
            None => (stream_indices, build_indices),
        };

        if let Some(visited) = self.visited.as_mut() {
            for row in &build_indices {
                visited.set_bit(*row as usize, true);
            }
        }
        self.emit(batch, table.batch(), &stream_indices, &build_indices)
    }

    /// Rows worth looking up: no NULL key, and every integral key within
    /// the range seen on the build side.
    fn probe_mask(
        &self,
        key_columns: &[ArrayRef],
        table: &HashEntryStore,
        num_rows: usize,
    ) -> CometResult<Vec<bool>> {
        let mut mask: Vec<bool> = (0..num_rows)
            .map(|row| key_columns.iter().all(|column| column.is_valid(row)))
            .collect();
        if !self.runtime.config().range_pruning {
            return Ok(mask);
        }

        let mut pruned = 0;
        for (column, bounds) in key_columns.iter().zip(table.key_bounds()) {
            let Some(bounds) = bounds else {
                continue;
            };
            if !is_integral(column.data_type()) {
                continue;
            }
            let values = cast(column, &DataType::Int64)?;
            let values = values.as_primitive::<Int64Type>();
            for (row, probe) in mask.iter_mut().enumerate() {
                if *probe && !bounds.contains(values.value(row)) {
                    *probe = false;
                    pruned += 1;
                }
            }
        }
        self.metrics.range_pruned_rows.add(pruned);
        Ok(mask)
    }

    /// Key-equal (stream row, build row) pairs in stream order.
    fn candidates(
        &self,
        keys: &Rows,
        probe_mask: &[bool],
        table: &HashEntryStore,
    ) -> (Vec<u32>, Vec<u32>) {
        let unique = self.runtime.config().unique_key_fast_path && table.has_unique_keys();
        let mut stream_indices = Vec::new();
        let mut build_indices = Vec::new();
        for (row, _) in probe_mask.iter().enumerate().filter(|(_, probe)| **probe) {
            let key = keys.row(row);
            if unique {
                if let Some(build_row) = table.lookup_unique(key.as_ref()) {
                    stream_indices.push(row as u32);
                    build_indices.push(build_row);
                }
            } else {
                for build_row in table.lookup(key.as_ref()) {
                    stream_indices.push(row as u32);
                    build_indices.push(build_row);
                }
            }
        }
        (stream_indices, build_indices)
    }

    /// Keeps the candidate pairs for which the residual filter is true.
    fn apply_filter(
        &self,
        filter: &Arc<dyn PhysicalExpr>,
        stream: &RecordBatch,
        build: &RecordBatch,
        stream_indices: Vec<u32>,
        build_indices: Vec<u32>,
    ) -> CometResult<(Vec<u32>, Vec<u32>)> {
        if stream_indices.is_empty() {
            return Ok((stream_indices, build_indices));
        }
        let stream_columns = take_columns(
            stream,
            &UInt32Array::from_iter_values(stream_indices.iter().copied()),
        )?;
        let build_columns = take_columns(
            build,
            &UInt32Array::from_iter_values(build_indices.iter().copied()),
        )?;
        let intermediate = RecordBatch::try_new(
            Arc::clone(self.spec.intermediate_schema()),
            self.join_columns(stream_columns, build_columns),
        )?;

        let mask = filter
            .evaluate(&intermediate)
            .and_then(|v| v.into_array(intermediate.num_rows()))
            .map_err(|source| CometError::Evaluation {
                msg: format!("{filter}"),
                source,
            })?;
        let mask = mask.as_boolean_opt().ok_or_else(|| {
            CometError::Internal(format!(
                "Join filter evaluated to {} instead of Boolean",
                mask.data_type()
            ))
        })?;

        Ok(stream_indices
            .into_iter()
            .zip(build_indices)
            .enumerate()
            .filter(|(i, _)| mask.is_valid(*i) && mask.value(*i))
            .map(|(_, pair)| pair)
            .unzip())
    }

    fn emit(
        &self,
        stream: &RecordBatch,
        build: &RecordBatch,
        stream_indices: &[u32],
        build_indices: &[u32],
    ) -> CometResult<RecordBatch> {
        let schema = Arc::clone(self.spec.output_schema());
        let num_rows = stream.num_rows();
        let columns = match self.spec.join_type() {
            join_type @ (JoinType::LeftSemi | JoinType::LeftAnti | JoinType::ExistenceCheck) => {
                let mut matched = vec![false; num_rows];
                for row in stream_indices {
                    matched[*row as usize] = true;
                }
                match join_type {
                    JoinType::ExistenceCheck => {
                        let mut columns = stream.columns().to_vec();
                        columns.push(Arc::new(BooleanArray::from(matched)));
                        columns
                    }
                    _ => {
                        let keep = join_type == JoinType::LeftSemi;
                        let indices = UInt32Array::from_iter_values(
                            (0..num_rows as u32).filter(|row| matched[*row as usize] == keep),
                        );
                        take_columns(stream, &indices)?
                    }
                }
            }
            _ if self.spec.preserves_stream() => {
                let mut stream_take = Vec::with_capacity(stream_indices.len().max(num_rows));
                let mut build_take = Vec::with_capacity(stream_take.capacity());
                let mut pairs = stream_indices.iter().zip(build_indices).peekable();
                for row in 0..num_rows as u32 {
                    let mut matched = false;
                    while let Some((_, build_row)) = pairs.next_if(|(s, _)| **s == row) {
                        stream_take.push(row);
                        build_take.push(Some(*build_row));
                        matched = true;
                    }
                    if !matched {
                        stream_take.push(row);
                        build_take.push(None);
                    }
                }
                self.join_columns(
                    take_columns(stream, &UInt32Array::from(stream_take))?,
                    take_columns(build, &UInt32Array::from(build_take))?,
                )
            }
            _ => self.join_columns(
                take_columns(
                    stream,
                    &UInt32Array::from_iter_values(stream_indices.iter().copied()),
                )?,
                take_columns(
                    build,
                    &UInt32Array::from_iter_values(build_indices.iter().copied()),
                )?,
            ),
        };
        Ok(RecordBatch::try_new(schema, columns)?)
    }

    /// Build rows nothing matched, with the stream side NULL.
    fn sweep_unmatched(&mut self) -> CometResult<Option<RecordBatch>> {
        let (Some(table), Some(mut visited)) = (self.table.as_ref(), self.visited.take()) else {
            return Ok(None);
        };
        let visited = visited.finish();
        let unmatched = UInt32Array::from_iter_values(
            (0..table.num_rows() as u32).filter(|row| !visited.value(*row as usize)),
        );
        if unmatched.is_empty() {
            return Ok(None);
        }
        debug!(
            "Hash join partition {} emitting {} unmatched build rows",
            self.partition,
            unmatched.len()
        );
        let stream_columns = self
            .spec
            .stream_schema()
            .fields()
            .iter()
            .map(|field| new_null_array(field.data_type(), unmatched.len()))
            .collect();
        let build_columns = take_columns(table.batch(), &unmatched)?;
        Ok(Some(RecordBatch::try_new(
            Arc::clone(self.spec.output_schema()),
            self.join_columns(stream_columns, build_columns),
        )?))
    }

    /// Orders stream and build columns as `left ++ right`.
    fn join_columns(&self, stream: Vec<ArrayRef>, build: Vec<ArrayRef>) -> Vec<ArrayRef> {
        let (mut left, right) = match self.spec.build_side() {
            BuildSide::Left => (build, stream),
            BuildSide::Right => (stream, build),
        };
        left.extend(right);
        left
    }

    fn finish(&mut self) {
        if self.state == HashJoinStreamState::Done {
            return;
        }
        self.state = HashJoinStreamState::Done;
        self.table = None;
        self.visited = None;
        self.metrics.baseline.done();
        debug!(
            "Hash join partition {} finished with {} output rows",
            self.partition,
            self.metrics.baseline.output_rows().value()
        );
    }

    fn probe_error(&self, cause: CometError) -> CometError {
        CometError::data_access(
            format!("Failed to probe hash table for partition {}", self.partition),
            cause,
        )
    }
}

impl<B, I, S> Iterator for HashJoinStream<B, S>
where
    B: FnMut() -> CometResult<I>,
    I: Iterator<Item = CometResult<RecordBatch>>,
    S: Iterator<Item = CometResult<RecordBatch>>,
{
    type Item = CometResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                HashJoinStreamState::Uninitialized => match self.load_table() {
                    Ok(table) => {
                        if self.spec.preserves_build() {
                            let mut visited = BooleanBufferBuilder::new(table.num_rows());
                            visited.append_n(table.num_rows(), false);
                            self.visited = Some(visited);
                        }
                        self.table = Some(table);
                        self.state = HashJoinStreamState::Ready;
                    }
                    Err(e) => {
                        self.finish();
                        return Some(Err(e));
                    }
                },
                HashJoinStreamState::Ready => {
                    let batch = match self.stream_input.next() {
                        Some(Ok(batch)) => batch,
                        Some(Err(e)) => {
                            self.finish();
                            return Some(Err(self.probe_error(e)));
                        }
                        None if self.visited.is_some() => {
                            self.state = HashJoinStreamState::SweepUnmatched;
                            continue;
                        }
                        None => {
                            self.finish();
                            return None;
                        }
                    };
                    let Some(table) = self.table.as_ref().map(Arc::clone) else {
                        self.finish();
                        return Some(Err(CometError::Internal(
                            "Hash join probed without a hash table".to_string(),
                        )));
                    };

                    let elapsed_compute = self.metrics.baseline.elapsed_compute().clone();
                    let timer = elapsed_compute.timer();
                    let result = self.process_batch(&batch, &table);
                    timer.done();
                    match result {
                        Ok(output) if output.num_rows() == 0 => continue,
                        Ok(output) => {
                            self.metrics.baseline.record_output(output.num_rows());
                            return Some(Ok(output));
                        }
                        Err(e) => {
                            self.finish();
                            return Some(Err(self.probe_error(e)));
                        }
                    }
                }
                HashJoinStreamState::SweepUnmatched => {
                    let result = self.sweep_unmatched();
                    if let Ok(Some(output)) = &result {
                        self.metrics.baseline.record_output(output.num_rows());
                    }
                    self.finish();
                    return result.map_err(|e| self.probe_error(e)).transpose();
                }
                HashJoinStreamState::Done => return None,
            }
        }
    }
}

fn take_columns(batch: &RecordBatch, indices: &UInt32Array) -> CometResult<Vec<ArrayRef>> {
    batch
        .columns()
        .iter()
        .map(|column| {
            if indices.null_count() == indices.len() {
                Ok(new_null_array(column.data_type(), indices.len()))
            } else {
                Ok(take(column.as_ref(), indices, None)?)
            }
        })
        .collect()
}
