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

use datafusion::physical_plan::metrics::{
    BaselineMetrics, Count, ExecutionPlanMetricsSet, MetricBuilder, Time,
};

pub(super) struct HashJoinMetrics {
    /// output rows and probe time
    pub(super) baseline: BaselineMetrics,

    /// Time to build or fetch the hash table
    pub(super) build_time: Time,

    /// Memory size of the hash table used by the partition
    pub(super) build_data_size: Count,

    /// Number of stream-side batches
    pub(super) input_batches: Count,

    /// Number of stream-side rows
    pub(super) input_rows: Count,

    /// Stream rows skipped because a key fell outside the build-side key range
    pub(super) range_pruned_rows: Count,
}

impl HashJoinMetrics {
    pub(super) fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            baseline: BaselineMetrics::new(metrics, partition),
            build_time: MetricBuilder::new(metrics).subset_time("build_time", partition),
            build_data_size: MetricBuilder::new(metrics).counter("build_data_size", partition),
            input_batches: MetricBuilder::new(metrics).counter("input_batches", partition),
            input_rows: MetricBuilder::new(metrics).counter("input_rows", partition),
            range_pruned_rows: MetricBuilder::new(metrics)
                .counter("range_pruned_rows", partition),
        }
    }
}
