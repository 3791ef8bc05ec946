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

//! Hash join planning and execution.

mod build_cache;
mod distribution;
mod hash_join;
mod hash_table;
mod join_spec;
mod lineage;
mod metrics;

pub use build_cache::{BuildCache, BuildCacheStats, CacheKey};
pub use distribution::{required_distributions, Distribution};
pub use hash_join::{HashJoinExec, HashJoinStream};
pub use hash_table::{build_hash_table, HashEntryStore, KeyBounds, Matches};
pub use join_spec::{BuildSide, JoinSpec, JoinType, EXISTS_COLUMN};
pub use lineage::{
    collect_shuffle_dependencies, stitch, Dependency, Location, PartitionedSource,
    ShuffleDependency, StitchedLineage,
};
