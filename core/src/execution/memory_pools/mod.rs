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

//! Memory pools that hash table builds reserve from. A refused reservation is
//! what the build cache treats as running out of memory.

mod config;

use std::num::NonZeroUsize;
use std::sync::Arc;

use datafusion::execution::memory_pool::{
    FairSpillPool, GreedyMemoryPool, MemoryPool, TrackConsumersPool, UnboundedMemoryPool,
};

pub use config::*;

const NUM_TRACKED_CONSUMERS: usize = 10;

pub fn create_memory_pool(memory_pool_config: &MemoryPoolConfig) -> Arc<dyn MemoryPool> {
    let tracked = NonZeroUsize::new(NUM_TRACKED_CONSUMERS).unwrap_or(NonZeroUsize::MIN);
    match memory_pool_config.pool_type {
        MemoryPoolType::Greedy => Arc::new(TrackConsumersPool::new(
            GreedyMemoryPool::new(memory_pool_config.pool_size),
            tracked,
        )),
        MemoryPoolType::FairSpill => Arc::new(TrackConsumersPool::new(
            FairSpillPool::new(memory_pool_config.pool_size),
            tracked,
        )),
        MemoryPoolType::Unbounded => Arc::new(UnboundedMemoryPool::default()),
    }
}
