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

//! Worker-scoped services shared by every hash join task of a process.

use std::collections::HashMap;
use std::sync::Arc;

use datafusion::execution::memory_pool::MemoryPool;
use log::info;

use crate::errors::CometResult;
use crate::execution::config::HashJoinConfig;
use crate::execution::joins::BuildCache;
use crate::execution::memory_pools::{create_memory_pool, parse_memory_pool_config};

/// Created once when a worker starts and closed when it shuts down.
#[derive(Debug)]
pub struct JoinRuntime {
    config: HashJoinConfig,
    memory_pool: Arc<dyn MemoryPool>,
    build_cache: BuildCache,
}

impl JoinRuntime {
    /// Creates the runtime from the Spark configuration of the worker.
    pub fn try_new(spark_conf: &HashMap<String, String>) -> CometResult<Self> {
        let config = HashJoinConfig::from_spark_conf(spark_conf)?;
        let pool_config =
            parse_memory_pool_config(&config.memory_pool_type, config.memory_pool_size)?;
        let memory_pool = create_memory_pool(&pool_config);
        info!(
            "Created join runtime with {:?} memory pool of {} bytes",
            pool_config.pool_type, pool_config.pool_size
        );
        Self::new(config, memory_pool)
    }

    pub fn new(config: HashJoinConfig, memory_pool: Arc<dyn MemoryPool>) -> CometResult<Self> {
        let build_cache = BuildCache::new(config.build_cache_capacity)?;
        Ok(Self {
            config,
            memory_pool,
            build_cache,
        })
    }

    pub fn config(&self) -> &HashJoinConfig {
        &self.config
    }

    pub fn memory_pool(&self) -> &Arc<dyn MemoryPool> {
        &self.memory_pool
    }

    pub fn build_cache(&self) -> &BuildCache {
        &self.build_cache
    }

    /// Invalidates the build cache. Tables still held by running tasks are
    /// released as those tasks complete.
    pub fn close(&self) {
        info!("Closing join runtime");
        self.build_cache.close();
    }
}
