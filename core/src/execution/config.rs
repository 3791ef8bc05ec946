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

//! Hash join settings read from the Spark configuration map handed to the
//! native side.

use std::collections::HashMap;
use std::str::FromStr;

use crate::errors::{CometError, CometResult};

pub const BUILD_CACHE_CAPACITY: &str = "spark.comet.exec.hashJoin.buildCache.capacity";
pub const BUILD_CACHE_MAX_RETRIES: &str = "spark.comet.exec.hashJoin.buildCache.maxRetries";
pub const UNIQUE_KEY_FAST_PATH: &str = "spark.comet.exec.hashJoin.uniqueKeyFastPath.enabled";
pub const RANGE_PRUNING: &str = "spark.comet.exec.hashJoin.rangePruning.enabled";
pub const MEMORY_POOL_TYPE: &str = "spark.comet.exec.memoryPool";
pub const MEMORY_POOL_SIZE: &str = "spark.comet.exec.memoryPool.size";

const DEFAULT_BUILD_CACHE_CAPACITY: usize = 50;
const DEFAULT_BUILD_CACHE_MAX_RETRIES: usize = 10;
const DEFAULT_MEMORY_POOL_SIZE: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashJoinConfig {
    /// Maximum number of replicated build sides kept in the build cache.
    pub build_cache_capacity: usize,
    /// Attempts made by the build cache when a build runs out of memory.
    pub build_cache_max_retries: usize,
    /// Probe with a single-match lookup when the build keys are unique.
    pub unique_key_fast_path: bool,
    /// Skip lookups for integral probe keys outside the build side's range.
    pub range_pruning: bool,
    pub memory_pool_type: String,
    pub memory_pool_size: usize,
}

impl Default for HashJoinConfig {
    fn default() -> Self {
        Self {
            build_cache_capacity: DEFAULT_BUILD_CACHE_CAPACITY,
            build_cache_max_retries: DEFAULT_BUILD_CACHE_MAX_RETRIES,
            unique_key_fast_path: true,
            range_pruning: true,
            memory_pool_type: "greedy".to_string(),
            memory_pool_size: DEFAULT_MEMORY_POOL_SIZE,
        }
    }
}

impl HashJoinConfig {
    pub fn from_spark_conf(conf: &HashMap<String, String>) -> CometResult<Self> {
        let defaults = Self::default();
        let config = Self {
            build_cache_capacity: parse_or(
                conf,
                BUILD_CACHE_CAPACITY,
                defaults.build_cache_capacity,
            )?,
            build_cache_max_retries: parse_or(
                conf,
                BUILD_CACHE_MAX_RETRIES,
                defaults.build_cache_max_retries,
            )?,
            unique_key_fast_path: parse_or(
                conf,
                UNIQUE_KEY_FAST_PATH,
                defaults.unique_key_fast_path,
            )?,
            range_pruning: parse_or(conf, RANGE_PRUNING, defaults.range_pruning)?,
            memory_pool_type: conf
                .get(MEMORY_POOL_TYPE)
                .cloned()
                .unwrap_or(defaults.memory_pool_type),
            memory_pool_size: parse_or(conf, MEMORY_POOL_SIZE, defaults.memory_pool_size)?,
        };
        if config.build_cache_capacity == 0 {
            return Err(CometError::Config(format!(
                "{BUILD_CACHE_CAPACITY} must be greater than zero"
            )));
        }
        if config.build_cache_max_retries == 0 {
            return Err(CometError::Config(format!(
                "{BUILD_CACHE_MAX_RETRIES} must be greater than zero"
            )));
        }
        Ok(config)
    }
}

fn parse_or<T>(conf: &HashMap<String, String>, name: &str, default: T) -> CometResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match conf.get(name) {
        Some(value) => value.trim().parse::<T>().map_err(|e| {
            CometError::Config(format!("Failed to parse config {name}={value}: {e}"))
        }),
        None => Ok(default),
    }
}
