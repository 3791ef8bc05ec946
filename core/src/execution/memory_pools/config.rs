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

use crate::errors::{CometError, CometResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryPoolType {
    Greedy,
    FairSpill,
    Unbounded,
}

#[derive(Clone, Debug)]
pub struct MemoryPoolConfig {
    pub pool_type: MemoryPoolType,
    pub pool_size: usize,
}

impl MemoryPoolConfig {
    pub fn new(pool_type: MemoryPoolType, pool_size: usize) -> Self {
        Self {
            pool_type,
            pool_size,
        }
    }
}

pub fn parse_memory_pool_config(
    memory_pool_type: &str,
    memory_limit: usize,
) -> CometResult<MemoryPoolConfig> {
    let memory_pool_config = match memory_pool_type {
        "default" | "greedy" => MemoryPoolConfig::new(MemoryPoolType::Greedy, memory_limit),
        "fair_spill" => MemoryPoolConfig::new(MemoryPoolType::FairSpill, memory_limit),
        "unbounded" => MemoryPoolConfig::new(MemoryPoolType::Unbounded, 0),
        _ => {
            return Err(CometError::Config(format!(
                "Unsupported memory pool type for hash join builds: {memory_pool_type}"
            )))
        }
    };
    Ok(memory_pool_config)
}
