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

//! Errors raised while planning and executing hash joins.

use std::result;

use arrow::error::ArrowError;
use datafusion::common::DataFusionError;

#[derive(thiserror::Error, Debug)]
pub enum CometError {
    #[error("Configuration Error: {0}")]
    Config(String),

    /// The join cannot be planned as described, e.g. the key lists of the two
    /// sides differ in arity or type. Raised before any task runs.
    #[error("Join planning error: {0}")]
    Planning(String),

    /// A memory reservation for a build side was refused. The build cache
    /// recovers from this by invalidating itself and retrying.
    #[error("Resources exhausted: {0}")]
    ResourcesExhausted(String),

    #[error("Failed to evaluate join condition: {msg}")]
    Evaluation {
        msg: String,
        #[source]
        source: DataFusionError,
    },

    /// Terminates the task of a single partition. Wraps the failure that
    /// caused the hash table build or the probe to give up.
    #[error("{msg}: {source}")]
    DataAccess {
        msg: String,
        #[source]
        source: Box<CometError>,
    },

    #[error("Comet Internal Error: {0}")]
    Internal(String),

    #[error(transparent)]
    Arrow {
        #[from]
        source: ArrowError,
    },

    #[error("{msg}")]
    DataFusion {
        msg: String,
        #[source]
        source: DataFusionError,
    },
}

impl CometError {
    pub fn data_access(msg: impl Into<String>, cause: CometError) -> Self {
        CometError::DataAccess {
            msg: msg.into(),
            source: Box::new(cause),
        }
    }

    /// Whether this error (or the error it wraps) means memory ran out.
    pub fn is_resources_exhausted(&self) -> bool {
        match self {
            CometError::ResourcesExhausted(_) => true,
            CometError::DataFusion {
                source: DataFusionError::ResourcesExhausted(_),
                ..
            } => true,
            CometError::DataAccess { source, .. } => source.is_resources_exhausted(),
            _ => false,
        }
    }
}

impl From<DataFusionError> for CometError {
    fn from(value: DataFusionError) -> Self {
        match value {
            DataFusionError::ResourcesExhausted(msg) => CometError::ResourcesExhausted(msg),
            DataFusionError::ArrowError(source, _) => CometError::Arrow { source: *source },
            other => CometError::DataFusion {
                msg: other.message().to_string(),
                source: other,
            },
        }
    }
}

/// A specialized `Result` for Comet errors.
pub type CometResult<T> = result::Result<T, CometError>;
