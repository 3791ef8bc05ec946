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

use std::fmt;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::physical_expr::PhysicalExpr;

use crate::errors::{CometError, CometResult};
use crate::execution::joins::distribution::{self, Distribution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    LeftAnti,
    /// Emits every left row with a Boolean `exists` column telling whether a
    /// matching right row was found.
    ExistenceCheck,
}

impl JoinType {
    /// Whether the output carries only left columns (plus `exists`).
    pub fn is_left_only(&self) -> bool {
        matches!(
            self,
            JoinType::LeftSemi | JoinType::LeftAnti | JoinType::ExistenceCheck
        )
    }

    fn preserves_left(&self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    fn preserves_right(&self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildSide {
    Left,
    Right,
}

pub const EXISTS_COLUMN: &str = "exists";

/// Immutable description of a hash join, validated at planning time.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    left_keys: Vec<Arc<dyn PhysicalExpr>>,
    right_keys: Vec<Arc<dyn PhysicalExpr>>,
    left_schema: SchemaRef,
    right_schema: SchemaRef,
    /// Residual condition, bound to `left ++ right` columns.
    filter: Option<Arc<dyn PhysicalExpr>>,
    join_type: JoinType,
    build_side: BuildSide,
    left_size_bytes: u64,
    right_size_bytes: u64,
    intermediate_schema: SchemaRef,
    output_schema: SchemaRef,
}

impl JoinSpec {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        left_keys: Vec<Arc<dyn PhysicalExpr>>,
        right_keys: Vec<Arc<dyn PhysicalExpr>>,
        left_schema: SchemaRef,
        right_schema: SchemaRef,
        filter: Option<Arc<dyn PhysicalExpr>>,
        join_type: JoinType,
        build_side: BuildSide,
        left_size_bytes: u64,
        right_size_bytes: u64,
    ) -> CometResult<Self> {
        if left_keys.is_empty() {
            return Err(CometError::Planning(
                "Hash join requires at least one key".to_string(),
            ));
        }
        if left_keys.len() != right_keys.len() {
            return Err(CometError::Planning(format!(
                "Join key arity mismatch: {} left keys vs {} right keys",
                left_keys.len(),
                right_keys.len()
            )));
        }
        for (i, (l, r)) in left_keys.iter().zip(&right_keys).enumerate() {
            let left_type = l.data_type(&left_schema)?;
            let right_type = r.data_type(&right_schema)?;
            if left_type != right_type {
                return Err(CometError::Planning(format!(
                    "Join key {i} type mismatch: {left_type} vs {right_type}"
                )));
            }
        }
        if join_type.is_left_only() && build_side == BuildSide::Left {
            return Err(CometError::Planning(format!(
                "{join_type} join must build the right side"
            )));
        }

        let intermediate_schema = Arc::new(Schema::new(
            left_schema
                .fields()
                .iter()
                .chain(right_schema.fields().iter())
                .cloned()
                .collect::<Vec<_>>(),
        ));
        if let Some(filter) = &filter {
            let filter_type = filter.data_type(&intermediate_schema)?;
            if filter_type != DataType::Boolean {
                return Err(CometError::Planning(format!(
                    "Join filter must be Boolean, got {filter_type}"
                )));
            }
        }
        let output_schema = output_schema(&left_schema, &right_schema, join_type);

        Ok(Self {
            left_keys,
            right_keys,
            left_schema,
            right_schema,
            filter,
            join_type,
            build_side,
            left_size_bytes,
            right_size_bytes,
            intermediate_schema,
            output_schema,
        })
    }

    pub fn left_keys(&self) -> &[Arc<dyn PhysicalExpr>] {
        &self.left_keys
    }

    pub fn right_keys(&self) -> &[Arc<dyn PhysicalExpr>] {
        &self.right_keys
    }

    pub fn left_schema(&self) -> &SchemaRef {
        &self.left_schema
    }

    pub fn right_schema(&self) -> &SchemaRef {
        &self.right_schema
    }

    pub fn filter(&self) -> Option<&Arc<dyn PhysicalExpr>> {
        self.filter.as_ref()
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn build_side(&self) -> BuildSide {
        self.build_side
    }

    pub fn left_size_bytes(&self) -> u64 {
        self.left_size_bytes
    }

    pub fn right_size_bytes(&self) -> u64 {
        self.right_size_bytes
    }

    pub fn build_keys(&self) -> &[Arc<dyn PhysicalExpr>] {
        match self.build_side {
            BuildSide::Left => &self.left_keys,
            BuildSide::Right => &self.right_keys,
        }
    }

    pub fn stream_keys(&self) -> &[Arc<dyn PhysicalExpr>] {
        match self.build_side {
            BuildSide::Left => &self.right_keys,
            BuildSide::Right => &self.left_keys,
        }
    }

    pub fn build_schema(&self) -> &SchemaRef {
        match self.build_side {
            BuildSide::Left => &self.left_schema,
            BuildSide::Right => &self.right_schema,
        }
    }

    pub fn stream_schema(&self) -> &SchemaRef {
        match self.build_side {
            BuildSide::Left => &self.right_schema,
            BuildSide::Right => &self.left_schema,
        }
    }

    /// Schema the residual filter is evaluated against.
    pub fn intermediate_schema(&self) -> &SchemaRef {
        &self.intermediate_schema
    }

    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    /// Distributions both inputs need before this join runs, given their
    /// current layouts over key expressions. On a tie between two usable key
    /// subsets the larger input, by the sizes given at planning, keeps its
    /// layout.
    pub fn required_distributions(
        &self,
        left_partitioning: &Distribution<Arc<dyn PhysicalExpr>>,
        right_partitioning: &Distribution<Arc<dyn PhysicalExpr>>,
        is_replicated_join: bool,
    ) -> (
        Distribution<Arc<dyn PhysicalExpr>>,
        Distribution<Arc<dyn PhysicalExpr>>,
    ) {
        distribution::required_distributions(
            &self.left_keys,
            &self.right_keys,
            left_partitioning,
            right_partitioning,
            self.left_size_bytes,
            self.right_size_bytes,
            is_replicated_join,
        )
    }

    /// Whether unmatched stream rows are emitted null-extended.
    pub fn preserves_stream(&self) -> bool {
        match self.build_side {
            BuildSide::Left => self.join_type.preserves_right(),
            BuildSide::Right => self.join_type.preserves_left(),
        }
    }

    /// Whether unmatched build rows are emitted after the stream is drained.
    pub fn preserves_build(&self) -> bool {
        match self.build_side {
            BuildSide::Left => self.join_type.preserves_left(),
            BuildSide::Right => self.join_type.preserves_right(),
        }
    }
}

fn with_nullability(schema: &Schema, nullable: bool) -> Vec<Field> {
    schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(nullable || f.is_nullable()))
        .collect()
}

fn output_schema(left: &Schema, right: &Schema, join_type: JoinType) -> SchemaRef {
    let fields = match join_type {
        JoinType::LeftSemi | JoinType::LeftAnti => with_nullability(left, false),
        JoinType::ExistenceCheck => {
            let mut fields = with_nullability(left, false);
            fields.push(Field::new(EXISTS_COLUMN, DataType::Boolean, false));
            fields
        }
        _ => {
            let mut fields = with_nullability(left, join_type.preserves_right());
            fields.extend(with_nullability(right, join_type.preserves_left()));
            fields
        }
    };
    Arc::new(Schema::new(fields))
}
