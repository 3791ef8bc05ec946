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

//! Negotiates how both inputs of a hash join must be partitioned before the
//! join runs, avoiding an exchange whenever an input is already laid out on
//! (a subset of) its join keys.

use itertools::Itertools;
use log::debug;

/// How rows of a relation are, or must be, divided across partitions.
///
/// `K` identifies a column (or key expression) and only needs equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Distribution<K> {
    /// No requirement, or nothing is known about the layout.
    Unspecified,
    /// Rows that agree on all of these columns share a partition. Order within
    /// a partition is irrelevant.
    ClusteredBy(Vec<K>),
    /// Every worker holds the full relation.
    Broadcast,
    /// Partitioned in an unknown way into the given number of partitions.
    Unknown(usize),
}

impl<K: PartialEq> Distribution<K> {
    /// Whether data laid out as `self` already meets `required`.
    ///
    /// Clustering is exact: hash partitioning on `[a]` does not satisfy a
    /// requirement of `[a, b]`, since partition placement follows the full
    /// column set.
    pub fn satisfies(&self, required: &Distribution<K>) -> bool {
        match (self, required) {
            (_, Distribution::Unspecified) => true,
            (Distribution::ClusteredBy(columns), Distribution::ClusteredBy(required)) => {
                same_columns(columns, required)
            }
            (Distribution::Broadcast, Distribution::Broadcast) => true,
            _ => false,
        }
    }

    /// Number of columns the layout is clustered on.
    pub fn num_columns(&self) -> usize {
        match self {
            Distribution::ClusteredBy(columns) => columns.len(),
            _ => 0,
        }
    }

    fn is_unknown(&self) -> bool {
        matches!(self, Distribution::Unknown(_) | Distribution::Unspecified)
    }
}

fn same_columns<K: PartialEq>(columns: &[K], required: &[K]) -> bool {
    !columns.is_empty()
        && columns.len() == required.len()
        && columns.iter().all(|c| required.contains(c))
        && required.iter().all(|r| columns.contains(r))
}

/// Computes the distributions the left and right inputs must have before a
/// hash join on `left_keys = right_keys` runs.
///
/// The function is pure: the same inputs always produce the same pair.
#[allow(clippy::too_many_arguments)]
pub fn required_distributions<K: Clone + PartialEq>(
    left_keys: &[K],
    right_keys: &[K],
    left_partitioning: &Distribution<K>,
    right_partitioning: &Distribution<K>,
    left_size_bytes: u64,
    right_size_bytes: u64,
    is_replicated_join: bool,
) -> (Distribution<K>, Distribution<K>) {
    if is_replicated_join {
        // the replicated side is present on every worker already
        return (Distribution::Unspecified, Distribution::Unspecified);
    }

    let left_clustered = Distribution::ClusteredBy(left_keys.to_vec());
    let right_clustered = Distribution::ClusteredBy(right_keys.to_vec());
    if left_partitioning.satisfies(&left_clustered)
        || right_partitioning.satisfies(&right_clustered)
        || matches!(left_partitioning, Distribution::Broadcast)
        || matches!(right_partitioning, Distribution::Broadcast)
        || (left_partitioning.is_unknown() && right_partitioning.is_unknown())
    {
        return (left_clustered, right_clustered);
    }

    let left_subset = satisfied_key_subset(left_partitioning, left_keys);
    let right_subset = satisfied_key_subset(right_partitioning, right_keys);
    debug!(
        "Join key subsets already satisfied: left={:?}, right={:?}",
        left_subset, right_subset
    );

    match (left_subset, right_subset) {
        (Some(left_positions), Some(right_positions)) => {
            if left_positions == right_positions || left_size_bytes >= right_size_bytes {
                // the larger relation keeps its layout
                (
                    pick(left_keys, &left_positions),
                    pick(right_keys, &left_positions),
                )
            } else {
                (
                    pick(left_keys, &right_positions),
                    pick(right_keys, &right_positions),
                )
            }
        }
        (Some(positions), None) | (None, Some(positions)) => {
            (pick(left_keys, &positions), pick(right_keys, &positions))
        }
        (None, None) => (left_clustered, right_clustered),
    }
}

/// Finds the first combination of key positions, in key order, whose
/// clustering is already satisfied by `partitioning`. Only combinations as
/// wide as the partitioning itself can match.
fn satisfied_key_subset<K: Clone + PartialEq>(
    partitioning: &Distribution<K>,
    keys: &[K],
) -> Option<Vec<usize>> {
    let num_columns = partitioning.num_columns();
    if num_columns == 0 || num_columns > keys.len() {
        return None;
    }
    (0..keys.len())
        .combinations(num_columns)
        .find(|positions| {
            let subset = positions.iter().map(|&i| keys[i].clone()).collect();
            partitioning.satisfies(&Distribution::ClusteredBy(subset))
        })
}

fn pick<K: Clone>(keys: &[K], positions: &[usize]) -> Distribution<K> {
    Distribution::ClusteredBy(positions.iter().map(|&i| keys[i].clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&'static str]) -> Vec<&'static str> {
        names.to_vec()
    }

    fn clustered(names: &[&'static str]) -> Distribution<&'static str> {
        Distribution::ClusteredBy(cols(names))
    }

    const LEFT_KEYS: [&str; 3] = ["l1", "l2", "l3"];
    const RIGHT_KEYS: [&str; 3] = ["r1", "r2", "r3"];

    #[test]
    fn replicated_join_requires_nothing() {
        let (left, right) = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &clustered(&["l2"]),
            &Distribution::Unknown(8),
            10,
            20,
            true,
        );
        assert_eq!(left, Distribution::Unspecified);
        assert_eq!(right, Distribution::Unspecified);
    }

    #[test]
    fn already_clustered_keeps_full_keys() {
        // left is laid out on all keys (in a different order)
        let (left, right) = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &clustered(&["l3", "l1", "l2"]),
            &clustered(&["r2"]),
            10,
            20,
            false,
        );
        assert_eq!(left, clustered(&LEFT_KEYS));
        assert_eq!(right, clustered(&RIGHT_KEYS));
    }

    #[test]
    fn broadcast_or_unknown_inputs_keep_defaults() {
        let expected = (clustered(&LEFT_KEYS), clustered(&RIGHT_KEYS));
        let broadcast = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &Distribution::Broadcast,
            &clustered(&["r1"]),
            1,
            2,
            false,
        );
        assert_eq!(broadcast, expected);
        let unknown = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &Distribution::Unknown(4),
            &Distribution::Unknown(4),
            1,
            2,
            false,
        );
        assert_eq!(unknown, expected);
    }

    #[test]
    fn common_subset_is_required_on_both_sides() {
        let (left, right) = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &clustered(&["l2"]),
            &clustered(&["r2"]),
            10,
            20,
            false,
        );
        assert_eq!(left, clustered(&["l2"]));
        assert_eq!(right, clustered(&["r2"]));
    }

    #[test]
    fn larger_side_keeps_its_layout() {
        // left is clustered on position 0, right on position 2
        let left_partitioning = clustered(&["l1"]);
        let right_partitioning = clustered(&["r3"]);

        let (left, right) = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &left_partitioning,
            &right_partitioning,
            1000,
            10,
            false,
        );
        assert_eq!(left, clustered(&["l1"]));
        assert_eq!(right, clustered(&["r1"]));

        let (left, right) = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &left_partitioning,
            &right_partitioning,
            10,
            1000,
            false,
        );
        assert_eq!(left, clustered(&["l3"]));
        assert_eq!(right, clustered(&["r3"]));
    }

    #[test]
    fn single_side_subset_is_mirrored() {
        let (left, right) = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &Distribution::Unknown(8),
            &clustered(&["r3", "r1"]),
            10,
            20,
            false,
        );
        assert_eq!(left, clustered(&["l1", "l3"]));
        assert_eq!(right, clustered(&["r1", "r3"]));
    }

    #[test]
    fn unrelated_partitioning_falls_back_to_full_keys() {
        let (left, right) = required_distributions(
            &LEFT_KEYS,
            &RIGHT_KEYS,
            &clustered(&["other"]),
            &Distribution::Unknown(8),
            10,
            20,
            false,
        );
        assert_eq!(left, clustered(&LEFT_KEYS));
        assert_eq!(right, clustered(&RIGHT_KEYS));
    }

    #[test]
    fn repeated_calls_are_deterministic() {
        let run = || {
            required_distributions(
                &LEFT_KEYS,
                &RIGHT_KEYS,
                &clustered(&["l2", "l3"]),
                &clustered(&["r1"]),
                500,
                500,
                false,
            )
        };
        let first = run();
        for _ in 0..10 {
            assert_eq!(run(), first);
        }
    }

    #[test]
    fn satisfies_is_exact() {
        assert!(clustered(&["a", "b"]).satisfies(&clustered(&["b", "a"])));
        assert!(!clustered(&["a"]).satisfies(&clustered(&["a", "b"])));
        assert!(!Distribution::<&str>::Unknown(3).satisfies(&clustered(&["a"])));
        assert!(Distribution::<&str>::Unknown(3).satisfies(&Distribution::Unspecified));
        assert!(Distribution::<&str>::Broadcast.satisfies(&Distribution::Broadcast));
    }
}
