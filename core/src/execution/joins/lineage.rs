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

//! Fuses the per-partition sources of the stream and build inputs of a hash
//! join into one schedulable unit.
//!
//! The fused unit runs one task per stream partition. Its preferred locations
//! combine the locations of both inputs, and every shuffle the build side
//! waits on is forwarded to the first stream source so that the scheduler
//! finishes those map stages before any join task starts.

use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use log::debug;

use crate::errors::{CometError, CometResult};

/// Host (or executor) a partition would like to run on.
pub type Location = String;

/// Output of a map stage that a source reads through an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShuffleDependency {
    pub shuffle_id: u32,
    pub num_map_partitions: usize,
}

#[derive(Clone)]
pub enum Dependency {
    /// Rows are redistributed: the map stage must complete first.
    Shuffle(ShuffleDependency),
    /// Partition-wise dependency on a parent within the same stage.
    Narrow(Arc<dyn PartitionedSource>),
}

impl Debug for Dependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Shuffle(shuffle) => write!(f, "Shuffle({})", shuffle.shuffle_id),
            Dependency::Narrow(parent) => write!(f, "Narrow({})", parent.name()),
        }
    }
}

/// Partitioned input of a join as the scheduler sees it.
pub trait PartitionedSource: Send + Sync {
    fn name(&self) -> &str;

    fn num_partitions(&self) -> usize;

    fn preferred_locations(&self, partition: usize) -> Vec<Location>;

    fn dependencies(&self) -> Vec<Dependency>;

    /// Sources whose partitions or locations are only known once execution
    /// starts return `false`.
    fn is_static(&self) -> bool {
        true
    }
}

/// Collects the shuffle dependencies reachable from `sources` through narrow
/// dependencies, in discovery order and without duplicates.
pub fn collect_shuffle_dependencies(
    sources: &[Arc<dyn PartitionedSource>],
) -> Vec<ShuffleDependency> {
    fn visit(
        source: &Arc<dyn PartitionedSource>,
        seen: &mut HashSet<ShuffleDependency>,
        shuffles: &mut Vec<ShuffleDependency>,
    ) {
        for dependency in source.dependencies() {
            match dependency {
                Dependency::Shuffle(shuffle) => {
                    if seen.insert(shuffle.clone()) {
                        shuffles.push(shuffle);
                    }
                }
                // a shuffle is a stage boundary, only narrow parents are followed
                Dependency::Narrow(parent) => visit(&parent, seen, shuffles),
            }
        }
    }

    let mut seen = HashSet::new();
    let mut shuffles = Vec::new();
    for source in sources {
        visit(source, &mut seen, &mut shuffles);
    }
    shuffles
}

fn has_shuffle_dependency(sources: &[Arc<dyn PartitionedSource>]) -> bool {
    !collect_shuffle_dependencies(sources).is_empty()
}

/// Wraps a stream source and adds the build side's shuffle dependencies to
/// its own.
struct DependentSource {
    inner: Arc<dyn PartitionedSource>,
    extra: Vec<ShuffleDependency>,
}

impl PartitionedSource for DependentSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn num_partitions(&self) -> usize {
        self.inner.num_partitions()
    }

    fn preferred_locations(&self, partition: usize) -> Vec<Location> {
        self.inner.preferred_locations(partition)
    }

    fn dependencies(&self) -> Vec<Dependency> {
        let mut dependencies = self.inner.dependencies();
        dependencies.extend(self.extra.iter().cloned().map(Dependency::Shuffle));
        dependencies
    }

    fn is_static(&self) -> bool {
        self.inner.is_static()
    }
}

/// Returns `source` with the shuffles it does not depend on directly yet.
fn attach_shuffles(
    source: &Arc<dyn PartitionedSource>,
    shuffles: &[ShuffleDependency],
) -> Arc<dyn PartitionedSource> {
    let existing: HashSet<ShuffleDependency> = source
        .dependencies()
        .into_iter()
        .filter_map(|dependency| match dependency {
            Dependency::Shuffle(shuffle) => Some(shuffle),
            Dependency::Narrow(_) => None,
        })
        .collect();
    let extra: Vec<_> = shuffles
        .iter()
        .filter(|shuffle| !existing.contains(*shuffle))
        .cloned()
        .collect();
    if extra.is_empty() {
        Arc::clone(source)
    } else {
        Arc::new(DependentSource {
            inner: Arc::clone(source),
            extra,
        })
    }
}

/// Result of stitching the two inputs of a join together.
#[derive(Clone)]
pub struct StitchedLineage {
    stream_sources: Vec<Arc<dyn PartitionedSource>>,
    build_sources: Vec<Arc<dyn PartitionedSource>>,
    original_stream_sources: Vec<Arc<dyn PartitionedSource>>,
    is_replicated_join: bool,
    preferred_locations: Vec<Vec<Location>>,
}

/// Stitches the stream and build sources of a join into one lineage.
pub fn stitch(
    stream_sources: Vec<Arc<dyn PartitionedSource>>,
    build_sources: Vec<Arc<dyn PartitionedSource>>,
    is_replicated_join: bool,
) -> CometResult<StitchedLineage> {
    let Some(first_stream) = stream_sources.first() else {
        return Err(CometError::Planning(
            "Hash join needs at least one stream-side source".to_string(),
        ));
    };
    let num_partitions = first_stream.num_partitions();
    // a replicated build side is read in full by every task
    let zipped_build: &[Arc<dyn PartitionedSource>] = if is_replicated_join {
        &[]
    } else {
        &build_sources
    };
    let mismatched = stream_sources
        .iter()
        .chain(zipped_build)
        .find(|source| source.num_partitions() != num_partitions);
    if let Some(source) = mismatched {
        return Err(CometError::Planning(format!(
            "Cannot zip partitions of {} ({} partitions) with {} ({} partitions)",
            first_stream.name(),
            num_partitions,
            source.name(),
            source.num_partitions()
        )));
    }

    let build_shuffles = collect_shuffle_dependencies(&build_sources);
    let preferred_locations = if is_replicated_join {
        (0..num_partitions)
            .map(|partition| first_stream.preferred_locations(partition))
            .collect()
    } else {
        let build_has_shuffle = !build_shuffles.is_empty();
        let stream_has_shuffle = has_shuffle_dependency(&stream_sources);
        (0..num_partitions)
            .map(|partition| {
                fused_locations(
                    &stream_sources,
                    &build_sources,
                    partition,
                    build_has_shuffle,
                    stream_has_shuffle,
                )
            })
            .collect()
    };

    let mut stitched_stream = stream_sources.clone();
    if !build_shuffles.is_empty() {
        stitched_stream[0] = attach_shuffles(&stream_sources[0], &build_shuffles);
    }
    debug!(
        "Stitched {} stream and {} build source(s) into {} partitions, \
         forwarding {} build shuffle(s), replicated={}",
        stream_sources.len(),
        build_sources.len(),
        num_partitions,
        build_shuffles.len(),
        is_replicated_join
    );

    Ok(StitchedLineage {
        stream_sources: stitched_stream,
        build_sources,
        original_stream_sources: stream_sources,
        is_replicated_join,
        preferred_locations,
    })
}

fn fused_locations(
    stream_sources: &[Arc<dyn PartitionedSource>],
    build_sources: &[Arc<dyn PartitionedSource>],
    partition: usize,
    build_has_shuffle: bool,
    stream_has_shuffle: bool,
) -> Vec<Location> {
    let per_source = |sources: &[Arc<dyn PartitionedSource>]| -> Vec<Vec<Location>> {
        sources
            .iter()
            .map(|source| source.preferred_locations(partition))
            .collect()
    };
    let stream_locations = per_source(stream_sources);
    let build_locations = per_source(build_sources);

    let all: Vec<&Vec<Location>> = stream_locations.iter().chain(&build_locations).collect();
    let intersection: Vec<Location> = all[0]
        .iter()
        .filter(|location| all[1..].iter().all(|other| other.contains(*location)))
        .cloned()
        .collect();
    if !intersection.is_empty() {
        return dedup(intersection);
    }

    if build_has_shuffle {
        // build locations only describe where the shuffle output landed
        dedup(stream_locations.into_iter().flatten().collect())
    } else if stream_has_shuffle {
        dedup(build_locations.into_iter().flatten().collect())
    } else {
        dedup(all.into_iter().flatten().cloned().collect())
    }
}

fn dedup(locations: Vec<Location>) -> Vec<Location> {
    let mut seen = HashSet::new();
    locations
        .into_iter()
        .filter(|location| seen.insert(location.clone()))
        .collect()
}

impl StitchedLineage {
    /// Stream sources, the first one carrying the build side's shuffles.
    pub fn stream_sources(&self) -> &[Arc<dyn PartitionedSource>] {
        &self.stream_sources
    }

    pub fn build_sources(&self) -> &[Arc<dyn PartitionedSource>] {
        &self.build_sources
    }

    pub fn is_replicated_join(&self) -> bool {
        self.is_replicated_join
    }

    /// Re-derives the lineage at execution start. Inputs that are all static
    /// yield the lineage computed at planning time.
    pub fn refresh(&self) -> CometResult<StitchedLineage> {
        let dynamic = self
            .original_stream_sources
            .iter()
            .chain(&self.build_sources)
            .any(|source| !source.is_static());
        if dynamic {
            stitch(
                self.original_stream_sources.clone(),
                self.build_sources.clone(),
                self.is_replicated_join,
            )
        } else {
            Ok(self.clone())
        }
    }
}

impl PartitionedSource for StitchedLineage {
    fn name(&self) -> &str {
        "HashJoinPartitions"
    }

    fn num_partitions(&self) -> usize {
        self.preferred_locations.len()
    }

    fn preferred_locations(&self, partition: usize) -> Vec<Location> {
        self.preferred_locations
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    fn dependencies(&self) -> Vec<Dependency> {
        self.stream_sources
            .iter()
            .cloned()
            .map(Dependency::Narrow)
            .collect()
    }

    fn is_static(&self) -> bool {
        self.original_stream_sources
            .iter()
            .chain(&self.build_sources)
            .all(|source| source.is_static())
    }
}

impl Debug for StitchedLineage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StitchedLineage")
            .field("num_partitions", &self.preferred_locations.len())
            .field("preferred_locations", &self.preferred_locations)
            .field("is_replicated_join", &self.is_replicated_join)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct TestSource {
        name: String,
        locations: Mutex<Vec<Vec<Location>>>,
        dependencies: Vec<Dependency>,
        is_static: bool,
    }

    impl TestSource {
        fn new(name: &str, locations: &[&[&str]]) -> Self {
            Self {
                name: name.to_string(),
                locations: Mutex::new(
                    locations
                        .iter()
                        .map(|hosts| hosts.iter().map(|h| h.to_string()).collect())
                        .collect(),
                ),
                dependencies: vec![],
                is_static: true,
            }
        }

        fn with_dependency(mut self, dependency: Dependency) -> Self {
            self.dependencies.push(dependency);
            self
        }

        fn dynamic(mut self) -> Self {
            self.is_static = false;
            self
        }

        fn arc(self) -> Arc<dyn PartitionedSource> {
            Arc::new(self)
        }
    }

    impl PartitionedSource for TestSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn num_partitions(&self) -> usize {
            self.locations.lock().len()
        }

        fn preferred_locations(&self, partition: usize) -> Vec<Location> {
            self.locations.lock()[partition].clone()
        }

        fn dependencies(&self) -> Vec<Dependency> {
            self.dependencies.clone()
        }

        fn is_static(&self) -> bool {
            self.is_static
        }
    }

    fn shuffle(id: u32) -> ShuffleDependency {
        ShuffleDependency {
            shuffle_id: id,
            num_map_partitions: 4,
        }
    }

    fn shuffle_ids(source: &Arc<dyn PartitionedSource>) -> Vec<u32> {
        source
            .dependencies()
            .into_iter()
            .filter_map(|d| match d {
                Dependency::Shuffle(s) => Some(s.shuffle_id),
                Dependency::Narrow(_) => None,
            })
            .collect()
    }

    #[test]
    fn collects_shuffles_through_wrapped_sources() {
        let exchange = TestSource::new("exchange", &[&["h1"]])
            .with_dependency(Dependency::Shuffle(shuffle(3)))
            .arc();
        let projection = TestSource::new("projection", &[&["h1"]])
            .with_dependency(Dependency::Narrow(exchange))
            .arc();
        let build = TestSource::new("build", &[&["h1"]])
            .with_dependency(Dependency::Narrow(projection))
            .with_dependency(Dependency::Shuffle(shuffle(5)))
            .arc();
        let shuffles = collect_shuffle_dependencies(&[build]);
        assert_eq!(shuffles, vec![shuffle(3), shuffle(5)]);
    }

    #[test]
    fn replicated_join_uses_stream_locations() {
        let stream = TestSource::new("stream", &[&["h1"], &["h2"], &["h3"]]).arc();
        let other_stream = TestSource::new("stream2", &[&["h9"], &["h9"], &["h9"]]).arc();
        let build = TestSource::new("replicated", &[&["h7"]])
            .with_dependency(Dependency::Shuffle(shuffle(1)))
            .arc();
        let lineage = stitch(vec![stream, other_stream], vec![build], true).unwrap();
        assert_eq!(lineage.num_partitions(), 3);
        assert_eq!(lineage.preferred_locations(1), vec!["h2".to_string()]);
        assert_eq!(shuffle_ids(&lineage.stream_sources()[0]), vec![1]);
        assert!(shuffle_ids(&lineage.stream_sources()[1]).is_empty());
    }

    #[test]
    fn intersects_locations_when_possible() {
        let stream = TestSource::new("stream", &[&["h1", "h2"], &["h3"]]).arc();
        let build = TestSource::new("build", &[&["h2", "h4"], &["h5"]]).arc();
        let lineage = stitch(vec![stream], vec![build], false).unwrap();
        assert_eq!(lineage.preferred_locations(0), vec!["h2".to_string()]);
        // nothing in common and no shuffles: union
        assert_eq!(
            lineage.preferred_locations(1),
            vec!["h3".to_string(), "h5".to_string()]
        );
    }

    #[test]
    fn shuffled_build_prefers_stream_locations() {
        let stream = TestSource::new("stream", &[&["h1"]]).arc();
        let build = TestSource::new("build", &[&["h2"]])
            .with_dependency(Dependency::Shuffle(shuffle(2)))
            .arc();
        let lineage = stitch(vec![stream], vec![build], false).unwrap();
        assert_eq!(lineage.preferred_locations(0), vec!["h1".to_string()]);
        assert_eq!(shuffle_ids(&lineage.stream_sources()[0]), vec![2]);
    }

    #[test]
    fn shuffled_stream_prefers_build_locations() {
        let stream = TestSource::new("stream", &[&["h1"]])
            .with_dependency(Dependency::Shuffle(shuffle(4)))
            .arc();
        let build = TestSource::new("build", &[&["h2"]]).arc();
        let lineage = stitch(vec![stream], vec![build], false).unwrap();
        assert_eq!(lineage.preferred_locations(0), vec!["h2".to_string()]);
    }

    #[test]
    fn restitching_does_not_duplicate_dependencies() {
        let stream = TestSource::new("stream", &[&["h1"], &["h2"]]).arc();
        let build = TestSource::new("build", &[&["h1"], &["h2"]])
            .with_dependency(Dependency::Shuffle(shuffle(6)))
            .arc();
        let first = stitch(vec![stream], vec![Arc::clone(&build)], false).unwrap();
        let second = stitch(first.stream_sources().to_vec(), vec![build], false).unwrap();
        assert_eq!(shuffle_ids(&second.stream_sources()[0]), vec![6]);
        assert_eq!(
            second.preferred_locations(1),
            first.preferred_locations(1)
        );
    }

    #[test]
    fn mismatched_partition_counts_are_rejected() {
        let stream = TestSource::new("stream", &[&["h1"], &["h2"]]).arc();
        let build = TestSource::new("build", &[&["h1"]]).arc();
        let err = stitch(vec![Arc::clone(&stream)], vec![Arc::clone(&build)], false).unwrap_err();
        assert!(matches!(err, CometError::Planning(_)));
        // a replicated build side is read in full by every task
        assert!(stitch(vec![stream], vec![build], true).is_ok());
        assert!(stitch(vec![], vec![], true).is_err());
    }

    #[test]
    fn refresh_follows_dynamic_sources() {
        let stream = Arc::new(TestSource::new("stream", &[&["h1"]]).dynamic());
        let build = TestSource::new("replicated", &[&["h5"]]).arc();
        let lineage = stitch(
            vec![Arc::clone(&stream) as Arc<dyn PartitionedSource>],
            vec![Arc::clone(&build)],
            true,
        )
        .unwrap();
        assert!(!lineage.is_static());
        assert_eq!(lineage.num_partitions(), 1);

        *stream.locations.lock() = vec![vec!["h8".to_string()], vec!["h9".to_string()]];
        let refreshed = lineage.refresh().unwrap();
        assert_eq!(refreshed.num_partitions(), 2);
        assert_eq!(refreshed.preferred_locations(1), vec!["h9".to_string()]);

        // zipped with a single-partition build side the new layout is invalid
        let zipped = stitch(
            vec![Arc::new(TestSource::new("stream", &[&["h1"]]).dynamic())
                as Arc<dyn PartitionedSource>],
            vec![build],
            false,
        )
        .unwrap();
        assert_eq!(zipped.refresh().unwrap().num_partitions(), 1);
    }

    #[test]
    fn refresh_of_static_lineage_is_identity() {
        let stream = TestSource::new("stream", &[&["h1", "h2"], &["h3"]]).arc();
        let build = TestSource::new("build", &[&["h2"], &["h3", "h4"]]).arc();
        let lineage = stitch(vec![stream], vec![build], false).unwrap();
        let refreshed = lineage.refresh().unwrap();
        for partition in 0..lineage.num_partitions() {
            assert_eq!(
                refreshed.preferred_locations(partition),
                lineage.preferred_locations(partition)
            );
        }
    }
}
