//! Shard partitioning.
//!
//! Splits a filtered test collection into exactly N disjoint, covering shards
//! so an external scheduler can run them on separate channels. Partitioning
//! is a pure function: no I/O, deterministic for a given input order.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::TestIdentity;

/// Result type for sharding operations.
pub type ShardResult<T> = Result<T, ShardError>;

/// Errors that can occur while sharding a collection.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("Shard count must be at least 1")]
    InvalidShardCount,

    #[error("Collection has already been sharded; shards are terminal")]
    AlreadySharded,
}

/// Partitioning granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Whole groups (classes) are assigned to shards atomically.
    #[default]
    Class,
    /// Individual members are spread across shards; shard sizes differ by
    /// at most one.
    Method,
}

/// A unit of partitioning: a named group of tests with a declared runtime
/// estimate. Typically one test class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestGroup {
    /// Fully-qualified group identifier.
    pub identity: String,
    /// Member tests, in declared order.
    pub members: Vec<TestIdentity>,
    /// Declared estimate of this group's total execution time. Used only for
    /// load balancing, never for correctness.
    pub runtime_hint: Duration,
}

impl TestGroup {
    /// Create a group with the given identity and members.
    pub fn new(
        identity: impl Into<String>,
        members: Vec<TestIdentity>,
        runtime_hint: Duration,
    ) -> Self {
        Self {
            identity: identity.into(),
            members,
            runtime_hint,
        }
    }

    /// Number of member tests.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// One partition of a test collection.
///
/// Shards are terminal: there is no operation to subdivide a shard further.
/// An empty shard is a valid, runnable no-op; executing it emits no
/// `run_started` and consumes no attempt budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Zero-based index of this shard.
    pub index: usize,
    /// Total number of shards in the partition.
    pub total_shards: usize,
    /// Groups assigned to this shard, preserving input order.
    pub groups: Vec<TestGroup>,
    /// Proportional share of the collection's runtime hint.
    pub runtime_hint: Duration,
}

impl Shard {
    /// Total number of member tests across all groups.
    pub fn member_count(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    /// Whether this shard holds no tests at all.
    pub fn is_empty(&self) -> bool {
        self.member_count() == 0
    }

    /// Iterate member identities in group order.
    pub fn members(&self) -> impl Iterator<Item = &TestIdentity> {
        self.groups.iter().flat_map(|g| g.members.iter())
    }
}

/// Include/exclude filtering over groups and individual members.
///
/// Filters are applied to the input *before* partitioning, never after; a
/// group emptied by filtering contributes nothing to any shard. Member
/// filters match on the base-name-normalized identity so parameterized
/// variants follow their base test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestFilter {
    /// Group identities to include (empty means all).
    #[serde(default)]
    pub include_groups: Vec<String>,
    /// Group identities to exclude.
    #[serde(default)]
    pub exclude_groups: Vec<String>,
    /// Individual tests to include, as `scope#name` (empty means all).
    #[serde(default)]
    pub include_tests: Vec<String>,
    /// Individual tests to exclude, as `scope#name`.
    #[serde(default)]
    pub exclude_tests: Vec<String>,
}

impl TestFilter {
    /// Whether the filter has no effect.
    pub fn is_empty(&self) -> bool {
        self.include_groups.is_empty()
            && self.exclude_groups.is_empty()
            && self.include_tests.is_empty()
            && self.exclude_tests.is_empty()
    }

    fn member_key(test: &TestIdentity) -> String {
        test.rerun_key().to_string()
    }

    fn admits_group(&self, identity: &str) -> bool {
        if self.exclude_groups.iter().any(|g| g == identity) {
            return false;
        }
        if !self.include_groups.is_empty() {
            return self.include_groups.iter().any(|g| g == identity);
        }
        true
    }

    fn admits_member(&self, test: &TestIdentity) -> bool {
        let key = Self::member_key(test);
        if self.exclude_tests.iter().any(|t| *t == key) {
            return false;
        }
        if !self.include_tests.is_empty() {
            return self.include_tests.iter().any(|t| *t == key);
        }
        true
    }

    /// Apply the filter, dropping emptied groups.
    pub fn apply(&self, groups: Vec<TestGroup>) -> Vec<TestGroup> {
        groups
            .into_iter()
            .filter(|g| self.admits_group(&g.identity))
            .map(|mut g| {
                g.members.retain(|m| self.admits_member(m));
                g
            })
            .filter(|g| !g.is_empty())
            .collect()
    }
}

/// Proportional share of `hint` for `part` members out of `total`.
fn proportional_hint(hint: Duration, part: usize, total: usize) -> Duration {
    if total == 0 {
        return Duration::ZERO;
    }
    let millis = hint.as_millis() * part as u128 / total as u128;
    Duration::from_millis(millis as u64)
}

/// Split `groups` into exactly `shard_count` disjoint, covering shards.
///
/// Class granularity assigns whole groups round-robin by input position
/// (group `i` to shard `i % shard_count`); method granularity flattens all
/// members and assigns them round-robin by position, so shard sizes differ by
/// at most one and the first `total % shard_count` shards carry the extra
/// member. Each shard receives a share of `runtime_hint` proportional to its
/// member count.
pub fn partition(
    groups: &[TestGroup],
    runtime_hint: Duration,
    shard_count: usize,
    granularity: Granularity,
) -> ShardResult<Vec<Shard>> {
    if shard_count == 0 {
        return Err(ShardError::InvalidShardCount);
    }

    let total_members: usize = groups.iter().map(|g| g.len()).sum();

    let assigned: Vec<Vec<TestGroup>> = match granularity {
        Granularity::Class => {
            let mut buckets: Vec<Vec<TestGroup>> = (0..shard_count).map(|_| Vec::new()).collect();
            for (i, group) in groups.iter().enumerate() {
                buckets[i % shard_count].push(group.clone());
            }
            buckets
        }
        Granularity::Method => {
            // Flatten, then deal members round-robin, regrouping by scope so
            // each shard still carries well-formed groups.
            let flattened: Vec<(&TestGroup, &TestIdentity)> = groups
                .iter()
                .flat_map(|g| g.members.iter().map(move |m| (g, m)))
                .collect();

            let mut buckets: Vec<Vec<TestGroup>> = (0..shard_count).map(|_| Vec::new()).collect();
            for (i, (group, member)) in flattened.iter().enumerate() {
                let bucket = &mut buckets[i % shard_count];
                match bucket.last_mut() {
                    Some(last) if last.identity == group.identity => {
                        last.members.push((*member).clone());
                    }
                    _ => {
                        bucket.push(TestGroup::new(
                            group.identity.clone(),
                            vec![(*member).clone()],
                            Duration::ZERO,
                        ));
                    }
                }
            }
            buckets
        }
    };

    Ok(assigned
        .into_iter()
        .enumerate()
        .map(|(index, shard_groups)| {
            let members: usize = shard_groups.iter().map(|g| g.len()).sum();
            Shard {
                index,
                total_shards: shard_count,
                groups: shard_groups,
                runtime_hint: proportional_hint(runtime_hint, members, total_members),
            }
        })
        .collect())
}

/// A filtered test collection that can be sharded exactly once.
///
/// Shards handed out by [`TestCollection::shard`] are terminal; asking an
/// already-sharded collection to shard again is rejected.
#[derive(Debug, Clone)]
pub struct TestCollection {
    groups: Vec<TestGroup>,
    runtime_hint: Duration,
    sharded: bool,
}

impl TestCollection {
    /// Build a collection from groups, applying `filter` up front.
    pub fn new(groups: Vec<TestGroup>, runtime_hint: Duration, filter: &TestFilter) -> Self {
        Self {
            groups: filter.apply(groups),
            runtime_hint,
            sharded: false,
        }
    }

    /// Groups remaining after filtering.
    pub fn groups(&self) -> &[TestGroup] {
        &self.groups
    }

    /// Declared runtime hint for the whole collection.
    pub fn runtime_hint(&self) -> Duration {
        self.runtime_hint
    }

    /// Partition into `shard_count` shards. Fails on a second call.
    pub fn shard(
        &mut self,
        shard_count: usize,
        granularity: Granularity,
    ) -> ShardResult<Vec<Shard>> {
        if self.sharded {
            return Err(ShardError::AlreadySharded);
        }
        let shards = partition(&self.groups, self.runtime_hint, shard_count, granularity)?;
        self.sharded = true;
        Ok(shards)
    }
}
