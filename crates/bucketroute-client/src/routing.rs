//! Single-hop routing algorithms
//!
//! Everything here works on one immutable `RegionMetadata` snapshot plus the
//! region's bucket timeout marks. Nothing blocks and nothing fails because
//! metadata is missing: an unroutable key or bucket is reported back so the
//! caller can use default routing for it.

use crate::bucket_status::BucketStatusTable;
use crate::metadata::RegionMetadata;
use crate::resolver::PartitionResolver;
use bucketroute_common::{BucketId, BucketServerLocation, Error, Result, ServerLocation};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use tracing::debug;

/// Items partitioned by the server they should be sent to
///
/// Every input item lands in exactly one place: one server's set, or
/// `unrouted` when no usable location is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grouping<T: Hash + Eq> {
    /// Items per target server
    pub by_server: HashMap<ServerLocation, HashSet<T>>,
    /// Items that need default routing
    pub unrouted: HashSet<T>,
}

impl<T: Hash + Eq> Default for Grouping<T> {
    fn default() -> Self {
        Self {
            by_server: HashMap::new(),
            unrouted: HashSet::new(),
        }
    }
}

impl<T: Hash + Eq> Grouping<T> {
    /// Number of distinct target servers
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.by_server.len()
    }

    /// Total number of items across all groups
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_server.values().map(HashSet::len).sum::<usize>() + self.unrouted.len()
    }

    /// Whether the grouping holds no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every item has a target server
    #[must_use]
    pub fn is_fully_routed(&self) -> bool {
        self.unrouted.is_empty()
    }

    fn add(&mut self, server: Option<&ServerLocation>, items: impl IntoIterator<Item = T>) {
        match server {
            Some(server) => self
                .by_server
                .entry(server.clone())
                .or_default()
                .extend(items),
            None => self.unrouted.extend(items),
        }
    }
}

/// Routing view over one region snapshot
pub struct Router<'a> {
    metadata: &'a RegionMetadata,
    status: Option<&'a BucketStatusTable>,
    timeout_window_ms: u64,
}

impl<'a> Router<'a> {
    /// Create a router
    ///
    /// `status` holds the region's bucket timeout marks; buckets marked within
    /// the last `timeout_window_ms` avoid their primary.
    #[must_use]
    pub const fn new(
        metadata: &'a RegionMetadata,
        status: Option<&'a BucketStatusTable>,
        timeout_window_ms: u64,
    ) -> Self {
        Self {
            metadata,
            status,
            timeout_window_ms,
        }
    }

    /// Snapshot this router reads from
    #[must_use]
    pub const fn metadata(&self) -> &'a RegionMetadata {
        self.metadata
    }

    /// Resolve a key to its bucket
    pub fn resolve_bucket<K, R>(&self, key: &K, resolver: &R) -> Result<BucketId>
    where
        K: ?Sized,
        R: PartitionResolver<K> + ?Sized,
    {
        let count = self.metadata.bucket_count();
        let bucket = resolver.resolve_bucket(key, count)?;
        if bucket >= count {
            return Err(Error::resolver(format!(
                "resolver returned bucket {bucket} for a region with {count} buckets"
            )));
        }
        Ok(bucket)
    }

    fn is_timed_out(&self, bucket: BucketId) -> bool {
        self.status
            .is_some_and(|status| status.is_timed_out(bucket, self.timeout_window_ms))
    }

    /// Pick the location to use for a bucket
    ///
    /// With `want_primary` this is the primary, or the first secondary while
    /// the bucket is timed out. Otherwise any replica is picked at random,
    /// skipping a timed-out primary.
    #[must_use]
    pub fn locate_bucket(&self, bucket: BucketId, want_primary: bool) -> Option<&'a BucketServerLocation> {
        let locations = self.metadata.locations(bucket);
        let (primary, secondaries) = locations.split_first()?;
        let primary_timed_out = self.is_timed_out(bucket);

        if want_primary {
            return if primary_timed_out {
                secondaries.first()
            } else {
                Some(primary)
            };
        }

        let mut rng = rand::thread_rng();
        if primary_timed_out {
            secondaries.choose(&mut rng)
        } else {
            locations.choose(&mut rng)
        }
    }

    /// Locate the server for a single key
    ///
    /// `Ok(None)` means the bucket is unresolved or has no usable replica.
    pub fn locate<K, R>(&self, key: &K, resolver: &R, want_primary: bool) -> Result<Option<BucketServerLocation>>
    where
        K: ?Sized,
        R: PartitionResolver<K> + ?Sized,
    {
        let bucket = self.resolve_bucket(key, resolver)?;
        Ok(self.locate_bucket(bucket, want_primary).cloned())
    }

    /// Group keys by the bucket they resolve to
    pub fn group_by_bucket<K, R>(
        &self,
        keys: impl IntoIterator<Item = K>,
        resolver: &R,
    ) -> Result<HashMap<BucketId, HashSet<K>>>
    where
        K: Hash + Eq,
        R: PartitionResolver<K> + ?Sized,
    {
        let mut by_bucket: HashMap<BucketId, HashSet<K>> = HashMap::new();
        for key in keys {
            let bucket = self.resolve_bucket(&key, resolver)?;
            by_bucket.entry(bucket).or_default().insert(key);
        }
        Ok(by_bucket)
    }

    /// Partition keys by target server
    ///
    /// Keys are grouped by bucket first, then buckets sharing a server are
    /// merged, so each server is contacted once. Keys whose bucket cannot be
    /// resolved or located go to `unrouted`.
    pub fn group_by_server<K, R>(
        &self,
        keys: impl IntoIterator<Item = K>,
        resolver: &R,
        want_primary: bool,
    ) -> Grouping<K>
    where
        K: Hash + Eq,
        R: PartitionResolver<K> + ?Sized,
    {
        let mut grouping = Grouping::default();
        let mut by_bucket: HashMap<BucketId, HashSet<K>> = HashMap::new();

        for key in keys {
            match self.resolve_bucket(&key, resolver) {
                Ok(bucket) => {
                    by_bucket.entry(bucket).or_default().insert(key);
                }
                Err(e) => {
                    debug!("Key left unrouted: {}", e);
                    grouping.unrouted.insert(key);
                }
            }
        }

        for (bucket, keys) in by_bucket {
            let server = self.locate_bucket(bucket, want_primary).map(|l| &l.location);
            grouping.add(server, keys);
        }

        grouping
    }

    /// Group buckets by the server to send them to
    ///
    /// `None` means every bucket of the region. With `optimize_for_write`
    /// each bucket goes to its primary, otherwise to a random replica.
    #[must_use]
    pub fn group_buckets_by_server(
        &self,
        buckets: Option<&HashSet<BucketId>>,
        optimize_for_write: bool,
    ) -> Grouping<BucketId> {
        let mut grouping = Grouping::default();
        let mut place = |bucket: BucketId| {
            let server = self
                .locate_bucket(bucket, optimize_for_write)
                .map(|l| &l.location);
            grouping.add(server, [bucket]);
        };

        match buckets {
            Some(buckets) => buckets.iter().copied().for_each(&mut place),
            None => (0..self.metadata.bucket_count()).for_each(&mut place),
        }

        grouping
    }

    /// Find a small set of servers that together hold every target bucket
    ///
    /// Any replica may serve a bucket (a timed-out primary is skipped).
    /// Servers are picked greedily by how many still-uncovered buckets they
    /// hold; ties go to the smallest server location.
    #[must_use]
    pub fn cover_buckets(&self, buckets: &HashSet<BucketId>) -> Grouping<BucketId> {
        let mut grouping = Grouping::default();
        let mut holdings: BTreeMap<&ServerLocation, HashSet<BucketId>> = BTreeMap::new();
        let mut remaining = HashSet::with_capacity(buckets.len());

        for &bucket in buckets {
            let locations = self.metadata.locations(bucket);
            let usable = if !locations.is_empty() && self.is_timed_out(bucket) {
                &locations[1..]
            } else {
                locations
            };

            if usable.is_empty() {
                grouping.unrouted.insert(bucket);
                continue;
            }
            for location in usable {
                holdings.entry(&location.location).or_default().insert(bucket);
            }
            remaining.insert(bucket);
        }

        while !remaining.is_empty() {
            let best = holdings
                .iter()
                .map(|(server, held)| (*server, held.intersection(&remaining).count()))
                .filter(|(_, covered)| *covered > 0)
                // Iteration is ascending, so keep the first server on ties
                .fold(None, |best: Option<(&ServerLocation, usize)>, candidate| match best {
                    Some((_, count)) if count >= candidate.1 => best,
                    _ => Some(candidate),
                });
            let Some((server, _)) = best else {
                break;
            };

            let covered: HashSet<BucketId> = holdings[server].intersection(&remaining).copied().collect();
            for bucket in &covered {
                remaining.remove(bucket);
            }
            grouping.add(Some(server), covered);
        }

        grouping.unrouted.extend(remaining);
        grouping
    }
}

/// Restrict a server → buckets map to the target buckets
///
/// Servers left without any target bucket are dropped.
#[must_use]
pub fn prune_servers(
    candidates: &HashMap<ServerLocation, HashSet<BucketId>>,
    target: &HashSet<BucketId>,
) -> HashMap<ServerLocation, HashSet<BucketId>> {
    candidates
        .iter()
        .filter_map(|(server, buckets)| {
            let kept: HashSet<BucketId> = buckets.intersection(target).copied().collect();
            (!kept.is_empty()).then(|| (server.clone(), kept))
        })
        .collect()
}

/// Pick the next server to retry on
///
/// Prefers the server whose buckets overlap least with `tried`, then the
/// one with the most buckets, then the smallest server location. A server
/// whose buckets have all been tried is never returned.
#[must_use]
pub fn next_server(
    server_to_buckets: &HashMap<ServerLocation, HashSet<BucketId>>,
    tried: &HashSet<BucketId>,
) -> Option<ServerLocation> {
    server_to_buckets
        .iter()
        .filter(|(_, buckets)| !buckets.is_subset(tried))
        .map(|(server, buckets)| (server, buckets.len(), buckets.intersection(tried).count()))
        .min_by(|(sa, len_a, overlap_a), (sb, len_b, overlap_b)| {
            overlap_a
                .cmp(overlap_b)
                .then_with(|| len_b.cmp(len_a))
                .then_with(|| sa.cmp(sb))
        })
        .map(|(server, _, _)| server.clone())
}
