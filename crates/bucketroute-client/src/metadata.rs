//! Per-region bucket assignment snapshots

use bucketroute_common::{BucketId, BucketServerLocation, Error, Result, ServerLocation};
use std::collections::HashSet;
use std::sync::Arc;

/// Bucket → server assignment for one partitioned region
///
/// Each resolved bucket has an ordered location list: the primary first,
/// then secondaries in preference order. Values are immutable once built;
/// refreshes produce a new `RegionMetadata`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionMetadata {
    bucket_count: u32,
    buckets: Vec<Option<Arc<[BucketServerLocation]>>>,
}

impl RegionMetadata {
    /// Create metadata with every bucket unresolved
    #[must_use]
    pub fn unresolved(bucket_count: u32) -> Self {
        Self {
            bucket_count,
            buckets: vec![None; bucket_count as usize],
        }
    }

    /// Build metadata from a flat list of bucket locations
    ///
    /// Locations may arrive in any order. Each bucket must have exactly one
    /// primary; secondaries keep the order they were given in. Duplicate
    /// servers for the same bucket are rejected.
    pub fn from_locations(
        region: &str,
        bucket_count: u32,
        locations: impl IntoIterator<Item = BucketServerLocation>,
    ) -> Result<Self> {
        let mut primaries: Vec<Option<BucketServerLocation>> = vec![None; bucket_count as usize];
        let mut secondaries: Vec<Vec<BucketServerLocation>> = vec![Vec::new(); bucket_count as usize];

        for location in locations {
            let bucket = location.bucket_id;
            let Some(index) = usize::try_from(bucket).ok().filter(|&i| i < primaries.len()) else {
                return Err(Error::invalid_metadata(
                    region,
                    format!("bucket {bucket} out of range (bucket count {bucket_count})"),
                ));
            };

            let duplicate = primaries[index]
                .iter()
                .chain(secondaries[index].iter())
                .any(|existing| existing.location == location.location);
            if duplicate {
                return Err(Error::invalid_metadata(
                    region,
                    format!("server {} listed twice for bucket {bucket}", location.location),
                ));
            }

            if location.is_primary {
                if primaries[index].is_some() {
                    return Err(Error::invalid_metadata(
                        region,
                        format!("bucket {bucket} has more than one primary"),
                    ));
                }
                primaries[index] = Some(location);
            } else {
                secondaries[index].push(location);
            }
        }

        let buckets = primaries
            .into_iter()
            .zip(secondaries)
            .enumerate()
            .map(|(bucket, (primary, rest))| match primary {
                Some(primary) => {
                    let mut list = Vec::with_capacity(rest.len() + 1);
                    list.push(primary);
                    list.extend(rest);
                    let list: Arc<[BucketServerLocation]> = Arc::from(list);
                    Ok(Some(list))
                }
                None if rest.is_empty() => Ok(None),
                None => Err(Error::invalid_metadata(
                    region,
                    format!("bucket {bucket} has secondaries but no primary"),
                )),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            bucket_count,
            buckets,
        })
    }

    /// Total number of buckets in the region
    #[must_use]
    pub const fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Locations for a bucket, primary first; empty when unresolved
    #[must_use]
    pub fn locations(&self, bucket: BucketId) -> &[BucketServerLocation] {
        self.entry(bucket).map_or(&[][..], |list| &list[..])
    }

    /// Primary location of a bucket
    #[must_use]
    pub fn primary(&self, bucket: BucketId) -> Option<&BucketServerLocation> {
        self.locations(bucket).first()
    }

    /// Secondary locations of a bucket in preference order
    #[must_use]
    pub fn secondaries(&self, bucket: BucketId) -> &[BucketServerLocation] {
        self.locations(bucket).get(1..).unwrap_or(&[])
    }

    /// Assignment version of a bucket (its primary's version)
    #[must_use]
    pub fn version(&self, bucket: BucketId) -> Option<u64> {
        self.primary(bucket).map(|p| p.version)
    }

    /// Whether a bucket has a known primary
    #[must_use]
    pub fn is_resolved(&self, bucket: BucketId) -> bool {
        self.entry(bucket).is_some()
    }

    /// Number of buckets with a known primary
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.buckets.iter().filter(|b| b.is_some()).count()
    }

    /// Ids of all resolved buckets
    pub fn resolved_buckets(&self) -> impl Iterator<Item = BucketId> + '_ {
        self.buckets
            .iter()
            .zip(0..self.bucket_count)
            .filter_map(|(entry, bucket)| entry.as_ref().map(|_| bucket))
    }

    /// Every distinct server named in this snapshot
    #[must_use]
    pub fn servers(&self) -> HashSet<ServerLocation> {
        self.buckets
            .iter()
            .flatten()
            .flat_map(|list| list.iter().map(|l| l.location.clone()))
            .collect()
    }

    /// Whether a server holds any copy in this snapshot
    #[must_use]
    pub fn contains_server(&self, server: &ServerLocation) -> bool {
        self.buckets
            .iter()
            .flatten()
            .any(|list| list.iter().any(|l| &l.location == server))
    }

    pub(crate) fn entry(&self, bucket: BucketId) -> Option<&Arc<[BucketServerLocation]>> {
        self.buckets.get(usize::try_from(bucket).ok()?)?.as_ref()
    }

    pub(crate) fn from_entries(
        bucket_count: u32,
        buckets: Vec<Option<Arc<[BucketServerLocation]>>>,
    ) -> Self {
        debug_assert_eq!(buckets.len(), bucket_count as usize);
        Self {
            bucket_count,
            buckets,
        }
    }

    /// Copy of this snapshot with a server removed
    ///
    /// Buckets whose primary lived on the server become unresolved.
    /// Returns `None` when the server is not part of the snapshot.
    #[must_use]
    pub fn without_server(&self, server: &ServerLocation) -> Option<Self> {
        if !self.contains_server(server) {
            return None;
        }

        let buckets = self
            .buckets
            .iter()
            .map(|entry| {
                let list = entry.as_ref()?;
                if list.iter().all(|l| &l.location != server) {
                    return Some(Arc::clone(list));
                }
                if &list[0].location == server {
                    return None;
                }
                let kept: Arc<[BucketServerLocation]> =
                    list.iter().filter(|l| &l.location != server).cloned().collect();
                Some(kept)
            })
            .collect();

        Some(Self::from_entries(self.bucket_count, buckets))
    }
}
