//! Region metadata store
//!
//! Holds the currently published `RegionMetadata` snapshot of every region.
//! Readers clone an `Arc` under a short read lock and never observe a
//! partially updated snapshot. Publishing merges per bucket by version so a
//! late, older response cannot overwrite fresher routing data.

use crate::metadata::RegionMetadata;
use bucketroute_common::{BucketId, Error, Result, ServerLocation};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a publish changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Buckets whose location list was replaced
    pub updated: Vec<BucketId>,
    /// Buckets dropped because the incoming version was older
    pub stale: Vec<BucketId>,
    /// Buckets whose primary server changed
    pub primary_changed: Vec<BucketId>,
}

impl PublishOutcome {
    /// Whether the store was left untouched
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty()
    }
}

#[derive(Default)]
struct StoreState {
    snapshots: HashMap<String, Arc<RegionMetadata>>,
    /// Bucket count each open region was declared with
    declared: HashMap<String, u32>,
    /// Last version of buckets whose primary was evicted
    version_floors: HashMap<String, HashMap<BucketId, u64>>,
    closed: HashSet<String>,
}

/// Published metadata snapshots keyed by region full path
#[derive(Default)]
pub struct RegionMetadataStore {
    state: RwLock<StoreState>,
}

impl RegionMetadataStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently published snapshot for a region
    #[must_use]
    pub fn get(&self, region: &str) -> Option<Arc<RegionMetadata>> {
        self.state.read().snapshots.get(region).cloned()
    }

    /// Paths of all regions with a published snapshot
    #[must_use]
    pub fn regions(&self) -> Vec<String> {
        self.state.read().snapshots.keys().cloned().collect()
    }

    /// Publish a freshly fetched snapshot
    ///
    /// Per bucket, the incoming locations replace the current ones only when
    /// the bucket is currently unresolved or the incoming version is strictly
    /// newer. Buckets the incoming snapshot leaves unresolved keep their
    /// current locations. A bucket left unresolved by an eviction only
    /// accepts a version at least as new as the evicted one.
    ///
    /// The bucket count must match the count the region was opened with, or
    /// the current snapshot's when the region was never opened.
    pub fn publish(&self, region: &str, incoming: RegionMetadata) -> Result<PublishOutcome> {
        let mut state = self.state.write();

        if state.closed.contains(region) {
            return Err(Error::RegionNotFound(region.to_string()));
        }

        let expected = state
            .declared
            .get(region)
            .copied()
            .or_else(|| state.snapshots.get(region).map(|s| s.bucket_count()));
        if let Some(expected) = expected {
            if expected != incoming.bucket_count() {
                return Err(Error::BucketCountMismatch {
                    region: region.to_string(),
                    expected,
                    actual: incoming.bucket_count(),
                });
            }
        }

        let Some(current) = state.snapshots.get(region).cloned() else {
            let outcome = PublishOutcome {
                updated: incoming.resolved_buckets().collect(),
                stale: Vec::new(),
                primary_changed: incoming.resolved_buckets().collect(),
            };
            debug!(
                "Installed first metadata for region {} ({} of {} buckets resolved)",
                region,
                outcome.updated.len(),
                incoming.bucket_count()
            );
            state.snapshots.insert(region.to_string(), Arc::new(incoming));
            return Ok(outcome);
        };

        let floors = state.version_floors.get(region);
        let mut outcome = PublishOutcome::default();
        let merged = (0..current.bucket_count())
            .map(|bucket| {
                let existing = current.entry(bucket);
                let Some(fresh) = incoming.entry(bucket) else {
                    return existing.cloned();
                };
                let Some(existing) = existing else {
                    let floor = floors.and_then(|f| f.get(&bucket)).copied();
                    if floor.is_some_and(|floor| fresh[0].version < floor) {
                        outcome.stale.push(bucket);
                        return None;
                    }
                    outcome.updated.push(bucket);
                    outcome.primary_changed.push(bucket);
                    return Some(Arc::clone(fresh));
                };

                let (old_version, new_version) = (existing[0].version, fresh[0].version);
                if new_version > old_version {
                    outcome.updated.push(bucket);
                    if existing[0].location != fresh[0].location {
                        outcome.primary_changed.push(bucket);
                    }
                    Some(Arc::clone(fresh))
                } else {
                    if new_version < old_version {
                        outcome.stale.push(bucket);
                    }
                    Some(Arc::clone(existing))
                }
            })
            .collect();

        if !outcome.stale.is_empty() {
            warn!(
                "Dropped stale metadata for {} buckets of region {}",
                outcome.stale.len(),
                region
            );
        }

        if !outcome.is_noop() {
            let drained = state.version_floors.get_mut(region).is_some_and(|floors| {
                for bucket in &outcome.updated {
                    floors.remove(bucket);
                }
                floors.is_empty()
            });
            if drained {
                state.version_floors.remove(region);
            }

            let snapshot = RegionMetadata::from_entries(current.bucket_count(), merged);
            state.snapshots.insert(region.to_string(), Arc::new(snapshot));
            debug!(
                "Published metadata for region {} ({} buckets updated)",
                region,
                outcome.updated.len()
            );
        }

        Ok(outcome)
    }

    /// Remove a region's snapshot so the next lookup triggers a fresh fetch
    pub fn invalidate(&self, region: &str) -> bool {
        let mut state = self.state.write();
        state.version_floors.remove(region);
        let removed = state.snapshots.remove(region).is_some();
        if removed {
            debug!("Invalidated metadata for region {}", region);
        }
        removed
    }

    /// Forget a closed region and reject later publishes for it
    pub fn close_region(&self, region: &str) {
        let mut state = self.state.write();
        state.snapshots.remove(region);
        state.declared.remove(region);
        state.version_floors.remove(region);
        state.closed.insert(region.to_string());
    }

    /// Open a region with its declared bucket count
    ///
    /// Clears a close tombstone. A snapshot sized for a different bucket
    /// count is dropped.
    pub fn open_region(&self, region: &str, bucket_count: u32) {
        let mut state = self.state.write();
        state.closed.remove(region);
        state.declared.insert(region.to_string(), bucket_count);

        let resized = state
            .snapshots
            .get(region)
            .is_some_and(|s| s.bucket_count() != bucket_count);
        if resized {
            state.snapshots.remove(region);
            state.version_floors.remove(region);
            debug!(
                "Dropped metadata for region {} after bucket count changed to {}",
                region, bucket_count
            );
        }
    }

    /// Remove a server from every snapshot
    ///
    /// Buckets whose primary was on the server become unresolved but keep
    /// their last version as a floor for later publishes. Returns the
    /// regions whose snapshot changed.
    pub fn evict_server(&self, server: &ServerLocation) -> Vec<String> {
        let mut state = self.state.write();
        let StoreState {
            snapshots,
            version_floors,
            ..
        } = &mut *state;
        let mut affected = Vec::new();

        for (region, snapshot) in snapshots.iter_mut() {
            let Some(pruned) = snapshot.without_server(server) else {
                continue;
            };
            for bucket in snapshot.resolved_buckets().filter(|&b| !pruned.is_resolved(b)) {
                if let Some(version) = snapshot.version(bucket) {
                    version_floors
                        .entry(region.clone())
                        .or_default()
                        .insert(bucket, version);
                }
            }
            *snapshot = Arc::new(pruned);
            affected.push(region.clone());
        }

        if !affected.is_empty() {
            info!("Evicted server {} from {} regions", server, affected.len());
        }
        affected
    }
}
