//! Client metadata service
//!
//! The facade the operation dispatcher talks to. It owns the metadata store,
//! the bucket status tables and the refresh worker, and answers routing
//! questions from whatever snapshot is currently published. A missing or
//! incomplete snapshot is never an error: the call enqueues a refresh and
//! returns the "use default routing" result straight away.

use crate::bucket_status::{BucketStatusRegistry, BucketStatusTable};
use crate::clock::{Clock, SystemClock};
use crate::metadata::RegionMetadata;
use crate::refresh::RefreshScheduler;
use crate::resolver::PartitionResolver;
use crate::routing::{Grouping, Router};
use crate::stats::{RoutingStats, RoutingStatsSnapshot};
use crate::store::RegionMetadataStore;
use crate::transport::MetadataFetcher;
use bucketroute_common::config::MetadataConfig;
use bucketroute_common::{BucketId, Error, Result, ServerLocation};
use dashmap::DashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A region as declared by the region layer at first contact
struct RegionEntry<K: ?Sized> {
    bucket_count: u32,
    resolver: Arc<dyn PartitionResolver<K>>,
}

/// Everything a routing call needs, captured once per call
struct RoutingView<K: ?Sized> {
    metadata: Arc<RegionMetadata>,
    status: Arc<BucketStatusTable>,
    resolver: Arc<dyn PartitionResolver<K>>,
}

impl<K: ?Sized> RoutingView<K> {
    fn router(&self, timeout_window_ms: u64) -> Router<'_> {
        Router::new(&self.metadata, Some(self.status.as_ref()), timeout_window_ms)
    }
}

/// Single-hop metadata service for one client
///
/// Generic over the key type routed through it. The service owns its
/// refresh worker; dropping it stops the worker.
pub struct ClientMetadataService<K: ?Sized> {
    config: MetadataConfig,
    store: Arc<RegionMetadataStore>,
    status: Arc<BucketStatusRegistry>,
    scheduler: RefreshScheduler,
    stats: Arc<RoutingStats>,
    regions: DashMap<String, RegionEntry<K>>,
}

impl<K: ?Sized> ClientMetadataService<K> {
    /// Create a service using the system clock
    #[must_use]
    pub fn new(config: MetadataConfig, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self::with_clock(config, fetcher, Arc::new(SystemClock))
    }

    /// Create a service with an explicit clock for bucket timeouts
    #[must_use]
    pub fn with_clock(
        config: MetadataConfig,
        fetcher: Arc<dyn MetadataFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(RegionMetadataStore::new());
        let status = Arc::new(BucketStatusRegistry::new(clock));
        let stats = Arc::new(RoutingStats::default());
        let scheduler = RefreshScheduler::new(
            &config,
            fetcher,
            Arc::clone(&store),
            Arc::clone(&status),
            Arc::clone(&stats),
        );

        Self {
            config,
            store,
            status,
            scheduler,
            stats,
            regions: DashMap::new(),
        }
    }

    /// Start the refresh worker
    pub fn start(&self) -> Result<()> {
        self.scheduler.start()?;
        info!(
            "Client metadata service started (single-hop {})",
            if self.config.single_hop_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Stop the refresh worker, waiting for an in-flight fetch to finish
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Service configuration
    #[must_use]
    pub const fn config(&self) -> &MetadataConfig {
        &self.config
    }

    /// Register a partitioned region
    ///
    /// The bucket count is fixed from here on: fetched metadata with a
    /// different count is rejected. Registering again replaces the resolver,
    /// and a changed bucket count drops the current snapshot.
    pub fn register_region(
        &self,
        path: &str,
        bucket_count: u32,
        resolver: Arc<dyn PartitionResolver<K>>,
    ) -> Result<()> {
        if bucket_count == 0 {
            return Err(Error::Configuration(format!(
                "region {path} must have at least one bucket"
            )));
        }

        self.store.open_region(path, bucket_count);
        self.status.table_or_create(path, bucket_count);
        self.regions.insert(
            path.to_string(),
            RegionEntry {
                bucket_count,
                resolver,
            },
        );

        info!("Registered region {} with {} buckets", path, bucket_count);
        Ok(())
    }

    /// Drop all state for a closed region
    ///
    /// A fetch for the region that is still in flight is discarded when it
    /// completes. Returns whether the region was registered.
    pub fn close_region(&self, path: &str) -> bool {
        let registered = self.regions.remove(path).is_some();
        self.store.close_region(path);
        self.status.remove(path);
        if registered {
            info!("Closed region {}", path);
        }
        registered
    }

    /// Currently published snapshot for a region
    #[must_use]
    pub fn metadata(&self, path: &str) -> Option<Arc<RegionMetadata>> {
        self.store.get(path)
    }

    /// Wait until no refresh of a region is pending, then return its snapshot
    ///
    /// Meant for tools and tests; routing calls never wait. Gives up when
    /// the timeout elapses or the service stops.
    pub fn wait_for_metadata(&self, path: &str, timeout: Duration) -> Option<Arc<RegionMetadata>> {
        let completions = self.scheduler.completions();
        let deadline = Instant::now() + timeout;
        while self.scheduler.is_pending(path) {
            if completions.recv_deadline(deadline).is_err() {
                break;
            }
        }
        self.store.get(path)
    }

    fn region(&self, path: &str) -> Result<(u32, Arc<dyn PartitionResolver<K>>)> {
        self.regions
            .get(path)
            .map(|entry| (entry.bucket_count, Arc::clone(&entry.resolver)))
            .ok_or_else(|| Error::RegionNotFound(path.to_string()))
    }

    /// Snapshot, status table and resolver for a routing call
    ///
    /// `None` means the caller should use default routing; a refresh has
    /// already been requested when metadata is missing.
    fn routing_view(&self, path: &str) -> Result<Option<RoutingView<K>>> {
        let (bucket_count, resolver) = self.region(path)?;
        if !self.config.single_hop_enabled {
            return Ok(self.fallback());
        }

        let Some(metadata) = self.store.get(path) else {
            debug!("No metadata for region {}, using default routing", path);
            self.enqueue_refresh(path);
            return Ok(self.fallback());
        };

        let status = self.status.table_or_create(path, bucket_count);
        Ok(Some(RoutingView {
            metadata,
            status,
            resolver,
        }))
    }

    fn fallback<T>(&self) -> Option<T> {
        RoutingStats::incr(&self.stats.fallbacks);
        None
    }

    /// Request a refresh when a routing call hit an unresolved bucket
    fn refresh_if_incomplete(&self, path: &str, metadata: &RegionMetadata) {
        if metadata.resolved_count() < metadata.bucket_count() as usize {
            self.enqueue_refresh(path);
        }
    }

    fn locate_with(&self, path: &str, key: &K, want_primary: bool) -> Result<Option<ServerLocation>> {
        let Some(view) = self.routing_view(path)? else {
            return Ok(None);
        };
        let router = view.router(self.config.bucket_timeout_ms);

        let bucket = match router.resolve_bucket(key, view.resolver.as_ref()) {
            Ok(bucket) => bucket,
            Err(e) => {
                debug!("Cannot resolve key for region {}: {}", path, e);
                return Ok(self.fallback());
            }
        };

        match router.locate_bucket(bucket, want_primary) {
            Some(location) => {
                RoutingStats::incr(&self.stats.single_hop_routes);
                Ok(Some(location.location.clone()))
            }
            None => {
                if !view.metadata.is_resolved(bucket) {
                    debug!("Bucket {} of region {} is unresolved", bucket, path);
                    self.enqueue_refresh(path);
                }
                Ok(self.fallback())
            }
        }
    }

    /// Server to send a single-key write or primary read to
    ///
    /// `Ok(None)` means use default routing. Fails only for a region that is
    /// not registered.
    pub fn locate(&self, path: &str, key: &K) -> Result<Option<ServerLocation>> {
        self.locate_with(path, key, true)
    }

    /// Any replica holding the key, for reads that tolerate secondaries
    pub fn locate_replica(&self, path: &str, key: &K) -> Result<Option<ServerLocation>> {
        self.locate_with(path, key, false)
    }

    /// Mark a bucket's primary as timed out
    ///
    /// Returns `true` if the bucket was not already marked.
    pub fn mark_bucket_timed_out(&self, path: &str, bucket: BucketId) -> Result<bool> {
        let (bucket_count, _) = self.region(path)?;
        let marked = self
            .status
            .table_or_create(path, bucket_count)
            .mark_timed_out(bucket);
        if marked {
            RoutingStats::incr(&self.stats.buckets_timed_out);
            debug!("Bucket {} of region {} marked timed out", bucket, path);
        }
        Ok(marked)
    }

    /// Whether a bucket is inside its timeout window
    ///
    /// A bucket whose window has elapsed is reset by this call.
    pub fn is_bucket_timed_out(&self, path: &str, bucket: BucketId, window_ms: u64) -> Result<bool> {
        self.region(path)?;
        Ok(self
            .status
            .table(path)
            .is_some_and(|table| table.is_timed_out(bucket, window_ms)))
    }

    /// Record that the primary for `key` failed and pick where to retry
    ///
    /// Marks the key's bucket timed out and returns the secondary to use,
    /// or `None` when none is known.
    pub fn fail_over(&self, path: &str, key: &K) -> Result<Option<ServerLocation>> {
        let (bucket_count, resolver) = self.region(path)?;
        match resolver.resolve_bucket(key, bucket_count) {
            Ok(bucket) if bucket < bucket_count => {
                self.mark_bucket_timed_out(path, bucket)?;
            }
            Ok(bucket) => {
                debug!("Resolver returned bucket {} outside region {}", bucket, path);
                return Ok(self.fallback());
            }
            Err(e) => {
                debug!("Cannot resolve key for region {}: {}", path, e);
                return Ok(self.fallback());
            }
        }
        self.locate(path, key)
    }

    /// Request a metadata refresh for a region
    ///
    /// Returns `false` if the region is not registered or the request was
    /// deduplicated or dropped.
    pub fn enqueue_refresh(&self, path: &str) -> bool {
        if !self.config.single_hop_enabled {
            return false;
        }
        if !self.regions.contains_key(path) {
            debug!("Ignoring refresh of unregistered region {}", path);
            return false;
        }
        self.scheduler.enqueue(path)
    }

    /// Remove a failed server from every snapshot
    ///
    /// Each affected region gets a refresh. Returns the affected regions.
    pub fn evict_server(&self, server: &ServerLocation) -> Vec<String> {
        let affected = self.store.evict_server(server);
        if !affected.is_empty() {
            RoutingStats::incr(&self.stats.servers_evicted);
            for region in &affected {
                self.enqueue_refresh(region);
            }
        }
        affected
    }

    /// A server reported the version it holds for a bucket
    ///
    /// When that version is newer than the snapshot's (or the bucket is not
    /// known at all) a refresh is requested. Returns whether it was.
    pub fn observe_bucket_version(&self, path: &str, bucket: BucketId, version: u64) -> bool {
        if !self.regions.contains_key(path) {
            return false;
        }
        let outdated = self
            .store
            .get(path)
            .is_none_or(|metadata| metadata.version(bucket).is_none_or(|known| known < version));
        if outdated {
            debug!(
                "Region {} bucket {} is at version {}, refreshing",
                path, bucket, version
            );
            self.enqueue_refresh(path);
        }
        outdated
    }

    /// Routing counters
    #[must_use]
    pub fn stats(&self) -> RoutingStatsSnapshot {
        self.stats.snapshot()
    }
}

impl<K: Hash + Eq> ClientMetadataService<K> {
    /// Partition keys by the primary server that owns them
    ///
    /// `Ok(None)` means no metadata is available yet. Keys that cannot be
    /// routed individually end up in the grouping's `unrouted` set.
    pub fn group_by_server(
        &self,
        path: &str,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Option<Grouping<K>>> {
        let Some(view) = self.routing_view(path)? else {
            return Ok(None);
        };
        let grouping = view
            .router(self.config.bucket_timeout_ms)
            .group_by_server(keys, view.resolver.as_ref(), true);

        if !grouping.is_fully_routed() {
            self.refresh_if_incomplete(path, &view.metadata);
        }
        RoutingStats::incr(&self.stats.single_hop_routes);
        Ok(Some(grouping))
    }
}

impl<K: ?Sized> ClientMetadataService<K> {
    /// Group buckets by the server to send them to
    ///
    /// `buckets == None` selects every bucket of the region.
    pub fn group_buckets_by_server(
        &self,
        path: &str,
        buckets: Option<&HashSet<BucketId>>,
        optimize_for_write: bool,
    ) -> Result<Option<Grouping<BucketId>>> {
        let Some(view) = self.routing_view(path)? else {
            return Ok(None);
        };
        let grouping = view
            .router(self.config.bucket_timeout_ms)
            .group_buckets_by_server(buckets, optimize_for_write);

        if !grouping.is_fully_routed() {
            self.refresh_if_incomplete(path, &view.metadata);
        }
        RoutingStats::incr(&self.stats.single_hop_routes);
        Ok(Some(grouping))
    }

    /// Fewest servers that together hold the given buckets
    pub fn cover_buckets(&self, path: &str, buckets: &HashSet<BucketId>) -> Result<Option<Grouping<BucketId>>> {
        let Some(view) = self.routing_view(path)? else {
            return Ok(None);
        };
        let grouping = view
            .router(self.config.bucket_timeout_ms)
            .cover_buckets(buckets);

        if !grouping.is_fully_routed() {
            self.refresh_if_incomplete(path, &view.metadata);
        }
        RoutingStats::incr(&self.stats.single_hop_routes);
        Ok(Some(grouping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resolver::{FnResolver, HashPartitionResolver};
    use crate::transport::StaticFetcher;
    use bucketroute_common::BucketServerLocation;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    const REGION: &str = "/orders";

    fn server(name: &str) -> ServerLocation {
        ServerLocation::new(name, 40404)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Keys are bucket ids
    fn identity_resolver() -> Arc<dyn PartitionResolver<u32>> {
        Arc::new(FnResolver::new(|key: &u32, _count: u32| Ok(*key)))
    }

    /// `(bucket, version, primary, secondaries)` per resolved bucket
    fn layout(bucket_count: u32, buckets: &[(BucketId, u64, &str, &[&str])]) -> RegionMetadata {
        let mut locations = Vec::new();
        for &(bucket, version, primary, secondaries) in buckets {
            locations.push(BucketServerLocation::primary(server(primary), bucket, version));
            for s in secondaries {
                locations.push(BucketServerLocation::secondary(server(s), bucket, version));
            }
        }
        RegionMetadata::from_locations(REGION, bucket_count, locations).unwrap()
    }

    struct Fixture {
        service: ClientMetadataService<u32>,
        fetcher: Arc<StaticFetcher>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: MetadataConfig, metadata: Option<RegionMetadata>) -> Fixture {
        let fetcher = Arc::new(StaticFetcher::new());
        if let Some(metadata) = metadata {
            fetcher.insert(REGION, metadata);
        }
        let clock = Arc::new(ManualClock::new(1_000_000));
        let service = ClientMetadataService::with_clock(config, fetcher.clone(), clock.clone());
        Fixture {
            service,
            fetcher,
            clock,
        }
    }

    fn started(metadata: RegionMetadata) -> Fixture {
        let f = fixture(MetadataConfig::default(), Some(metadata));
        f.service
            .register_region(REGION, 4, identity_resolver())
            .unwrap();
        f.service.start().unwrap();
        f.service.enqueue_refresh(REGION);
        assert!(f.service.wait_for_metadata(REGION, Duration::from_secs(5)).is_some());
        f
    }

    #[test]
    fn test_metadata_absent_until_first_fetch() {
        let f = fixture(
            MetadataConfig::default(),
            Some(layout(4, &[(0, 1, "A", &[]), (1, 1, "B", &[])])),
        );
        f.service
            .register_region(REGION, 4, identity_resolver())
            .unwrap();
        assert!(f.service.metadata(REGION).is_none());

        // Miss falls back and requests a refresh
        assert_eq!(f.service.locate(REGION, &0).unwrap(), None);
        assert_eq!(f.service.stats().fallbacks, 1);
        assert_eq!(f.service.stats().refreshes_enqueued, 1);

        f.service.start().unwrap();
        let metadata = f.service.wait_for_metadata(REGION, Duration::from_secs(5)).unwrap();
        assert_eq!(metadata.bucket_count(), 4);
        assert_eq!(f.fetcher.fetch_count(), 1);

        assert_eq!(f.service.locate(REGION, &0).unwrap(), Some(server("A")));
        assert_eq!(f.service.locate(REGION, &1).unwrap(), Some(server("B")));
        assert_eq!(f.service.stats().single_hop_routes, 2);
    }

    #[test]
    fn test_unresolved_bucket_falls_back_and_refreshes() {
        let f = started(layout(4, &[(0, 1, "A", &[])]));
        let before = f.fetcher.fetch_count();

        assert_eq!(f.service.locate(REGION, &3).unwrap(), None);
        assert!(wait_until(|| f.fetcher.fetch_count() > before));
    }

    #[test]
    fn test_unregistered_and_closed_regions() {
        let f = started(layout(4, &[(0, 1, "A", &[])]));

        let err = f.service.locate("/missing", &0).unwrap_err();
        assert!(err.is_not_found());
        assert!(f.service.mark_bucket_timed_out("/missing", 0).is_err());
        assert!(f.service.group_by_server("/missing", vec![1]).is_err());

        assert!(f.service.close_region(REGION));
        assert!(!f.service.close_region(REGION));
        assert!(f.service.metadata(REGION).is_none());
        assert!(matches!(
            f.service.locate(REGION, &0),
            Err(Error::RegionNotFound(_))
        ));

        // Closed and unknown regions never reach the fetcher
        let fetches = f.fetcher.fetch_count();
        let enqueued = f.service.stats().refreshes_enqueued;
        assert!(!f.service.enqueue_refresh(REGION));
        assert!(!f.service.enqueue_refresh("/never-registered"));
        assert!(!f.service.observe_bucket_version(REGION, 0, 9));
        assert!(!f.service.observe_bucket_version("/never-registered", 0, 9));
        assert!(f.service.evict_server(&server("A")).is_empty());
        assert_eq!(f.service.stats().refreshes_enqueued, enqueued);
        assert_eq!(f.fetcher.fetch_count(), fetches);
        assert!(f.service.metadata(REGION).is_none());
    }

    #[test]
    fn test_close_during_fetch_discards_result() {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let fetcher = move |_: &str| -> Result<RegionMetadata> {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Ok(layout(4, &[(0, 1, "A", &[])]))
        };
        let service = ClientMetadataService::<u32>::new(MetadataConfig::default(), Arc::new(fetcher));
        service
            .register_region(REGION, 4, identity_resolver())
            .unwrap();
        service.start().unwrap();

        assert!(service.enqueue_refresh(REGION));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(service.close_region(REGION));

        let completions = service.scheduler.completions();
        release_tx.send(()).unwrap();
        assert_eq!(completions.recv_timeout(Duration::from_secs(5)).unwrap(), REGION);
        assert!(service.metadata(REGION).is_none());
    }

    #[test]
    fn test_fetched_bucket_count_must_match_registration() {
        let f = fixture(
            MetadataConfig::default(),
            Some(layout(8, &[(1, 1, "A", &["B"])])),
        );
        f.service
            .register_region(REGION, 4, identity_resolver())
            .unwrap();
        f.service.start().unwrap();

        // Wrong-sized metadata is never installed
        assert!(f.service.enqueue_refresh(REGION));
        assert!(f.service.wait_for_metadata(REGION, Duration::from_secs(5)).is_none());
        assert_eq!(f.service.stats().fetch_successes, 1);

        f.fetcher.insert(REGION, layout(4, &[(1, 1, "A", &["B"])]));
        assert!(f.service.enqueue_refresh(REGION));
        let metadata = f.service.wait_for_metadata(REGION, Duration::from_secs(5)).unwrap();
        assert_eq!(metadata.bucket_count(), 4);

        assert!(f.service.mark_bucket_timed_out(REGION, 1).unwrap());
        assert_eq!(f.service.locate(REGION, &1).unwrap(), Some(server("B")));

        // A later wrong-sized fetch keeps the snapshot and the timeout mark
        f.fetcher.insert(REGION, layout(8, &[(1, 2, "C", &[])]));
        assert!(f.service.enqueue_refresh(REGION));
        let metadata = f.service.wait_for_metadata(REGION, Duration::from_secs(5)).unwrap();
        assert_eq!(metadata.bucket_count(), 4);
        assert_eq!(metadata.version(1), Some(1));

        assert_eq!(f.service.locate(REGION, &1).unwrap(), Some(server("B")));
        assert!(f.service.is_bucket_timed_out(REGION, 1, 5_000).unwrap());
        assert_eq!(f.service.fail_over(REGION, &1).unwrap(), Some(server("B")));
    }

    #[test]
    fn test_single_hop_disabled_always_falls_back() {
        let config = MetadataConfig {
            single_hop_enabled: false,
            ..MetadataConfig::default()
        };
        let f = fixture(config, Some(layout(4, &[(0, 1, "A", &[])])));
        f.service
            .register_region(REGION, 4, identity_resolver())
            .unwrap();
        f.service.start().unwrap();

        assert_eq!(f.service.locate(REGION, &0).unwrap(), None);
        assert!(f.service.group_by_server(REGION, vec![0, 1]).unwrap().is_none());
        assert!(!f.service.enqueue_refresh(REGION));
        assert_eq!(f.fetcher.fetch_count(), 0);
    }

    #[test]
    fn test_group_by_server_single_owner() {
        let f = started(layout(
            4,
            &[(0, 1, "A", &[]), (1, 1, "A", &[]), (2, 1, "A", &[]), (3, 1, "A", &[])],
        ));

        let grouping = f
            .service
            .group_by_server(REGION, vec![0, 1, 2, 3])
            .unwrap()
            .unwrap();
        assert_eq!(grouping.server_count(), 1);
        assert_eq!(grouping.by_server[&server("A")], [0, 1, 2, 3].into_iter().collect());
        assert!(grouping.is_fully_routed());
    }

    #[test]
    fn test_group_by_server_with_hash_resolver() {
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher.insert(
            REGION,
            layout(4, &[(0, 1, "A", &[]), (1, 1, "B", &[]), (2, 1, "A", &[]), (3, 1, "C", &[])]),
        );
        let service: ClientMetadataService<String> =
            ClientMetadataService::new(MetadataConfig::default(), fetcher);
        service
            .register_region(REGION, 4, Arc::new(HashPartitionResolver::default()))
            .unwrap();
        service.start().unwrap();
        service.enqueue_refresh(REGION);
        service.wait_for_metadata(REGION, Duration::from_secs(5)).unwrap();

        let keys: HashSet<String> = (0..100).map(|i| format!("order-{i}")).collect();
        let grouping = service
            .group_by_server(REGION, keys.iter().cloned())
            .unwrap()
            .unwrap();

        let mut seen = HashSet::new();
        for group in grouping.by_server.values() {
            for key in group {
                assert!(seen.insert(key.clone()));
            }
        }
        assert_eq!(seen, keys);
        assert!(grouping.server_count() <= 3);

        let key = "order-7".to_string();
        let owner = service.locate(REGION, &key).unwrap().unwrap();
        assert!(grouping.by_server[&owner].contains(&key));
    }

    #[test]
    fn test_timeout_window() {
        let f = started(layout(4, &[(2, 1, "A", &["B"])]));

        assert!(f.service.mark_bucket_timed_out(REGION, 2).unwrap());
        assert!(!f.service.mark_bucket_timed_out(REGION, 2).unwrap());
        assert!(f.service.is_bucket_timed_out(REGION, 2, 5_000).unwrap());

        f.clock.advance(Duration::from_millis(5_001));
        assert!(!f.service.is_bucket_timed_out(REGION, 2, 5_000).unwrap());
        assert!(!f.service.is_bucket_timed_out(REGION, 2, 5_000).unwrap());
        assert_eq!(f.service.stats().buckets_timed_out, 1);
    }

    #[test]
    fn test_timed_out_primary_routes_to_secondary() {
        let f = started(layout(4, &[(2, 1, "A", &["B", "C"])]));
        assert_eq!(f.service.locate(REGION, &2).unwrap(), Some(server("A")));

        f.service.mark_bucket_timed_out(REGION, 2).unwrap();
        assert_eq!(f.service.locate(REGION, &2).unwrap(), Some(server("B")));

        f.clock.advance(Duration::from_millis(5_001));
        assert_eq!(f.service.locate(REGION, &2).unwrap(), Some(server("A")));
    }

    #[test]
    fn test_fail_over() {
        let f = started(layout(4, &[(1, 1, "A", &["B"]), (3, 1, "C", &[])]));

        assert_eq!(f.service.fail_over(REGION, &1).unwrap(), Some(server("B")));
        assert!(f.service.is_bucket_timed_out(REGION, 1, 5_000).unwrap());
        // No secondary to retry on
        assert_eq!(f.service.fail_over(REGION, &3).unwrap(), None);
        // Out-of-range key
        assert_eq!(f.service.fail_over(REGION, &9).unwrap(), None);
    }

    #[test]
    fn test_resolver_failure_falls_back() {
        let f = started(layout(4, &[(0, 1, "A", &[])]));
        f.service
            .register_region(
                REGION,
                4,
                Arc::new(FnResolver::new(|_: &u32, _: u32| Err(Error::resolver("no routing object")))),
            )
            .unwrap();

        assert_eq!(f.service.locate(REGION, &0).unwrap(), None);
        let grouping = f.service.group_by_server(REGION, vec![0, 1]).unwrap().unwrap();
        assert_eq!(grouping.unrouted.len(), 2);
    }

    #[test]
    fn test_register_region_validation() {
        let f = fixture(MetadataConfig::default(), None);
        assert!(matches!(
            f.service.register_region(REGION, 0, identity_resolver()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_evict_server_then_refresh() {
        let f = started(layout(4, &[(0, 1, "A", &["B"]), (1, 1, "B", &[])]));
        assert_eq!(f.service.locate(REGION, &0).unwrap(), Some(server("A")));

        f.fetcher
            .insert(REGION, layout(4, &[(0, 2, "B", &[]), (1, 1, "B", &[])]));
        let affected = f.service.evict_server(&server("A"));
        assert_eq!(affected, vec![REGION.to_string()]);
        assert_eq!(f.service.stats().servers_evicted, 1);

        assert!(wait_until(|| {
            f.service.locate(REGION, &0).unwrap() == Some(server("B"))
        }));
        assert_eq!(f.service.metadata(REGION).unwrap().version(0), Some(2));
        assert!(f.service.evict_server(&server("Z")).is_empty());
    }

    #[test]
    fn test_observe_bucket_version() {
        let f = started(layout(4, &[(0, 3, "A", &[])]));
        let before = f.fetcher.fetch_count();

        assert!(!f.service.observe_bucket_version(REGION, 0, 3));
        assert!(!f.service.observe_bucket_version(REGION, 0, 2));
        assert!(f.service.observe_bucket_version(REGION, 0, 4));
        assert!(wait_until(|| f.fetcher.fetch_count() > before));
    }

    #[test]
    fn test_bucket_grouping_and_cover() {
        let f = started(layout(
            4,
            &[(0, 1, "A", &["C"]), (1, 1, "B", &["C"]), (2, 1, "A", &[]), (3, 1, "B", &[])],
        ));

        let writes = f
            .service
            .group_buckets_by_server(REGION, None, true)
            .unwrap()
            .unwrap();
        assert_eq!(writes.by_server[&server("A")], [0, 2].into_iter().collect());
        assert_eq!(writes.by_server[&server("B")], [1, 3].into_iter().collect());

        let target: HashSet<BucketId> = [0, 1].into_iter().collect();
        let cover = f.service.cover_buckets(REGION, &target).unwrap().unwrap();
        assert_eq!(cover.server_count(), 1);
        assert_eq!(cover.by_server[&server("C")], target);
    }

    #[test]
    fn test_stop_is_idempotent_and_blocks_restart() {
        let f = started(layout(4, &[(0, 1, "A", &[])]));
        f.service.stop();
        f.service.stop();
        assert!(matches!(f.service.start(), Err(Error::ServiceStopped)));
        assert!(!f.service.enqueue_refresh(REGION));
        // Routing still answers from the last snapshot
        assert_eq!(f.service.locate(REGION, &0).unwrap(), Some(server("A")));
    }

    #[test]
    fn test_concurrent_misses_fetch_once() {
        let fetches = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fetches);
        let fetcher = move |_: &str| -> Result<RegionMetadata> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(layout(4, &[(0, 1, "A", &[])]))
        };
        let service = Arc::new(ClientMetadataService::<u32>::new(
            MetadataConfig::default(),
            Arc::new(fetcher),
        ));
        service
            .register_region(REGION, 4, identity_resolver())
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                thread::spawn(move || service.locate(REGION, &0).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), None);
        }

        service.start().unwrap();
        service.wait_for_metadata(REGION, Duration::from_secs(5)).unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(service.stats().refreshes_enqueued, 1);
        assert_eq!(service.stats().refreshes_deduplicated, 7);
    }
}
