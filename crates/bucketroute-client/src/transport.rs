//! Metadata fetch interface
//!
//! The connection layer implements `MetadataFetcher` to ask a server for a
//! region's current bucket assignment. `StaticFetcher` serves snapshots from
//! memory.

use crate::metadata::RegionMetadata;
use bucketroute_common::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fetches the current bucket assignment for a region
///
/// Called only from the refresh worker, one request at a time. Any failure
/// (timeout, disconnect, malformed response) is reported as an error and
/// leaves the previously published snapshot in place.
pub trait MetadataFetcher: Send + Sync {
    /// Fetch metadata for the region at `region_path`
    fn fetch_partition_metadata(&self, region_path: &str) -> Result<RegionMetadata>;
}

impl<F> MetadataFetcher for F
where
    F: Fn(&str) -> Result<RegionMetadata> + Send + Sync,
{
    fn fetch_partition_metadata(&self, region_path: &str) -> Result<RegionMetadata> {
        self(region_path)
    }
}

/// In-memory fetcher returning preloaded snapshots
#[derive(Default)]
pub struct StaticFetcher {
    regions: RwLock<HashMap<String, RegionMetadata>>,
    fetches: AtomicU64,
}

impl StaticFetcher {
    /// Create an empty fetcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the snapshot served for a region
    pub fn insert(&self, region: impl Into<String>, metadata: RegionMetadata) {
        self.regions.write().insert(region.into(), metadata);
    }

    /// Stop serving a region
    pub fn remove(&self, region: &str) {
        self.regions.write().remove(region);
    }

    /// Number of fetches served so far (including failed ones)
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl MetadataFetcher for StaticFetcher {
    fn fetch_partition_metadata(&self, region_path: &str) -> Result<RegionMetadata> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.regions
            .read()
            .get(region_path)
            .cloned()
            .ok_or_else(|| Error::fetch(format!("no metadata for region {region_path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_fetcher() {
        let fetcher = StaticFetcher::new();
        assert!(fetcher.fetch_partition_metadata("/r").is_err());

        fetcher.insert("/r", RegionMetadata::unresolved(4));
        let md = fetcher.fetch_partition_metadata("/r").unwrap();
        assert_eq!(md.bucket_count(), 4);
        assert_eq!(fetcher.fetch_count(), 2);

        fetcher.remove("/r");
        assert!(fetcher.fetch_partition_metadata("/r").unwrap_err().is_retryable());
    }

    #[test]
    fn test_closure_fetcher() {
        let fetcher = |region: &str| -> Result<RegionMetadata> {
            if region == "/ok" {
                Ok(RegionMetadata::unresolved(2))
            } else {
                Err(Error::Timeout)
            }
        };
        assert!(fetcher.fetch_partition_metadata("/ok").is_ok());
        assert!(matches!(fetcher.fetch_partition_metadata("/x"), Err(Error::Timeout)));
    }
}
