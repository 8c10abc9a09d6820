//! Static cluster topology file
//!
//! A JSON document listing, per region, the bucket count and the bucket
//! locations a metadata fetch would return:
//!
//! ```json
//! {
//!   "regions": [
//!     {
//!       "path": "/orders",
//!       "bucket_count": 4,
//!       "buckets": [
//!         { "host": "server-a", "port": 40404, "bucket_id": 0, "version": 1, "is_primary": true }
//!       ]
//!     }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use bucketroute_client::{RegionMetadata, StaticFetcher};
use bucketroute_common::BucketServerLocation;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub regions: Vec<RegionTopology>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionTopology {
    pub path: String,
    pub bucket_count: u32,
    /// Locations of resolved buckets; missing buckets stay unresolved
    #[serde(default)]
    pub buckets: Vec<BucketServerLocation>,
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read topology file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse topology file {}", path.display()))
    }

    pub fn region(&self, path: &str) -> Option<&RegionTopology> {
        self.regions.iter().find(|r| r.path == path)
    }

    /// Build a fetcher serving every region in the topology
    pub fn into_fetcher(self) -> Result<StaticFetcher> {
        let fetcher = StaticFetcher::new();
        for region in self.regions {
            let metadata = RegionMetadata::from_locations(&region.path, region.bucket_count, region.buckets)
                .with_context(|| format!("invalid topology for region {}", region.path))?;
            fetcher.insert(region.path, metadata);
        }
        Ok(fetcher)
    }
}
