//! Core type definitions for bucketroute
//!
//! Server and bucket location types shared by the metadata service and the
//! operation dispatch layer. Locations compare and hash by value.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a bucket within a partitioned region
pub type BucketId = u32;

/// Network location of a cache server
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{host}:{port}")]
pub struct ServerLocation {
    /// Host name or IP address
    pub host: String,
    /// Server port
    pub port: u16,
}

impl ServerLocation {
    /// Create a new server location
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Debug for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerLocation({}:{})", self.host, self.port)
    }
}

/// A server hosting a copy of a specific bucket
///
/// Produced by metadata fetches. The version increases every time the
/// bucket's assignment changes on the servers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketServerLocation {
    /// Server holding the bucket
    #[serde(flatten)]
    pub location: ServerLocation,
    /// Bucket hosted at this location
    pub bucket_id: BucketId,
    /// Assignment version for the bucket
    pub version: u64,
    /// Whether this server is the bucket's primary
    pub is_primary: bool,
}

impl BucketServerLocation {
    /// Create a primary bucket location
    #[must_use]
    pub const fn primary(location: ServerLocation, bucket_id: BucketId, version: u64) -> Self {
        Self {
            location,
            bucket_id,
            version,
            is_primary: true,
        }
    }

    /// Create a secondary bucket location
    #[must_use]
    pub const fn secondary(location: ServerLocation, bucket_id: BucketId, version: u64) -> Self {
        Self {
            location,
            bucket_id,
            version,
            is_primary: false,
        }
    }

    /// Server hosting this copy
    #[must_use]
    pub const fn location(&self) -> &ServerLocation {
        &self.location
    }
}

impl fmt::Display for BucketServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.is_primary { "primary" } else { "secondary" };
        write!(
            f,
            "{} (bucket {} v{} {})",
            self.location, self.bucket_id, self.version, role
        )
    }
}
