//! Error types for bucketroute
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for bucketroute operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for bucketroute
#[derive(Debug, Error)]
pub enum Error {
    // Region errors
    #[error("no such region: {0}")]
    RegionNotFound(String),

    #[error("invalid metadata for region {region}: {reason}")]
    InvalidMetadata { region: String, reason: String },

    #[error("bucket count mismatch for region {region}: expected {expected}, got {actual}")]
    BucketCountMismatch {
        region: String,
        expected: u32,
        actual: u32,
    },

    // Routing errors
    #[error("partition resolver failed: {0}")]
    Resolver(String),

    // Network/RPC errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("metadata fetch failed: {0}")]
    Fetch(String),

    // Lifecycle errors
    #[error("metadata service already started")]
    AlreadyStarted,

    #[error("metadata service stopped")]
    ServiceStopped,

    #[error("failed to spawn refresh worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a resolver error
    pub fn resolver(msg: impl Into<String>) -> Self {
        Self::Resolver(msg.into())
    }

    /// Create a fetch error
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    /// Create an invalid metadata error
    pub fn invalid_metadata(region: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            region: region.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed(_) | Self::Fetch(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::RegionNotFound(_))
    }
}
