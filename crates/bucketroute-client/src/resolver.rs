//! Key → bucket resolution

use bucketroute_common::{BucketId, Error, Result};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use xxhash_rust::xxh64::Xxh64;

/// Maps a key to the bucket that owns it
pub trait PartitionResolver<K: ?Sized>: Send + Sync {
    /// Resolve `key` to a bucket id in `0..bucket_count`
    fn resolve_bucket(&self, key: &K, bucket_count: u32) -> Result<BucketId>;
}

/// Resolver that hashes the key with xxHash64
#[derive(Clone, Copy, Debug, Default)]
pub struct HashPartitionResolver {
    seed: u64,
}

impl HashPartitionResolver {
    /// Create a resolver with a custom hash seed
    #[must_use]
    pub const fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl<K: Hash + ?Sized> PartitionResolver<K> for HashPartitionResolver {
    fn resolve_bucket(&self, key: &K, bucket_count: u32) -> Result<BucketId> {
        if bucket_count == 0 {
            return Err(Error::resolver("region has no buckets"));
        }
        let mut hasher = Xxh64::new(self.seed);
        key.hash(&mut hasher);
        let bucket = hasher.finish() % u64::from(bucket_count);
        BucketId::try_from(bucket).map_err(|e| Error::resolver(e.to_string()))
    }
}

/// Resolver backed by a closure
pub struct FnResolver<K: ?Sized, F> {
    resolve: F,
    _key: PhantomData<fn(&K)>,
}

impl<K: ?Sized, F> FnResolver<K, F>
where
    F: Fn(&K, u32) -> Result<BucketId> + Send + Sync,
{
    /// Wrap a closure as a resolver
    pub const fn new(resolve: F) -> Self {
        Self {
            resolve,
            _key: PhantomData,
        }
    }
}

impl<K: ?Sized, F> PartitionResolver<K> for FnResolver<K, F>
where
    F: Fn(&K, u32) -> Result<BucketId> + Send + Sync,
{
    fn resolve_bucket(&self, key: &K, bucket_count: u32) -> Result<BucketId> {
        (self.resolve)(key, bucket_count)
    }
}
