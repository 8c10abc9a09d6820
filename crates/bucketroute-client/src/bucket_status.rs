//! Per-bucket timeout tracking
//!
//! When a bucket's primary fails to answer in time the bucket is marked, and
//! routing prefers a secondary until the timeout window has elapsed. Each
//! bucket is one atomic slot so marks and checks on unrelated buckets never
//! contend.

use crate::clock::Clock;
use bucketroute_common::BucketId;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Slot value for a bucket that is not timed out
const NOT_TIMED_OUT: u64 = u64::MAX;

/// Timeout marks for every bucket of one region
pub struct BucketStatusTable {
    slots: Box<[AtomicU64]>,
    clock: Arc<dyn Clock>,
}

impl BucketStatusTable {
    /// Create a table with one slot per bucket
    #[must_use]
    pub fn new(bucket_count: u32, clock: Arc<dyn Clock>) -> Self {
        let slots = (0..bucket_count)
            .map(|_| AtomicU64::new(NOT_TIMED_OUT))
            .collect();
        Self { slots, clock }
    }

    /// Number of buckets tracked
    #[must_use]
    pub fn bucket_count(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    /// Mark a bucket as timed out
    ///
    /// Only the first mark counts: while a bucket is marked, further marks
    /// do not move the timeout instant. Returns whether this call set the mark.
    pub fn mark_timed_out(&self, bucket: BucketId) -> bool {
        let Some(slot) = self.slot(bucket) else {
            warn!("Ignoring timeout mark for out-of-range bucket {}", bucket);
            return false;
        };
        let now = self.clock.now_millis();
        slot.compare_exchange(NOT_TIMED_OUT, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check whether a bucket is still inside its timeout window
    ///
    /// Once the window has elapsed the mark is cleared and `false` returned.
    pub fn is_timed_out(&self, bucket: BucketId, window_millis: u64) -> bool {
        let Some(slot) = self.slot(bucket) else {
            return false;
        };
        let marked = slot.load(Ordering::Acquire);
        if marked == NOT_TIMED_OUT {
            return false;
        }

        let now = self.clock.now_millis();
        if now < marked.saturating_add(window_millis) {
            return true;
        }

        // A concurrent reset or re-mark wins; either way the old window is over.
        if slot
            .compare_exchange(marked, NOT_TIMED_OUT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("Bucket {} recovered after {} ms timeout window", bucket, window_millis);
        }
        false
    }

    /// Clear a bucket's mark
    pub fn reset(&self, bucket: BucketId) {
        if let Some(slot) = self.slot(bucket) {
            slot.store(NOT_TIMED_OUT, Ordering::Release);
        }
    }

    fn slot(&self, bucket: BucketId) -> Option<&AtomicU64> {
        self.slots.get(usize::try_from(bucket).ok()?)
    }
}

/// Bucket status tables for all regions
pub struct BucketStatusRegistry {
    tables: DashMap<String, Arc<BucketStatusTable>>,
    clock: Arc<dyn Clock>,
}

impl BucketStatusRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: DashMap::new(),
            clock,
        }
    }

    /// Get the table for a region, if one exists
    #[must_use]
    pub fn table(&self, region: &str) -> Option<Arc<BucketStatusTable>> {
        self.tables.get(region).map(|t| Arc::clone(t.value()))
    }

    /// Get the table for a region, creating it on first use
    ///
    /// A table sized for a different bucket count (the region was recreated)
    /// is replaced.
    pub fn table_or_create(&self, region: &str, bucket_count: u32) -> Arc<BucketStatusTable> {
        if let Some(table) = self.tables.get(region) {
            if table.bucket_count() == bucket_count {
                return Arc::clone(table.value());
            }
        }

        let mut entry = self
            .tables
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(BucketStatusTable::new(bucket_count, Arc::clone(&self.clock))));
        if entry.bucket_count() != bucket_count {
            *entry = Arc::new(BucketStatusTable::new(bucket_count, Arc::clone(&self.clock)));
        }
        Arc::clone(entry.value())
    }

    /// Clear marks for the given buckets of a region
    pub fn reset_buckets(&self, region: &str, buckets: &[BucketId]) {
        if let Some(table) = self.table(region) {
            for &bucket in buckets {
                table.reset(bucket);
            }
        }
    }

    /// Drop a region's table
    pub fn remove(&self, region: &str) {
        self.tables.remove(region);
    }
}
