//! Background metadata refresh
//!
//! A single worker thread drains a bounded, deduplicating queue of region
//! paths and fetches their metadata one at a time. Callers only ever
//! enqueue; they never wait for a fetch.

use crate::bucket_status::BucketStatusRegistry;
use crate::stats::RoutingStats;
use crate::store::RegionMetadataStore;
use crate::transport::MetadataFetcher;
use bucketroute_common::config::MetadataConfig;
use bucketroute_common::{Error, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// State shared with the worker thread
struct Shared {
    fetcher: Arc<dyn MetadataFetcher>,
    store: Arc<RegionMetadataStore>,
    status: Arc<BucketStatusRegistry>,
    stats: Arc<RoutingStats>,
    /// Regions queued or being fetched
    pending: Mutex<HashSet<String>>,
    /// Subscribers told about every finished refresh
    listeners: Mutex<Vec<Sender<String>>>,
    closed: AtomicBool,
}

impl Shared {
    fn refresh(&self, region: &str) {
        debug!("Fetching metadata for region {}", region);

        match self.fetcher.fetch_partition_metadata(region) {
            Ok(metadata) => {
                RoutingStats::incr(&self.stats.fetch_successes);
                match self.store.publish(region, metadata) {
                    Ok(outcome) => {
                        RoutingStats::add(
                            &self.stats.stale_buckets_dropped,
                            outcome.stale.len() as u64,
                        );
                        self.status.reset_buckets(region, &outcome.primary_changed);
                    }
                    Err(e) => warn!("Discarding metadata for region {}: {}", region, e),
                }
            }
            Err(e) => {
                RoutingStats::incr(&self.stats.fetch_failures);
                warn!("Metadata fetch for region {} failed: {}", region, e);
            }
        }

        self.pending.lock().remove(region);
        self.listeners
            .lock()
            .retain(|listener| listener.send(region.to_string()).is_ok());
    }
}

enum WorkerState {
    Idle,
    Running {
        handle: JoinHandle<()>,
        /// Dropped to wake and stop the worker
        stop_tx: Sender<()>,
    },
    Stopped,
}

/// Deduplicating single-worker refresh queue
pub struct RefreshScheduler {
    shared: Arc<Shared>,
    queue_tx: Sender<String>,
    queue_rx: Receiver<String>,
    worker: Mutex<WorkerState>,
    thread_name: String,
}

impl RefreshScheduler {
    /// Create a scheduler; no thread runs until [`start`](Self::start)
    #[must_use]
    pub fn new(
        config: &MetadataConfig,
        fetcher: Arc<dyn MetadataFetcher>,
        store: Arc<RegionMetadataStore>,
        status: Arc<BucketStatusRegistry>,
        stats: Arc<RoutingStats>,
    ) -> Self {
        let (queue_tx, queue_rx) = crossbeam_channel::bounded(config.refresh_queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                fetcher,
                store,
                status,
                stats,
                pending: Mutex::new(HashSet::new()),
                listeners: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
            queue_tx,
            queue_rx,
            worker: Mutex::new(WorkerState::Idle),
            thread_name: config.worker_thread_name.clone(),
        }
    }

    /// Spawn the worker thread
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        match *worker {
            WorkerState::Running { .. } => return Err(Error::AlreadyStarted),
            WorkerState::Stopped => return Err(Error::ServiceStopped),
            WorkerState::Idle => {}
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let queue = self.queue_rx.clone();
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_worker(&shared, &queue, &stop_rx))?;

        *worker = WorkerState::Running { handle, stop_tx };
        info!("Metadata refresh worker '{}' started", self.thread_name);
        Ok(())
    }

    /// Stop the worker
    ///
    /// No fetch starts after this is called. A fetch already in flight is
    /// allowed to finish, and the call returns once the worker has exited.
    pub fn stop(&self) {
        self.shared.closed.store(true, Ordering::Release);

        let mut worker = self.worker.lock();
        let previous = std::mem::replace(&mut *worker, WorkerState::Stopped);
        if let WorkerState::Running { handle, stop_tx } = previous {
            drop(stop_tx);
            if handle.join().is_err() {
                error!("Metadata refresh worker panicked");
            }
            info!("Metadata refresh worker '{}' stopped", self.thread_name);
        }

        // Nothing queued will run any more
        while self.queue_rx.try_recv().is_ok() {}
        self.shared.pending.lock().clear();
        self.shared.listeners.lock().clear();
    }

    /// Subscribe to finished refreshes
    ///
    /// The receiver gets the path of every region whose fetch completes,
    /// successfully or not. It disconnects once the scheduler stops.
    #[must_use]
    pub fn completions(&self) -> Receiver<String> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut listeners = self.shared.listeners.lock();
        if !self.shared.closed.load(Ordering::Acquire) {
            listeners.push(tx);
        }
        rx
    }

    /// Request a metadata refresh for a region
    ///
    /// Never blocks. Returns `false` when the region is already pending, the
    /// queue is full, or the scheduler has been stopped.
    pub fn enqueue(&self, region: &str) -> bool {
        let stats = &self.shared.stats;
        if self.shared.closed.load(Ordering::Acquire) {
            RoutingStats::incr(&stats.refreshes_dropped);
            debug!("Refresh scheduler stopped, ignoring refresh of {}", region);
            return false;
        }

        let mut pending = self.shared.pending.lock();
        if !pending.insert(region.to_string()) {
            RoutingStats::incr(&stats.refreshes_deduplicated);
            return false;
        }

        match self.queue_tx.try_send(region.to_string()) {
            Ok(()) => {
                RoutingStats::incr(&stats.refreshes_enqueued);
                true
            }
            Err(TrySendError::Full(_)) => {
                pending.remove(region);
                RoutingStats::incr(&stats.refreshes_dropped);
                warn!("Refresh queue full, dropping refresh of region {}", region);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                pending.remove(region);
                RoutingStats::incr(&stats.refreshes_dropped);
                false
            }
        }
    }

    /// Whether a region is queued or being fetched
    #[must_use]
    pub fn is_pending(&self, region: &str) -> bool {
        self.shared.pending.lock().contains(region)
    }

    /// Number of regions queued or being fetched
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Whether the worker thread is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.worker.lock(), WorkerState::Running { .. })
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: &Shared, queue: &Receiver<String>, stop: &Receiver<()>) {
    debug!("Metadata refresh worker running");

    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(queue) -> msg => match msg {
                Ok(region) => {
                    if shared.closed.load(Ordering::Acquire) {
                        break;
                    }
                    shared.refresh(&region);
                }
                Err(_) => break,
            },
        }
    }

    debug!("Metadata refresh worker exiting");
}
