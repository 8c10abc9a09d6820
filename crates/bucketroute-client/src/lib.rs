//! bucketroute Client - single-hop partition routing
//!
//! This crate keeps a per-region map of which server owns each bucket and
//! uses it to send operations straight to the owning server instead of
//! through an arbitrary one.
//!
//! # Components
//!
//! - **Bucket status**: per-bucket timeout marks that steer routing away from
//!   a primary that recently failed.
//! - **Metadata store**: immutable per-region snapshots, replaced atomically
//!   with per-bucket version checks.
//! - **Refresh scheduler**: one background thread that deduplicates and
//!   serially runs metadata fetches.
//! - **Routing**: key and bucket grouping, replica selection, retry planning.
//! - **Service**: the facade the operation dispatcher talks to.
//!
//! # Example
//! ```ignore
//! use bucketroute_client::{ClientMetadataService, HashPartitionResolver};
//!
//! let service = ClientMetadataService::new(config, fetcher);
//! service.start()?;
//! service.register_region("/orders", 113, Arc::new(HashPartitionResolver::default()));
//! match service.locate("/orders", &key)? {
//!     Some(server) => send_direct(server),
//!     None => send_anywhere(),
//! }
//! ```

pub mod bucket_status;
pub mod clock;
pub mod metadata;
pub mod refresh;
pub mod resolver;
pub mod routing;
pub mod service;
pub mod stats;
pub mod store;
pub mod transport;

pub use bucket_status::{BucketStatusRegistry, BucketStatusTable};
pub use clock::{Clock, ManualClock, SystemClock};
pub use metadata::RegionMetadata;
pub use refresh::RefreshScheduler;
pub use resolver::{FnResolver, HashPartitionResolver, PartitionResolver};
pub use routing::{Grouping, Router, next_server, prune_servers};
pub use service::ClientMetadataService;
pub use stats::{RoutingStats, RoutingStatsSnapshot};
pub use store::{PublishOutcome, RegionMetadataStore};
pub use transport::{MetadataFetcher, StaticFetcher};
