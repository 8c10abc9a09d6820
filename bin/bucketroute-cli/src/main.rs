//! bucketroute CLI - offline routing inspector
//!
//! Loads a static cluster topology, runs the client metadata service against
//! it and prints the routing decisions as JSON.

mod topology;

use anyhow::{Context, Result, anyhow};
use bucketroute_client::{ClientMetadataService, Grouping, HashPartitionResolver};
use bucketroute_common::{BucketId, Config};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use topology::Topology;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bucketroute-cli")]
#[command(about = "Inspect single-hop routing decisions against a static topology")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "bucketroute.toml")]
    config: String,

    /// Topology file (JSON)
    #[arg(short, long)]
    topology: PathBuf,

    /// Region path
    #[arg(short, long)]
    region: String,

    /// Log level (overrides the configured level)
    #[arg(long)]
    log_level: Option<String>,

    /// Buckets whose primary should be treated as timed out
    #[arg(long, value_delimiter = ',')]
    timed_out: Vec<BucketId>,

    /// How long to wait for the first metadata fetch (milliseconds)
    #[arg(long, default_value = "2000")]
    wait_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Locate the server for each key
    Locate {
        /// Keys to route
        keys: Vec<String>,
        /// Pick any replica instead of the primary
        #[arg(long)]
        replica: bool,
    },
    /// Group keys by target server
    Group {
        /// Keys to route
        keys: Vec<String>,
    },
    /// Group buckets by target server
    Buckets {
        /// Buckets to route (all buckets when empty)
        buckets: Vec<BucketId>,
        /// Pick any replica instead of the primary
        #[arg(long)]
        read: bool,
    },
    /// Find the fewest servers holding the given buckets
    Cover {
        /// Buckets to cover
        buckets: Vec<BucketId>,
    },
    /// Show the published metadata
    Show,
}

fn load_config(path: &str) -> Result<Config> {
    let config: Config = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("BUCKETROUTE").separator("__"))
        .build()
        .with_context(|| format!("failed to load configuration from {path}"))?
        .try_deserialize()
        .context("invalid configuration")?;
    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Render a grouping with servers in a stable order
fn grouping_json<T>(grouping: &Grouping<T>) -> Value
where
    T: Hash + Eq + Ord + Serialize,
{
    let servers: BTreeMap<String, Vec<&T>> = grouping
        .by_server
        .iter()
        .map(|(server, items)| {
            let mut items: Vec<&T> = items.iter().collect();
            items.sort();
            (server.to_string(), items)
        })
        .collect();
    let mut unrouted: Vec<&T> = grouping.unrouted.iter().collect();
    unrouted.sort();

    json!({ "servers": servers, "unrouted": unrouted })
}

fn run(service: &ClientMetadataService<String>, region: &str, command: &Commands) -> Result<Value> {
    let output = match command {
        Commands::Locate { keys, replica } => {
            let mut routes = Vec::with_capacity(keys.len());
            for key in keys {
                let server = if *replica {
                    service.locate_replica(region, key)?
                } else {
                    service.locate(region, key)?
                };
                routes.push(json!({ "key": key, "server": server.map(|s| s.to_string()) }));
            }
            json!(routes)
        }
        Commands::Group { keys } => service
            .group_by_server(region, keys.iter().cloned())?
            .map_or(Value::Null, |grouping| grouping_json(&grouping)),
        Commands::Buckets { buckets, read } => {
            let selected: HashSet<BucketId> = buckets.iter().copied().collect();
            let selected = (!selected.is_empty()).then_some(&selected);
            service
                .group_buckets_by_server(region, selected, !read)?
                .map_or(Value::Null, |grouping| grouping_json(&grouping))
        }
        Commands::Cover { buckets } => {
            let selected: HashSet<BucketId> = buckets.iter().copied().collect();
            service
                .cover_buckets(region, &selected)?
                .map_or(Value::Null, |grouping| grouping_json(&grouping))
        }
        Commands::Show => {
            let metadata = service
                .metadata(region)
                .ok_or_else(|| anyhow!("no metadata for region {region}"))?;
            let buckets: Vec<Value> = (0..metadata.bucket_count())
                .map(|bucket| {
                    json!({
                        "bucket": bucket,
                        "version": metadata.version(bucket),
                        "locations": metadata.locations(bucket),
                    })
                })
                .collect();
            json!({ "bucket_count": metadata.bucket_count(), "buckets": buckets })
        }
    };
    Ok(output)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, config.logging.json);

    let topology = Topology::load(&args.topology)?;
    let bucket_count = topology
        .region(&args.region)
        .map(|r| r.bucket_count)
        .ok_or_else(|| anyhow!("region {} is not in the topology", args.region))?;
    let fetcher = Arc::new(topology.into_fetcher()?);

    let service: ClientMetadataService<String> = ClientMetadataService::new(config.metadata, fetcher);
    service.register_region(&args.region, bucket_count, Arc::new(HashPartitionResolver::default()))?;
    service.start()?;

    service.enqueue_refresh(&args.region);
    let metadata = service
        .wait_for_metadata(&args.region, Duration::from_millis(args.wait_ms))
        .ok_or_else(|| anyhow!("no metadata for region {} (is single-hop disabled?)", args.region))?;
    info!(
        "Region {}: {} of {} buckets resolved",
        args.region,
        metadata.resolved_count(),
        metadata.bucket_count()
    );

    for &bucket in &args.timed_out {
        service.mark_bucket_timed_out(&args.region, bucket)?;
    }

    let routing = run(&service, &args.region, &args.command)?;
    service.stop();

    let output = json!({ "region": args.region, "routing": routing, "stats": service.stats() });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
