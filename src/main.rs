//! Command-line interface for symmetric-sync
//!
//! Every command takes the node options (`--database-url`, `--node-id`,
//! `--config`, `--staging-dir`, `--transport-dir`, `--transforms`), which can
//! also come from `SYMMETRIC_*` environment variables.
//!
//! ```bash
//! # One-shot jobs
//! symmetric-sync route
//! symmetric-sync extract --node store-001
//! symmetric-sync load --from-dir /shared/sync
//! symmetric-sync ack --from-dir /shared/sync
//!
//! # Queue an initial load for a node
//! symmetric-sync reload --node store-001
//!
//! # Batch counts by status
//! symmetric-sync status
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use symmetric_sync::config::duration_arg;
use symmetric_sync::{JobRunner, NodeOpts, NodeRuntime};
use symmetric_sync_postgresql::PgStore;
use sync_core::{SyncError, Topology};

#[derive(Parser)]
#[command(name = "symmetric-sync")]
#[command(about = "Replicate table changes between PostgreSQL nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the runtime tables and seed configuration from a topology file
    Init {
        #[arg(long, value_name = "PATH")]
        topology: PathBuf,

        #[arg(long, env = "SYMMETRIC_DATABASE_URL")]
        database_url: String,
    },
    /// Route captured changes into batches
    Route {
        #[command(flatten)]
        opts: NodeOpts,
    },
    /// Extract waiting batches for one node into the transport directory
    Extract {
        #[command(flatten)]
        opts: NodeOpts,

        /// Target node id
        #[arg(long = "node")]
        target: String,
    },
    /// Load payloads other nodes left in the transport directory and write acks
    Load {
        #[command(flatten)]
        opts: NodeOpts,

        /// Transport directory to read from instead of --transport-dir
        #[arg(long, value_name = "DIR")]
        from_dir: Option<PathBuf>,
    },
    /// Apply acknowledgement files addressed to this node
    Ack {
        #[command(flatten)]
        opts: NodeOpts,

        /// Transport directory to read from instead of --transport-dir
        #[arg(long, value_name = "DIR")]
        from_dir: Option<PathBuf>,
    },
    /// Queue an initial load for a node
    Reload {
        #[command(flatten)]
        opts: NodeOpts,

        /// Node to reload
        #[arg(long = "node")]
        target: String,
    },
    /// Close stranded batches and drop acknowledged staging
    Purge {
        #[command(flatten)]
        opts: NodeOpts,
    },
    /// Print unfinished outgoing batch counts by status
    Status {
        #[command(flatten)]
        opts: NodeOpts,
    },
    /// Run every job on its interval until interrupted
    Run {
        #[command(flatten)]
        opts: NodeOpts,

        /// Override the routing interval (e.g. "500ms", "10s", "1m")
        #[arg(long, value_parser = duration_arg)]
        route_interval: Option<Duration>,

        /// Override the push and pull interval
        #[arg(long, value_parser = duration_arg)]
        sync_interval: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            topology,
            database_url,
        } => run_init(topology, &database_url).await,
        Commands::Route { opts } => {
            let runner = runner(&opts).await?;
            let routed = runner.route().await?;
            tracing::info!("Routed {} data events", routed);
            Ok(())
        }
        Commands::Extract { opts, target } => {
            let runtime = NodeRuntime::connect(&opts).await?;
            let remote = runtime
                .engine
                .config()
                .node(&target)
                .await?
                .ok_or(SyncError::NodeNotFound(target))?;
            if let Some(outcome) = runtime.engine.push(&remote, runtime.transport.as_ref()).await? {
                tracing::info!(
                    "Extracted {} batches for {}",
                    outcome.batches.len(),
                    remote.node_id
                );
            }
            Ok(())
        }
        Commands::Load { opts, from_dir } => {
            let runner = runner(&with_transport_dir(opts, from_dir)).await?;
            let loaded = runner.pull().await?;
            tracing::info!("Loaded {} batches", loaded);
            Ok(())
        }
        Commands::Ack { opts, from_dir } => {
            let runner = runner(&with_transport_dir(opts, from_dir)).await?;
            let acked = runner.ack().await?;
            tracing::info!("Applied {} acknowledgements", acked);
            Ok(())
        }
        Commands::Reload { opts, target } => {
            let runtime = NodeRuntime::connect(&opts).await?;
            let events = runtime.engine.reload(&target).await?;
            tracing::info!("Queued {} reload events for {}", events, target);
            Ok(())
        }
        Commands::Purge { opts } => {
            let runner = runner(&opts).await?;
            let purged = runner.purge().await?;
            tracing::info!("Purged {} entries", purged);
            Ok(())
        }
        Commands::Status { opts } => {
            let runtime = NodeRuntime::connect(&opts).await?;
            for (status, count) in runtime.engine.status().await? {
                println!("{status}\t{count}");
            }
            Ok(())
        }
        Commands::Run {
            opts,
            route_interval,
            sync_interval,
        } => {
            let runtime = NodeRuntime::connect(&opts).await?;
            let mut schedule = runtime.config.jobs.clone();
            if let Some(interval) = route_interval {
                schedule.route = interval;
            }
            if let Some(interval) = sync_interval {
                schedule.push = interval;
                schedule.pull = interval;
            }
            let runner = JobRunner::new(runtime.engine, runtime.transport, schedule);
            tracing::info!("Starting node {}", opts.node_id);
            runner
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await
        }
    }
}

fn with_transport_dir(mut opts: NodeOpts, dir: Option<PathBuf>) -> NodeOpts {
    if let Some(dir) = dir {
        opts.transport_dir = dir;
    }
    opts
}

async fn runner(opts: &NodeOpts) -> anyhow::Result<JobRunner> {
    let runtime = NodeRuntime::connect(opts).await?;
    Ok(JobRunner::new(
        runtime.engine,
        runtime.transport,
        runtime.config.jobs,
    ))
}

async fn run_init(path: PathBuf, database_url: &str) -> anyhow::Result<()> {
    let topology = Topology::from_file(&path)
        .with_context(|| format!("Failed to load topology {}", path.display()))?;
    let store = PgStore::connect(database_url).await?;
    store.create_runtime_tables().await?;
    topology.seed(&store).await?;
    tracing::info!("Runtime tables created and topology seeded");
    Ok(())
}
