//! riptided — the Riptide convergence daemon.
//!
//! Single binary that assembles the convergence engine:
//! - Group store (redb)
//! - Coordination store (in-memory, standalone mode)
//! - Bucket partitioner
//! - Converger loop
//! - Self-heal sweep
//!
//! # Usage
//!
//! ```text
//! riptided converge --interval 10 --selfheal-interval 300 \
//!     --data-dir /var/lib/riptide --compute-url http://compute.local/v2
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use riptide_coord::{MemoryCoordStore, Partitioner};
use riptide_exec::{Converger, SelfHeal};
use riptide_gather::{CloudEndpoints, HttpCloudClient};
use riptide_plan::StepLimits;
use riptide_state::GroupStore;

#[derive(Parser)]
#[command(name = "riptided", about = "Riptide convergence daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the convergence loops.
    Converge {
        /// Bucket universe size for partitioning tenants.
        #[arg(long, default_value = "11")]
        buckets: u32,

        /// Dirty-flag polling interval in seconds.
        #[arg(long, default_value = "10")]
        interval: u64,

        /// Self-heal sweep interval in seconds.
        #[arg(long, default_value = "300")]
        selfheal_interval: u64,

        /// Server build timeout in seconds.
        #[arg(long, default_value = "3600")]
        build_timeout: u64,

        /// Per-cycle cap on creation steps.
        #[arg(long, default_value = "10")]
        create_limit: usize,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/riptide")]
        data_dir: PathBuf,

        /// Compute API base URL.
        #[arg(long)]
        compute_url: String,

        /// Cloud load balancer API base URL.
        #[arg(long)]
        clb_url: String,

        /// Load balancer pool API base URL.
        #[arg(long)]
        pool_url: String,

        /// Orchestration API base URL.
        #[arg(long)]
        orchestration_url: String,

        /// Auth token sent with every upstream request.
        #[arg(long)]
        auth_token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,riptided=debug,riptide=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Converge {
            buckets,
            interval,
            selfheal_interval,
            build_timeout,
            create_limit,
            data_dir,
            compute_url,
            clb_url,
            pool_url,
            orchestration_url,
            auth_token,
        } => {
            run_converge(ConvergeConfig {
                buckets,
                interval,
                selfheal_interval,
                build_timeout,
                create_limit,
                data_dir,
                endpoints: CloudEndpoints {
                    compute: compute_url,
                    clb: clb_url,
                    pool: pool_url,
                    orchestration: orchestration_url,
                    auth_token,
                },
            })
            .await
        }
    }
}

struct ConvergeConfig {
    buckets: u32,
    interval: u64,
    selfheal_interval: u64,
    build_timeout: u64,
    create_limit: usize,
    data_dir: PathBuf,
    endpoints: CloudEndpoints,
}

async fn run_converge(config: ConvergeConfig) -> anyhow::Result<()> {
    info!("riptide daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("riptide.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let groups = GroupStore::open(&db_path)?;
    info!(path = ?db_path, "group store opened");

    // Standalone mode: one process, in-memory coordination.
    let coord = Arc::new(MemoryCoordStore::new());

    let client = Arc::new(HttpCloudClient::new(config.endpoints));
    info!("cloud client initialized");

    let limits = StepLimits {
        create_server: config.create_limit,
        create_stack: config.create_limit,
    };
    let converger = Converger::new(groups.clone(), coord.clone(), client)
        .with_limits(limits)
        .with_build_timeout(config.build_timeout);

    let partitioner = Partitioner::new(coord.clone(), "/converger/partition")
        .with_buckets(config.buckets);

    let selfheal = SelfHeal::new(groups.clone(), converger.clone(), coord.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let converge_shutdown = shutdown_rx.clone();
    let selfheal_shutdown = shutdown_rx.clone();

    // ── Start background loops ─────────────────────────────────

    let converge_interval = Duration::from_secs(config.interval);
    let converge_handle = tokio::spawn(async move {
        converger
            .run(partitioner, converge_interval, converge_shutdown)
            .await;
    });

    let selfheal_interval = Duration::from_secs(config.selfheal_interval);
    let selfheal_handle = tokio::spawn(async move {
        selfheal.run(selfheal_interval, selfheal_shutdown).await;
    });

    // Graceful shutdown on Ctrl-C.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = converge_handle.await;
    let _ = selfheal_handle.await;

    info!("riptide daemon stopped");
    Ok(())
}
