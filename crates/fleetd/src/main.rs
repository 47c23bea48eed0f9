//! fleetd: the Fleetgrid daemon.
//!
//! Single binary that assembles the Fleetgrid subsystems:
//! - State store (redb)
//! - Scheduler runner (task queues and host intents)
//! - Host init sweeps (start, readiness, termination)
//! - Pricing cache over the public catalogs
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml --data-dir /var/lib/fleetgrid --provider ec2
//! fleetd schedule --data-dir /var/lib/fleetgrid
//! fleetd cost --region us-east-1 --instance-type m5.large --os linux
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet_core::FleetConfig;
use fleetgrid_cloud::{
    CloudProvider, CostCalculator, Ec2Provider, HttpCatalog, MockProvider, OsType, PriceCache,
    ProviderSelector,
};
use fleetgrid_hostinit::HostInit;
use fleetgrid_scheduler::{Runner, Scheduler};
use fleetgrid_state::StateStore;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleetgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    /// In-memory provider; nothing is launched.
    Mock,
    Ec2,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and host init loops until Ctrl-C.
    Run {
        /// TOML configuration file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        #[arg(long, value_enum, default_value = "mock")]
        provider: ProviderArg,
    },

    /// Perform one scheduling run and print its report as JSON.
    Schedule {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,
    },

    /// Print the on-demand hourly price of an instance type.
    Cost {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Region code; defaults to the configured pricing region.
        #[arg(long)]
        region: Option<String>,

        #[arg(long)]
        instance_type: String,

        #[arg(long, default_value = "linux")]
        os: OsType,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => {
            let config = FleetConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(FleetConfig::default()),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("fleetgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            provider,
        } => run_daemon(load_config(config.as_deref())?, &data_dir, provider).await,
        Command::Schedule { config, data_dir } => {
            schedule_once(load_config(config.as_deref())?, &data_dir).await
        }
        Command::Cost {
            config,
            region,
            instance_type,
            os,
        } => print_cost(load_config(config.as_deref())?, region, &instance_type, os).await,
    }
}

async fn build_provider(kind: ProviderArg, config: &FleetConfig) -> Arc<dyn CloudProvider> {
    match kind {
        ProviderArg::Mock => Arc::new(MockProvider::new()),
        ProviderArg::Ec2 => Arc::new(
            Ec2Provider::from_env(&config.pricing.default_region, config.hostinit.ssh_timeout())
                .await,
        ),
    }
}

async fn run_daemon(config: FleetConfig, data_dir: &Path, kind: ProviderArg) -> anyhow::Result<()> {
    info!("fleetgrid daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(data_dir)?;
    let provider = build_provider(kind, &config).await;
    info!(provider = provider.name(), "cloud provider ready");

    let prices = Arc::new(PriceCache::new(Arc::new(HttpCatalog::new(&config.pricing))));
    let region = config.pricing.default_region.clone();
    let selector = ProviderSelector::new(provider.clone(), prices.clone(), region.clone());
    let costs = CostCalculator::new(provider.clone(), prices, region);
    let host_init = HostInit::new(store.clone(), provider, selector, config.hostinit.clone())
        .with_costs(costs);

    let scheduler = Scheduler::new(store, config.scheduler.clone());
    let runner = Runner::new(scheduler, config.scheduler.clone());

    // ── Background loops ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_interval = config.scheduler.interval();
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        runner.run(scheduler_interval, scheduler_shutdown).await;
    });

    let sweep_interval = config.hostinit.sweep_interval();
    let hostinit_handle = tokio::spawn(async move {
        host_init.run(sweep_interval, shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    let _ = hostinit_handle.await;

    info!("fleetgrid daemon stopped");
    Ok(())
}

async fn schedule_once(config: FleetConfig, data_dir: &Path) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let scheduler = Scheduler::new(store, config.scheduler.clone());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let report = scheduler.schedule(&cancel_rx).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    report.into_result()?;
    Ok(())
}

async fn print_cost(
    config: FleetConfig,
    region: Option<String>,
    instance_type: &str,
    os: OsType,
) -> anyhow::Result<()> {
    let region = region.unwrap_or_else(|| config.pricing.default_region.clone());
    let prices = PriceCache::new(Arc::new(HttpCatalog::new(&config.pricing)));
    let price = prices.on_demand_price(os, instance_type, &region).await?;
    println!("{price}");
    Ok(())
}
