//! # Conductor — job scheduling daemon
//!
//! Usage:
//!   conductor serve                          # Pool + cron poller + HTTP gateway
//!   conductor check                          # Validate config and run startup checks
//!   conductor jobs add <name> <cron> <cmd>   # Store a cron job in SQLite
//!   conductor jobs list
//!   conductor jobs remove <id>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conductor_core::config::ConductorConfig;
use conductor_runtime::{DispatchMetrics, Dispatcher, EventSink, FanoutSink, RecentEvents, TracingSink};
use conductor_scheduler::monitor::spawn_watchdog;
use conductor_scheduler::{CronJobRecord, JobSource, Scheduler, SqliteJobSource, pre_launch_checks};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "⏱️ Conductor — bounded worker pool, cron poller and intent gateway"
)]
struct Cli {
    /// Config file (default: ~/.conductor/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker pool, cron poller and HTTP gateway
    Serve {
        /// Override the gateway port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate the config and run the startup resource checks
    Check,

    /// Manage cron jobs stored in SQLite
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Add a cron job
    Add {
        name: String,
        /// Five-field cron expression, e.g. "*/5 * * * *"
        schedule: String,
        /// Shell command to run
        command: String,
    },
    /// List stored cron jobs
    List,
    /// Remove a cron job by id
    Remove { id: String },
}

fn load_config(path: Option<&str>) -> Result<ConductorConfig> {
    let config = match path {
        Some(p) => ConductorConfig::load_from(&PathBuf::from(shellexpand::tilde(p).to_string()))?,
        None => ConductorConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "conductor=debug,conductor_scheduler=debug,conductor_runtime=debug,conductor_gateway=debug,tower_http=debug"
    } else {
        "conductor=info,conductor_scheduler=info,conductor_runtime=info,conductor_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => serve(config, port).await,
        Commands::Check => check(&config),
        Commands::Jobs { command } => jobs(&config, command),
    }
}

async fn serve(mut config: ConductorConfig, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.gateway.port = port;
    }

    if config.monitor.prelaunch_checks {
        let report = pre_launch_checks(config.monitor.fd_floor, config.monitor.min_cores)?;
        tracing::info!("✅ Startup checks passed: {} fds, {} cores", report.fd_limit, report.cores);
    }

    let db_path = config.storage.resolved_db_path();
    let store = Arc::new(SqliteJobSource::open(&db_path)?);
    let scheduler = Arc::new(Scheduler::from_config(
        &config,
        vec![store as Arc<dyn JobSource>],
    )?);

    let events = Arc::new(RecentEvents::new(config.gateway.event_history));
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(events.clone() as Arc<dyn EventSink>);
    let metrics = Arc::new(DispatchMetrics::new(&config.metrics.namespace)?);
    let dispatcher = Arc::new(Dispatcher::new(scheduler.clone(), Arc::new(sink), metrics));

    scheduler.start_scheduler().await?;

    let (watchdog_tx, watchdog_rx) = tokio::sync::watch::channel(());
    let watchdog = spawn_watchdog(
        scheduler.pool().probe(),
        config.monitor.task_ceiling,
        Duration::from_secs(config.pool.sample_interval_secs),
        watchdog_rx,
    );

    let pairing_code = conductor_gateway::resolve_pairing_code(
        &config.gateway,
        &ConductorConfig::home_dir(),
    )?;

    println!("⏱️ Conductor v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 Gateway:   http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   👷 Workers:   {}", config.pool.workers);
    println!("   🗄️  Database:  {}", db_path.display());
    if pairing_code.is_some() {
        println!("   🔑 Pairing:   send X-Pairing-Code (see CONDUCTOR_PAIRING_CODE or ~/.conductor/.pairing_code)");
    } else {
        println!("   ⚠️  Pairing:   disabled");
    }
    println!();

    let state = conductor_gateway::AppState::new(
        config.gateway.clone(),
        scheduler.clone(),
        dispatcher,
        events,
    )
    .with_pairing_code(pairing_code);
    let served = conductor_gateway::start(state, async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("🛑 Shutdown requested");
    })
    .await;

    drop(watchdog_tx);
    watchdog.await.ok();
    scheduler.stop_scheduler().await?;
    served
}

fn check(config: &ConductorConfig) -> Result<()> {
    config.validate()?;
    let report = pre_launch_checks(config.monitor.fd_floor, config.monitor.min_cores)?;
    println!("✅ Config OK");
    println!("   📂 Open-file limit: {}", report.fd_limit);
    println!("   🧮 Cores:           {}", report.cores);
    println!("   👷 Workers:         {} (+{} buffered)", config.pool.workers, config.pool.buffer);
    println!("   📊 Monitoring:      {:?}", config.pool.monitoring);
    Ok(())
}

fn jobs(config: &ConductorConfig, command: JobCommands) -> Result<()> {
    let store = SqliteJobSource::open(&config.storage.resolved_db_path())?;
    match command {
        JobCommands::Add { name, schedule, command } => {
            let record = CronJobRecord::new(&name, &schedule, &command);
            store.add_job(&record)?;
            println!("✅ Added '{}' ({}) → {}", record.name, record.schedule, record.id);
        }
        JobCommands::List => {
            let records = store.list_jobs()?;
            if records.is_empty() {
                println!("No cron jobs stored.");
            }
            for r in records {
                let state = if r.active { "active" } else { "paused" };
                println!("{}  {:<16} {:<14} {:<7} {}", r.id, r.name, r.schedule, state, r.command);
            }
        }
        JobCommands::Remove { id } => {
            let id: Uuid = id.parse().map_err(|e| anyhow::anyhow!("invalid job id '{id}': {e}"))?;
            if store.remove_job(id)? {
                println!("🗑️ Removed {id}");
            } else {
                println!("⚠️ No job with id {id}");
            }
        }
    }
    Ok(())
}
