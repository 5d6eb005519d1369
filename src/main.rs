//! trapsink - Main Application Entry Point
//!
//! `handle` runs once per trap under the trap daemon; `consume` is the
//! long-running persister daemon. The remaining commands are operator tools.

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use futures_util::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trapsink::{
    health,
    logging::{initialise_logging, start_log_rotation_monitoring},
    Ack, Config, DeadLetterSink, EventPublisher, FallbackLog, HealthState, Normalizer, Persister,
    PersisterSettings, PgTrapStore, RawTrapRecord, Reconciler, RedisStreamQueue, TrapHandler,
};

fn cli() -> Command {
    Command::new("trapsink")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Normalizes SNMP traps, queues them on Redis Streams and persists them to PostgreSQL")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.json")
                .global(true),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as daemon (suppress console output)")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a default configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .subcommand(Command::new("handle").about("Read one trap from stdin, normalize and publish it"))
        .subcommand(Command::new("consume").about("Run persister workers, the fallback reconciler and the health server"))
        .subcommand(Command::new("drain").about("Re-publish the fallback log once and exit"))
        .subcommand(Command::new("migrate").about("Create or update the database schema"))
        .subcommand(
            Command::new("ack")
                .about("Mark a stored trap as acknowledged")
                .arg(Arg::new("id").required(true).value_parser(value_parser!(i64))),
        )
        .subcommand(
            Command::new("unack")
                .about("Clear the acknowledged flag of a stored trap")
                .arg(Arg::new("id").required(true).value_parser(value_parser!(i64))),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .map(String::as_str)
            .unwrap_or("config.json"),
    );
    let daemon_mode = matches.get_flag("daemon");

    if matches.get_flag("generate-config") {
        return generate_default_config(&config_path).await;
    }

    let mut config = load_configuration(&config_path).await?;
    config.apply_env_overrides();

    initialise_logging(&config.logging, daemon_mode)?;
    config.validate().context("Configuration validation failed")?;

    match matches.subcommand() {
        Some(("handle", _)) => run_handler(config).await,
        Some(("consume", _)) => {
            info!("Starting trapsink v{}", env!("CARGO_PKG_VERSION"));
            info!("Configuration loaded from: {}", config_path.display());
            run_consumer(config).await
        }
        Some(("drain", _)) => run_drain(config).await,
        Some(("migrate", _)) => run_migrate(config).await,
        Some(("ack", args)) => set_acknowledged(config, args, true).await,
        Some(("unack", args)) => set_acknowledged(config, args, false).await,
        _ => anyhow::bail!("No command given, see --help"),
    }
}

/// Generate a default configuration file
async fn generate_default_config(config_path: &PathBuf) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Configuration file already exists: {}", config_path.display());
    }

    Config::default()
        .save_to_file(config_path)
        .await
        .context("Failed to save default configuration")?;

    println!("Default configuration generated: {}", config_path.display());
    println!("Please edit the queue and store URLs before starting the consumer.");
    Ok(())
}

/// Load configuration from file with automatic creation if missing
async fn load_configuration(config_path: &PathBuf) -> Result<Config> {
    if !config_path.exists() {
        let default_config = Config::default();
        default_config
            .save_to_file(config_path)
            .await
            .context("Failed to create default configuration file")?;
        eprintln!("Created default configuration file: {}", config_path.display());
        return Ok(default_config);
    }

    Config::load_from_file(config_path)
        .await
        .context("Failed to load configuration file")
}

fn build_queue(config: &Config) -> Result<Arc<RedisStreamQueue>> {
    let queue = RedisStreamQueue::new(&config.queue).context("Failed to initialise queue client")?;
    Ok(Arc::new(queue))
}

fn build_store(config: &Config) -> Result<Arc<PgTrapStore>> {
    let store = PgTrapStore::connect_lazy(&config.store).context("Failed to initialise store pool")?;
    Ok(Arc::new(store))
}

fn build_reconciler(config: &Config, queue: Arc<RedisStreamQueue>) -> Reconciler {
    Reconciler::new(
        FallbackLog::new(&config.fallback.path),
        queue,
        DeadLetterSink::new(&config.dead_letter.path),
        config.fallback.checkpoint_every,
        config.queue.publish_timeout(),
    )
}

/// One trap from the trap daemon's traphandle hook.
async fn run_handler(config: Config) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read trap from stdin")?;

    let queue = build_queue(&config)?;
    let publisher = EventPublisher::new(
        queue,
        FallbackLog::new(&config.fallback.path),
        config.queue.publish_timeout(),
    );
    let handler = TrapHandler::new(Normalizer::new(&config.normalizer), publisher);

    let raw = RawTrapRecord::parse_handoff(&input);
    match handler.handle(&raw).await {
        Ok(Ack::Queued { id }) => {
            info!("Trap queued as {}", id);
            Ok(())
        }
        Ok(Ack::Fallback) => {
            warn!("Trap written to fallback log {}", config.fallback.path);
            Ok(())
        }
        Err(e) => {
            error!("Trap could not be published: {}", e);
            Err(e.into())
        }
    }
}

/// Main consumer runtime
async fn run_consumer(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let health_state = HealthState::new();

    let queue = build_queue(&config)?;
    if let Err(e) = queue.ensure_group().await {
        warn!("Could not prepare consumer group yet ({}), workers will retry", e);
    }

    let store = build_store(&config)?;
    if config.store.run_migrations {
        store.migrate().await.context("Failed to run store migrations")?;
    }

    let persister = Persister::new(
        queue.clone(),
        store.clone(),
        DeadLetterSink::new(&config.dead_letter.path),
        health_state.clone(),
        PersisterSettings::new(&config.persister, config.queue.batch_size),
    );
    let workers = persister.spawn_workers(
        &config.persister.consumer_name,
        config.persister.workers,
        config.queue.partitions,
        &cancel,
    );

    let reconciler = build_reconciler(&config, queue.clone());
    let reconcile_interval = Duration::from_secs(config.fallback.reconcile_interval_seconds.max(1));
    let reconciler_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(reconcile_interval, cancel).await })
    };

    let mut background = vec![reconciler_handle];
    if config.health.enabled {
        background.push(
            health::start_server(&config.health.bind_address, health_state.clone(), cancel.clone())
                .await
                .context("Failed to start health server")?,
        );
        background.push(tokio::spawn(health::run_prober(
            health_state.clone(),
            queue.clone(),
            store.clone(),
            Duration::from_secs(config.health.probe_interval_seconds.max(1)),
            cancel.clone(),
        )));
    }
    if config.store.delivery_retention_hours > 0 {
        background.push(tokio::spawn(trapsink::store::run_delivery_pruner(
            store.clone(),
            Duration::from_secs(config.store.delivery_retention_hours.saturating_mul(3_600)),
            Duration::from_secs(config.store.prune_interval_seconds),
            cancel.clone(),
        )));
    }
    if let Some(handle) = start_log_rotation_monitoring(&config.logging, cancel.clone()) {
        background.push(handle);
    }

    let mut signals = Signals::new([SIGTERM, SIGINT]).context("Failed to register signal handlers")?;

    info!(
        workers = config.persister.workers,
        partitions = config.queue.partitions,
        stream = %config.queue.stream,
        "trapsink consumer started"
    );

    signals.next().await;
    info!("Received shutdown signal, stopping gracefully...");
    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(config.persister.shutdown_timeout_seconds);
    match tokio::time::timeout(shutdown_timeout, futures_util::future::join_all(workers)).await {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(report) => info!(
                        "Worker {} finished: {} persisted, {} duplicates, {} dead-lettered, {} deferred",
                        report.consumer, report.persisted, report.duplicates, report.dead_lettered, report.deferred
                    ),
                    Err(e) => error!("Persister worker panicked: {}", e),
                }
            }
        }
        Err(_) => warn!(
            "Workers did not stop within {}s, uncommitted deliveries stay pending",
            shutdown_timeout.as_secs()
        ),
    }

    for handle in background {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }

    info!("trapsink consumer stopped");
    Ok(())
}

async fn run_drain(config: Config) -> Result<()> {
    let queue = build_queue(&config)?;
    let report = build_reconciler(&config, queue)
        .drain_once(&CancellationToken::new())
        .await
        .context("Fallback drain failed")?;

    println!(
        "Republished {} line(s), dead-lettered {}, {} remaining",
        report.republished, report.dead_lettered, report.remaining
    );
    if let Some(reason) = report.interrupted_by {
        anyhow::bail!("Drain stopped early: {}", reason);
    }
    Ok(())
}

async fn run_migrate(config: Config) -> Result<()> {
    build_store(&config)?
        .migrate()
        .await
        .context("Failed to run store migrations")?;
    println!("Schema is up to date");
    Ok(())
}

async fn set_acknowledged(config: Config, args: &ArgMatches, acknowledged: bool) -> Result<()> {
    let id = *args.get_one::<i64>("id").context("Missing trap id")?;
    let updated = build_store(&config)?
        .set_acknowledged(id, acknowledged)
        .await
        .with_context(|| format!("Failed to update trap {}", id))?;
    if !updated {
        anyhow::bail!("No trap with id {}", id);
    }
    println!("Trap {} {}", id, if acknowledged { "acknowledged" } else { "unacknowledged" });
    Ok(())
}
