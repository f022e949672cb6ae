//! EMSTrack sync - command line entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emstrack_sync::events::{connect_nats, MemoryBus, MessageBus, NatsBus};
use emstrack_sync::store::{EntityStore, MemoryStore, Principal};
use emstrack_sync::{Config, SyncEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "emstrack-sync")]
#[command(about = "Entity store / retained-message bus synchronization engine")]
struct Cli {
    /// Path to config.yaml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish store changes and run a session per configured principal until Ctrl-C
    Serve,

    /// Publish the complete store as retained messages once
    Seed,

    /// Print the updates of an ambulance during a call
    History {
        #[arg(long)]
        ambulance: u64,

        #[arg(long)]
        call: u64,

        /// Newest first
        #[arg(long)]
        latest_first: bool,

        /// Check read permission for this user
        #[arg(long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,emstrack_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_yaml_and_env(cli.config.as_deref())?;

    let store: Arc<dyn EntityStore> = Arc::new(load_store(&config)?);
    let bus = connect_bus(&config).await?;
    let engine = SyncEngine::start(store, bus, config.session_config());

    let outcome = match cli.command {
        Commands::Serve => serve(&engine, &config).await,
        Commands::Seed => seed(&engine).await,
        Commands::History {
            ambulance,
            call,
            latest_first,
            user,
        } => history(&engine, ambulance, call, latest_first, user),
    };
    engine.shutdown().await;
    outcome
}

fn load_store(config: &Config) -> Result<MemoryStore> {
    match &config.fixtures {
        Some(path) => {
            let store = MemoryStore::from_yaml_file(path)?;
            info!("Loaded fixtures from {}", path.display());
            Ok(store)
        }
        None => {
            warn!("No fixtures configured, starting with an empty store");
            Ok(MemoryStore::new())
        }
    }
}

async fn connect_bus(config: &Config) -> Result<Arc<dyn MessageBus>> {
    match &config.nats_url {
        Some(url) => {
            let client = connect_nats(url).await?;
            let bus = NatsBus::new(client, &config.bucket, config.subject_prefix.clone())
                .await
                .context("Failed to set up the NATS bus")?;
            Ok(Arc::new(bus))
        }
        None => {
            info!("NATS not configured, using the in-process bus");
            Ok(Arc::new(MemoryBus::new()))
        }
    }
}

async fn serve(engine: &SyncEngine, config: &Config) -> Result<()> {
    if config.principals.is_empty() {
        warn!("No principals configured; only store changes will be published");
    }
    let sessions: Vec<_> = config
        .principals
        .iter()
        .cloned()
        .map(|principal| engine.connect(principal))
        .collect();
    info!(sessions = sessions.len(), "Sync engine running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    for session in sessions {
        session.disconnect().await;
    }
    engine.wait_idle().await;
    Ok(())
}

async fn seed(engine: &SyncEngine) -> Result<()> {
    let report = engine.seeder().seed_all().await?;
    println!(
        "Seeded {} ambulances, {} hospitals, {} equipment rows, {} profiles",
        report.ambulances, report.hospitals, report.equipment, report.profiles
    );
    Ok(())
}

fn history(
    engine: &SyncEngine,
    ambulance: u64,
    call: u64,
    latest_first: bool,
    user: Option<String>,
) -> Result<()> {
    let resolver = engine.history();
    let updates = match (user, latest_first) {
        (Some(username), false) => {
            resolver.history_for(&Principal::user(username), ambulance, call)?
        }
        (Some(username), true) => {
            let mut updates = resolver.history_for(&Principal::user(username), ambulance, call)?;
            updates.reverse();
            updates
        }
        (None, false) => resolver.history(ambulance, call)?,
        (None, true) => resolver.history_latest_first(ambulance, call)?,
    };

    for update in &updates {
        println!("{}", serde_json::to_string(update)?);
    }
    info!(ambulance, call, count = updates.len(), "History resolved");
    Ok(())
}
