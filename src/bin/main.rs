//! ensembled binary entry point.

use clap::Parser;
use ensemble_dns::store::StoreSeed;
use ensemble_dns::{telemetry, Config, Coordinator, MemoryZoneStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Multi-signer DNSSEC provisioning coordinator.
#[derive(Parser, Debug)]
#[command(name = "ensembled")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "ensemble.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("ENSEMBLE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    config.validate()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        push_interval_secs = config.engine.push_interval_secs,
        "Starting ensembled"
    );

    // Build the zone store, seeded from file when configured
    let store = match &config.store.seed {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            let seed: StoreSeed = toml::from_str(&contents)?;
            info!(seed_file = %path.display(), "seeding zone store");
            MemoryZoneStore::from_seed(seed)?
        }
        None => MemoryZoneStore::new(),
    };

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("shutdown signal received");
        signal_token.cancel();
    });

    // Run the coordinator
    let coordinator = Coordinator::new(config, Arc::new(store));
    let result = coordinator.run(shutdown).await;

    if let Err(e) = result {
        error!("coordinator error: {}", e);
        return Err(e.into());
    }

    info!("ensembled shutdown complete");
    Ok(())
}
