//! mesh-relay: WebSocket rendezvous server for peer mesh signaling.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mesh_relay::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "mesh-relay")]
#[command(about = "Signaling relay for the peer mesh")]
struct Args {
    /// Path to a JSON config file (defaults are used if it doesn't exist)
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "relay.json")]
    config: PathBuf,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "RELAY_LISTEN")]
    listen: Option<String>,

    /// Allowed origins, comma separated (overrides the config file)
    #[arg(long, env = "RELAY_ORIGINS", value_delimiter = ',')]
    origins: Option<Vec<String>>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mesh_relay=debug"
    } else {
        "info,mesh_relay=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = RelayConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(origins) = args.origins {
        config.allowed_origins = origins.into_iter().collect();
    }

    info!("Starting mesh-relay");
    info!("Upgrade path: {}", config.path);
    info!("Allowed origins: {:?}", config.allowed_origins);

    let listener = RelayServer::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
