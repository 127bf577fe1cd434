//! wgmesh - WireGuard mesh control plane
//!
//! Agents and gateways hold a persistent WebSocket control channel to this
//! server and receive their WireGuard peer configuration over it.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgmesh_control::{spawn_liveness_sweep, ControlServer, MeshCoordinator, MeshStore};
use wgmesh_transport::TransportListener;
use wgmesh_transport_websocket::WebSocketListener;

use crate::config::{ServeArgs, Settings};

/// WireGuard mesh control plane
#[derive(Parser, Debug)]
#[command(name = "wgmesh")]
#[command(about = "Coordinate WireGuard configuration between agents and gateways")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control server (default)
    #[command(long_about = r#"
Run the control server. Peers connect over WebSocket, authenticate with
their credential and receive config_update messages whenever the mesh
changes.

EXAMPLES:
  # In-memory store, plain ws:// on the default port
  wgmesh serve

  # Persistent SQLite store behind TLS
  wgmesh serve --database-url "sqlite://./wgmesh.db?mode=rwc" \
    --tls-cert cert.pem --tls-key key.pem

  # Settings from a file, one flag overridden
  wgmesh serve --config wgmesh.yml --log-level debug

ENVIRONMENT VARIABLES:
  WGMESH_LISTEN          Control channel bind address
  WGMESH_DATABASE_URL    Database URL
  WGMESH_TLS_CERT        TLS certificate (PEM)
  WGMESH_TLS_KEY         TLS private key (PEM)
  WGMESH_LOG_LEVEL       Log level
"#)]
    Serve(ServeArgs),

    /// Print a fresh WireGuard key pair
    GenerateKey {
        /// Print as JSON instead of plain lines
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .init();

    Ok(())
}

fn generate_key(json: bool) -> Result<()> {
    let keypair = wgmesh_auth::generate_keypair();
    if json {
        println!("{}", serde_json::to_string_pretty(&keypair)?);
    } else {
        println!("PrivateKey = {}", keypair.private_key);
        println!("PublicKey  = {}", keypair.public_key);
    }
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Error listening for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Error listening for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn serve(settings: Settings) -> Result<()> {
    info!("wgmesh {} ({}) starting", env!("GIT_TAG"), env!("GIT_HASH"));

    info!("Connecting to database: {}", settings.database_url);
    let db = wgmesh_db::connect(&settings.database_url)
        .await
        .context("Failed to connect to database")?;
    wgmesh_db::migrate(&db)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run database migrations: {}", e))?;
    info!("✅ Database ready");

    let store = MeshStore::new(db);
    // Nobody is connected yet, whatever the last run left behind
    let reset = store
        .reset_statuses()
        .await
        .context("Failed to reset peer statuses")?;
    if reset > 0 {
        info!(reset, "Marked peers offline from a previous run");
    }

    if settings.database_url.starts_with("sqlite::memory:") {
        warn!("Using an in-memory database; peers and tunnels are lost on restart");
    }

    let coordinator = MeshCoordinator::new(store, settings.coordinator.clone());

    let listener = WebSocketListener::bind(settings.listen, Arc::new(settings.websocket.clone()))
        .await
        .context("Failed to start control listener")?;
    let local_addr = listener.local_addr()?;
    info!(
        "Control channel at {}://{}{}",
        settings.websocket.scheme(),
        local_addr,
        settings.websocket.path
    );

    let server = ControlServer::new(listener, coordinator.clone());
    let sweep_handle = spawn_liveness_sweep(coordinator.clone());
    let server_handle = tokio::spawn(async move { server.run().await });

    shutdown_signal().await;
    info!("Shutdown signal received, closing sessions...");

    coordinator.shutdown().await;

    if let Err(e) = server_handle.await {
        error!("Control server task failed: {}", e);
    }
    if let Err(e) = sweep_handle.await {
        error!("Liveness sweep task failed: {}", e);
    }

    info!("✅ wgmesh stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = match cli.command {
        Some(Commands::GenerateKey { json }) => return generate_key(json),
        Some(Commands::Serve(args)) => args,
        None => cli.serve,
    };

    let mut settings = Settings::load(&args).context("Failed to load configuration")?;
    if cli.verbose {
        settings.log_level = "debug".to_string();
    }
    init_logging(&settings.log_level)?;

    serve(settings).await
}
