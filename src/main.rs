//! Overpass CLI - TCP tunneling through a message relay
//!
//! Run the relay, register an agent behind it, or bridge a local port to a
//! destination neither side can reach directly.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use overpass_agent::{Agent, AgentConfig};
use overpass_client::{Connector, ConnectorConfig};
use overpass_relay::RelayServer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Overpass - Tunnel TCP traffic through a rendezvous relay
#[derive(Parser, Debug)]
#[command(name = "overpass")]
#[command(about = "Overpass - Tunnel TCP traffic through a rendezvous relay")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Address to listen on
        #[arg(long, env = "OVERPASS_LISTEN", default_value = "0.0.0.0:8080")]
        listen: String,
    },

    /// Register as a named agent and originate sessions on demand
    Agent {
        /// Relay endpoint (e.g. ws://relay.example.com:8080)
        #[arg(long, env = "OVERPASS_RELAY")]
        relay: String,

        /// Name to register under
        #[arg(long, env = "OVERPASS_NAME")]
        name: String,
    },

    /// Bridge a local port to a destination through the relay
    #[command(long_about = r#"
Bridge a local port to a destination through the relay.

EXAMPLES:
  # Let the relay dial the destination itself
  overpass connect --relay ws://relay:8080 \
    --listen 127.0.0.1:5433 --addr 192.168.1.100:5432

  # Reach a host only the agent "workshop" can see
  overpass connect --relay ws://relay:8080 \
    --listen 127.0.0.1:2222 --addr 10.0.0.7:22 --name workshop

  # Same, multiplexing all connections over one tunnel
  overpass connect --relay ws://relay:8080 \
    --listen 127.0.0.1:2222 --addr 10.0.0.7:22 --name workshop --mux
    "#)]
    Connect {
        /// Relay endpoint (e.g. ws://relay.example.com:8080)
        #[arg(long, env = "OVERPASS_RELAY")]
        relay: String,

        /// Local address to listen on
        #[arg(long, env = "OVERPASS_LISTEN", default_value = "127.0.0.1:2080")]
        listen: String,

        /// Destination to bridge to (host:port)
        #[arg(long, env = "OVERPASS_ADDR")]
        addr: String,

        /// Route through this named agent instead of the relay
        #[arg(long, env = "OVERPASS_NAME")]
        name: Option<String>,

        /// Multiplex connections over one shared tunnel
        #[arg(long)]
        mux: bool,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    match cli.command {
        Commands::Serve { listen } => {
            let server = RelayServer::bind(&listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;

            tokio::select! {
                _ = &mut ctrl_c => info!("received Ctrl+C, shutting down"),
                result = server.serve() => result.context("relay stopped")?,
            }
        }
        Commands::Agent { relay, name } => {
            let agent = Agent::new(AgentConfig {
                relay,
                name: name.clone(),
            });
            info!(name, "starting agent");

            tokio::select! {
                _ = &mut ctrl_c => info!("received Ctrl+C, shutting down"),
                result = agent.run() => result.context("agent stopped")?,
            }
        }
        Commands::Connect {
            relay,
            listen,
            addr,
            name,
            mux,
        } => {
            let connector = Connector::bind(ConnectorConfig {
                relay,
                listen: listen.clone(),
                addr,
                agent: name,
                mux,
            })
            .await
            .with_context(|| format!("failed to bind {listen}"))?;

            tokio::select! {
                _ = &mut ctrl_c => info!("received Ctrl+C, shutting down"),
                result = connector.run() => result.context("connector stopped")?,
            }
        }
    }

    Ok(())
}
