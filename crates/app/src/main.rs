//! peercoord - peer coordination from the terminal
//!
//! Runs a room relay, or joins a room through one and takes part in host
//! election and hand-off.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use peercoord_core::Room;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod media;
mod probe;
mod session;

use config::AppConfig;
use session::JoinOptions;

#[derive(Debug, Parser)]
#[command(name = "peercoord", version, about = "Peer coordination engine")]
struct Cli {
    /// Config file (defaults to peercoord.toml in the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a room relay
    Relay {
        /// Listen port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Join a room through a relay
    Join {
        /// Relay address, host:port
        #[arg(long)]
        relay: String,
        /// Room ID
        #[arg(long)]
        room: String,
        /// Human-readable room name
        #[arg(long, default_value = "")]
        name: String,
        /// Shared room secret
        #[arg(long)]
        token: String,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Relay { port } => {
                session::run_relay(port.unwrap_or(config.relay.port)).await
            }
            Command::Join {
                relay,
                room,
                name,
                token,
            } => {
                let name = if name.is_empty() { room.clone() } else { name };
                let opts = JoinOptions {
                    relay,
                    room: Room::new(room, name, token),
                };
                session::run_join(&config, opts).await
            }
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_join_arguments() {
        let cli = Cli::try_parse_from([
            "peercoord", "join", "--relay", "127.0.0.1:7331", "--room", "r1", "--token", "tok",
        ])
        .unwrap();
        match cli.command {
            Command::Join { room, name, .. } => {
                assert_eq!(room, "r1");
                assert!(name.is_empty());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_join_requires_token() {
        let parsed = Cli::try_parse_from(["peercoord", "join", "--relay", "x:1", "--room", "r1"]);
        assert!(parsed.is_err());
    }
}
