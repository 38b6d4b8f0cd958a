//! Command-line entry point for the relay agent.
//!
//! `register` performs the one-time enrollment handshake and writes the
//! identity file; `run` loads that file and starts the polling loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

mod client;
mod identity;
mod runner;

use client::RelayClient;
use identity::{AgentIdentity, DEFAULT_IDENTITY_PATH};
use runner::RunnerOptions;

#[derive(Debug, Parser)]
#[command(name = "runnel-agent", about = "Executes relayed commands on this machine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enroll this machine with a relay and store its credentials.
    Register {
        /// Base URL of the relay, e.g. https://relay.example.com
        #[arg(long, env = "RUNNEL_SERVER")]
        server: String,
        /// Human-readable machine name shown in rosters.
        #[arg(long)]
        name: String,
        #[arg(long, default_value = DEFAULT_IDENTITY_PATH)]
        identity_file: PathBuf,
    },
    /// Poll the relay and execute commands addressed to this machine.
    Run {
        #[arg(long, default_value = DEFAULT_IDENTITY_PATH)]
        identity_file: PathBuf,
        /// Seconds between polls when the queue is empty.
        #[arg(long, default_value_t = 300)]
        poll_interval: u64,
        /// Seconds a single script may run before it is killed.
        #[arg(long, default_value_t = 60)]
        execution_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "runnel_agent=info");
    }
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Commands::Register {
            server,
            name,
            identity_file,
        } => {
            let server = server.trim_end_matches('/').to_string();
            let granted = RelayClient::register(&server, &name)
                .await
                .context("registering with the relay")?;
            let identity = AgentIdentity {
                server_url: server,
                machine_id: granted.machine_id,
                secret: granted.secret,
                name: name.clone(),
            };
            identity.save(&identity_file)?;
            info!(
                machine_id = %identity.machine_id,
                path = %identity_file.display(),
                "machine registered"
            );
        }
        Commands::Run {
            identity_file,
            poll_interval,
            execution_timeout,
        } => {
            let identity = AgentIdentity::load(&identity_file)?;
            info!(
                machine_id = %identity.machine_id,
                server = %identity.server_url,
                name = %identity.name,
                "agent starting"
            );
            let client = RelayClient::new(
                identity.server_url,
                identity.machine_id,
                identity.secret,
            );
            let opts = RunnerOptions {
                poll_interval: Duration::from_secs(poll_interval),
                execution_timeout: Duration::from_secs(execution_timeout),
            };
            tokio::select! {
                result = runner::run_loop(client, opts) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                }
            }
        }
    }
    Ok(())
}
