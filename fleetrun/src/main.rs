//! fleetrun - command-line front end for fleet bring-up and remote execution.
//!
//! Configuration comes from the environment (`VM_*`, `BRIDGE_TIMEOUT`,
//! `FLEETRUN_*`); see `fleetrun_common::config`.

#![forbid(unsafe_code)]

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetrun_common::{FleetConfig, LogConfig, init_logging};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "fleetrun")]
#[command(author, version, about = "Drive a host agent across a test fleet over ssh")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show host roles and addresses
    Topology {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Probe every host for network, shell and agent readiness
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Leave storage nodes out
        #[arg(long)]
        exclude_storage: bool,
    },

    /// Fail unless every host is reachable with the agent installed
    Verify {
        /// Leave storage nodes out
        #[arg(long)]
        exclude_storage: bool,
    },

    /// Wait until every host answers ping and ssh
    Wait {
        /// Overall deadline per host
        #[arg(long, default_value = "180")]
        timeout_secs: u64,

        /// Delay between polls
        #[arg(long, default_value = "2")]
        interval_secs: u64,

        /// Leave storage nodes out
        #[arg(long)]
        exclude_storage: bool,
    },

    /// Run a command on one host, directly or through the relay
    Exec {
        /// Host to run on directly: an address or a name like `worker1`
        #[arg(long, conflicts_with = "relay_to")]
        host: Option<String>,

        /// Run on this host through the relay
        #[arg(long)]
        relay_to: Option<String>,

        /// Timeout in milliseconds; defaults to BRIDGE_TIMEOUT
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Command to run. A single argument is sent as a shell line as-is;
        /// several arguments are quoted one by one and joined.
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env()
        .context("Failed to read logging configuration")?
        .verbose(cli.verbose);
    let _guards = init_logging(&log_config).context("Failed to initialize logging")?;

    let config = FleetConfig::from_env().context("Failed to load fleet configuration")?;

    match cli.command {
        Commands::Topology { json } => commands::topology(&config, json),
        Commands::Status {
            json,
            exclude_storage,
        } => commands::status(&config, json, !exclude_storage).await,
        Commands::Verify { exclude_storage } => {
            commands::verify(&config, !exclude_storage).await
        }
        Commands::Wait {
            timeout_secs,
            interval_secs,
            exclude_storage,
        } => commands::wait(&config, timeout_secs, interval_secs, !exclude_storage).await,
        Commands::Exec {
            host,
            relay_to,
            timeout_ms,
            command,
        } => {
            let target = match (host, relay_to) {
                (_, Some(target)) => commands::ExecTarget::Relayed(target),
                (Some(host), None) => commands::ExecTarget::Direct(host),
                (None, None) => commands::ExecTarget::Relay,
            };
            commands::exec(&config, target, timeout_ms, &commands::command_line(&command)).await
        }
    }
}
