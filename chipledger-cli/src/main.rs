//! Chip ledger command-line tool.
//!
//! Usage:
//!   chipledger settle balances.json
//!   chipledger inspect --dir ./data --user ana
//!   chipledger sync --dir ./data --user ana --remote https://ledger.example.com

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use chipledger_cli::{
    AppConfig, inspect_report, open_store, parse_balances, repair_store, settle_report, sync_once,
};
use chipledger_types::MinorUnits;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "chipledger")]
#[command(about = "Track poker sessions and settle who owes whom")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the transfers that settle a balance list or a session file
    Settle {
        file: PathBuf,

        /// Residual (in minor units) accepted without a warning
        #[arg(long)]
        tolerance: Option<i64>,
    },
    /// Show what the local store holds
    Inspect {
        #[arg(short, long, default_value = "chipledger-data")]
        dir: PathBuf,
        #[arg(short, long)]
        user: String,
    },
    /// Rewrite the local store after repairing or migrating it
    Repair {
        #[arg(short, long, default_value = "chipledger-data")]
        dir: PathBuf,
        #[arg(short, long)]
        user: String,
    },
    /// Run one sync cycle against the remote store
    Sync {
        #[arg(short, long, default_value = "chipledger-data")]
        dir: PathBuf,
        #[arg(short, long)]
        user: String,

        /// Remote base URL, overriding the configuration file
        #[arg(long)]
        remote: Option<String>,

        /// Bearer token for the remote store
        #[arg(long, env = "CHIPLEDGER_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let mut config = AppConfig::load(args.config.as_deref());

    match args.command {
        Command::Settle { file, tolerance } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let sheet = parse_balances(&raw)?;
            let tolerance = tolerance.unwrap_or(config.sync.balance_tolerance);
            println!("{}", settle_report(&sheet, MinorUnits::new(tolerance)));
        }
        Command::Inspect { dir, user } => {
            let store = open_store(&dir, &user, &config.store)?;
            println!("{}", inspect_report(&store));
        }
        Command::Repair { dir, user } => {
            let store = open_store(&dir, &user, &config.store)?;
            println!("{}", repair_store(&store)?);
        }
        Command::Sync {
            dir,
            user,
            remote,
            token,
        } => {
            if let Some(remote) = remote {
                config.remote.base_url = remote;
            }
            if token.is_some() {
                config.remote.token = token;
            }
            info!("Syncing {} against {}", user, config.remote.base_url);
            println!("{}", sync_once(&dir, &user, &config).await?);
        }
    }

    Ok(())
}
