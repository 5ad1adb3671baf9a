//! Ledger-Sync CLI Application
//!
//! A command-line interface for inspecting settings and exercising the
//! protocol handler against simulated peers.

use clap::{Parser, Subcommand};
use ledger_sync::cli::{self, SimulateOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ledger-sync")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Block and transaction synchronization for ledger nodes", long_about = None)]
struct Cli {
    /// Handler settings file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the handler against simulated peers
    Simulate {
        /// Number of simulated peers
        #[arg(short, long, default_value = "8")]
        peers: usize,

        /// Length of the chain the peers serve
        #[arg(short, long, default_value = "64")]
        blocks: u64,

        /// Transactions submitted after the sync
        #[arg(short, long, default_value = "16")]
        txs: usize,
    },

    /// Show the effective handler settings
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config => cli::cmd_config(cli.config.as_deref())?,

        Commands::Simulate { peers, blocks, txs } => {
            let settings = cli::load_settings(cli.config.as_deref())?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_simulate(settings, SimulateOptions { peers, blocks, txs }))?;
        }
    }

    Ok(())
}
