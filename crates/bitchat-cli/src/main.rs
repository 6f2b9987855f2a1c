//! BitChat Command-Line Interface
//!
//! Inspect the local identity and peer table, or run an in-memory mesh
//! simulation of the protocol core.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// BitChat - serverless mesh messaging
#[derive(Parser)]
#[command(name = "bitchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, default_value = "~/.bitchat")]
    data_dir: String,

    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the nickname from the configuration
    #[arg(short, long)]
    nickname: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current identity information (generated on first run)
    Identity,

    /// List stored peers
    Peers,

    /// Mark a stored peer as verified after comparing fingerprints
    Verify {
        /// Peer ID (16 hex characters)
        peer_id: String,

        /// Promote an already verified peer to trusted
        #[arg(long)]
        trusted: bool,
    },

    /// Block a stored peer
    Block {
        /// Peer ID (16 hex characters)
        peer_id: String,

        /// Lift the block instead
        #[arg(long)]
        undo: bool,
    },

    /// Run a line of in-memory nodes and send a message end to end
    Simulate {
        /// Number of nodes in the line (at least 2)
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Private message sent from the first node to the last
        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Override max_ttl from the configuration
        #[arg(long)]
        ttl: Option<u8>,

        /// Seconds to wait for each step
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Expand data directory
    let data_dir = shellexpand::tilde(&cli.data_dir).to_string();

    let mut config = commands::load_config(cli.config.as_deref())?;
    if let Some(nickname) = cli.nickname {
        config.nickname = nickname;
    }

    // If no command specified, show identity (auto-generates if needed)
    let command = cli.command.unwrap_or(Commands::Identity);

    match command {
        Commands::Identity => {
            commands::show_identity(&data_dir, &config)?;
        }
        Commands::Peers => {
            commands::list_peers(&data_dir)?;
        }
        Commands::Verify { peer_id, trusted } => {
            commands::verify_peer(&data_dir, &peer_id, trusted)?;
        }
        Commands::Block { peer_id, undo } => {
            commands::block_peer(&data_dir, &peer_id, !undo)?;
        }
        Commands::Simulate {
            nodes,
            message,
            ttl,
            timeout,
        } => {
            if let Some(ttl) = ttl {
                config.max_ttl = ttl;
            }
            commands::simulate(&data_dir, config, nodes, &message, timeout).await?;
        }
    }

    Ok(())
}
