//! Lantern CLI
//!
//! Circuit relay node with address discovery

mod config;

use clap::{Parser, Subcommand};
use lantern_crypto::Identity;
use lantern_node::Node;
use lantern_transport::TcpTransport;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::Config;

/// Lantern - relay circuits for peers that cannot reach each other directly
#[derive(Parser)]
#[command(name = "lantern")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: ~/.config/lantern/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay node until Ctrl+C
    Run {
        /// Listen multiaddr (repeatable, overrides the config file)
        #[arg(short, long)]
        listen: Vec<String>,
    },

    /// Generate a new identity key
    Keygen {
        /// Output file for the key (default: the configured identity file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the peer id of the configured identity
    PeerId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // RUST_LOG wins over --verbose and the config file
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Run { listen } => {
            let mut config = config;
            if !listen.is_empty() {
                config.network.listen = listen;
            }
            config.validate()?;
            run_node(&config).await?;
        }
        Commands::Keygen { output } => {
            generate_identity(output, &config)?;
        }
        Commands::PeerId => {
            show_peer_id(&config)?;
        }
    }

    Ok(())
}

/// Run the node until interrupted
async fn run_node(config: &Config) -> anyhow::Result<()> {
    let identity = Arc::new(Identity::load_or_generate(&config.node.identity_file)?);
    let transport = Arc::new(TcpTransport::new(Arc::clone(&identity)));

    for neighbour in config.neighbours()? {
        transport.add_peer_addr(neighbour.peer, &neighbour.addr)?;
    }

    let node = Node::new(identity, transport, config.to_node_config()?)?;
    node.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    })
    .await?;

    Ok(())
}

/// Generate and save a new identity
fn generate_identity(output: Option<PathBuf>, config: &Config) -> anyhow::Result<()> {
    let path = output.unwrap_or_else(|| config.node.identity_file.clone());
    if path.exists() {
        anyhow::bail!("Refusing to overwrite existing identity at {}", path.display());
    }

    let identity = Identity::generate();
    identity.save(&path)?;

    println!("PeerID: {}", identity.peer_id());
    println!("Identity saved to: {}", path.display());
    Ok(())
}

/// Print the configured identity's peer id
fn show_peer_id(config: &Config) -> anyhow::Result<()> {
    let path = &config.node.identity_file;
    let identity = Identity::load(path).map_err(|e| {
        anyhow::anyhow!(
            "Cannot read identity at {} ({e}); run `lantern keygen` first",
            path.display()
        )
    })?;
    println!("{}", identity.peer_id());
    Ok(())
}
