//! mcpbridge — authenticated LLM chat gateway over a fleet of MCP tool
//! servers.

use clap::{Parser, Subcommand};
use mcpbridge_core::BridgeConfig;
use mcpbridge_gateway::start_gateway;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mcpbridge", about = "LLM chat gateway with MCP coordination")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Path to the JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Some(Commands::Serve { config, port, bind }) => serve(config, port, bind).await,
        Some(Commands::Version) => {
            println!("mcpbridge v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        // No subcommand = serve with defaults.
        None => serve(None, None, None).await,
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcpbridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &config_path {
        Some(path) => BridgeConfig::load(path),
        None => BridgeConfig::default(),
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

    start_gateway(config, api_key).await
}
