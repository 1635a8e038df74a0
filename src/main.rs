// Wordmeter - Main Entry Point
//
// Serves the metered token-streaming endpoint:
// - CLI interface
// - Config loading and validation
// - HTTP server with graceful shutdown

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use wordmeter::config::Config;
use wordmeter::logging::LogLevel;

/// Wordmeter: metered streaming-inference endpoint
#[derive(Parser, Debug)]
#[command(name = "wordmeter")]
#[command(author = "Wordmeter Contributors")]
#[command(version)]
#[command(about = "Rate-limited, word-metered token streaming server", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the TOML config file (default: ./wordmeter.toml)
    #[arg(short, long, global = true, env = "WORDMETER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server (default)
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.verbose {
        config.logging.level = LogLevel::Debug;
    }

    match args.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
                config.validate()?;
            }
            config.logging.init()?;
            info!("Wordmeter v{} starting...", env!("CARGO_PKG_VERSION"));
            wordmeter::api::serve(config).await?;
        }
        Commands::CheckConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            println!("# configuration is valid");
        }
    }

    Ok(())
}
