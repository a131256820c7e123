//! Main entry point for Dialogue Translator CLI

#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dialogue_translator::cli::commands::{self, Commands};
use dialogue_translator::OrchestratorConfig;

/// Dialogue Translator - resilient subtitle translation tool
#[derive(Parser, Debug)]
#[command(name = "dialogue-translator", version, about, long_about = None)]
struct Args {
    /// JSON config file (default: environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// API key for Gemini (optional, defaults to GEMINI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the daily token limit
    #[arg(long)]
    daily_token_limit: Option<u64>,

    /// Override unique lines per batch request
    #[arg(long)]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("dialogue_translator={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(command) = args.command else {
        println!("Please specify a command. Use --help for more information.");
        return Ok(());
    };

    // Override config with CLI args if provided
    if let Some(api_key) = &args.api_key {
        std::env::set_var("GEMINI_API_KEY", api_key);
    }
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::load()?,
    };
    if let Some(api_key) = args.api_key {
        config.api_key = api_key;
    }
    if let Some(limit) = args.daily_token_limit {
        config.daily_token_limit = limit;
    }
    if let Some(size) = args.batch_size {
        config.batch_size = size;
    }

    // Execute command
    match command {
        Commands::Line { text, context } => {
            commands::handle_line(config, text, context).await?;
        }
        Commands::Stream { text, context } => {
            commands::handle_stream(config, text, context).await?;
        }
        Commands::File {
            file,
            output,
            fresh,
            context,
        } => {
            commands::handle_file(config, file, output, fresh, context).await?;
        }
        Commands::Server { host, port } => {
            commands::handle_server(config, host, port).await?;
        }
        Commands::Health { model, all } => {
            commands::handle_health(config, model, all).await?;
        }
        Commands::Reservoir => {
            commands::handle_reservoir(config).await?;
        }
    }

    Ok(())
}
