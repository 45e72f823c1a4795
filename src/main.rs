//! Main entry point for the OPUS-MT translation server

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opus_mt_server::cli::commands::{self, Commands};
use opus_mt_server::ServiceConfig;

/// OPUS-MT translation server
#[derive(Parser, Debug)]
#[command(name = "opus-mt-server", version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

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
    let crate_target = env!("CARGO_PKG_NAME").replace('-', "_");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}={},tower_http={}", crate_target, log_level, log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::load(args.config.as_deref())?;

    // Execute command
    match args.command {
        Some(Commands::Serve { host, port }) => {
            commands::handle_serve(config, host, port).await?;
        }
        Some(Commands::Translate {
            src_lang,
            tgt_lang,
            text,
        }) => {
            commands::handle_translate(config, src_lang, tgt_lang, text).await?;
        }
        Some(Commands::Download { src_lang, tgt_lang }) => {
            commands::handle_download(config, src_lang, tgt_lang).await?;
        }
        Some(Commands::Config) => {
            commands::handle_config(&config)?;
        }
        None => {
            println!("Please specify a command. Use --help for more information.");
        }
    }

    Ok(())
}
