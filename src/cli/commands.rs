//! CLI command definitions and handlers

use clap::Subcommand;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::core::config::ServiceConfig;
use crate::core::hub::ModelRepository;
use crate::core::marian::{select_device, MarianLoader};
use crate::core::models::{LanguagePair, TranslationRequest};
use crate::core::translator::Translator;

/// Commands for the OPUS-MT server
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP API server
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Translate a single text and print the result
    Translate {
        /// Source language code
        #[arg(short, long)]
        src_lang: String,

        /// Target language code
        #[arg(short, long)]
        tgt_lang: String,

        /// Text to translate
        text: String,
    },

    /// Download model artifacts for a language pair ahead of time
    Download {
        /// Source language code
        #[arg(short, long)]
        src_lang: String,

        /// Target language code
        #[arg(short, long)]
        tgt_lang: String,
    },

    /// Print the effective configuration
    Config,
}

/// Handle server command
pub async fn handle_serve(
    mut config: ServiceConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    use crate::server::api::run_server;

    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    info!("Starting HTTP server on {}:{}", config.host, config.port);
    println!("🚀 Server starting on http://{}:{}", config.host, config.port);
    println!("📊 API Documentation: http://{}:{}/swagger", config.host, config.port);

    run_server(config).await?;

    Ok(())
}

/// Handle one-shot translation command
pub async fn handle_translate(
    config: ServiceConfig,
    src_lang: String,
    tgt_lang: String,
    text: String,
) -> anyhow::Result<()> {
    let start_time = Instant::now();
    let translator = Translator::from_config(&config)?;

    let response = translator
        .translate(&TranslationRequest::new(text, src_lang, tgt_lang))
        .await?;

    info!("Translated with {} in {:?}", response.model, start_time.elapsed());
    println!("{}", response.translated_text);

    Ok(())
}

/// Handle download command
pub async fn handle_download(
    config: ServiceConfig,
    src_lang: String,
    tgt_lang: String,
) -> anyhow::Result<()> {
    let pair = LanguagePair::new(src_lang, tgt_lang);
    pair.validate()?;

    let repository = ModelRepository::new(config.hub.clone())?.with_progress(true);
    let loader = MarianLoader::new(
        repository,
        config.artifacts.clone(),
        select_device(config.use_gpu)?,
        config.max_input_tokens,
    );

    info!("Fetching {}", pair.repo_id(&config.hub.namespace));
    let files = loader.fetch(&pair).await?;

    println!("\n✅ {} ready", pair.model_name());
    for path in files.paths() {
        println!("   {}", path.display());
    }

    // Loading once proves the artifacts are usable, not just present
    let translator = Translator::new(Arc::new(loader), &config)?;
    translator.warm_up(&pair).await?;
    println!("   Model loads successfully");

    Ok(())
}

/// Handle config command
pub fn handle_config(config: &ServiceConfig) -> anyhow::Result<()> {
    print!("{}", config.to_yaml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_parse_translate() {
        let cli = Cli::try_parse_from(["opus-mt-server", "translate", "-s", "en", "-t", "fr", "Hello"]).unwrap();
        match cli.command {
            Commands::Translate { src_lang, tgt_lang, text } => {
                assert_eq!(src_lang, "en");
                assert_eq!(tgt_lang, "fr");
                assert_eq!(text, "Hello");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::try_parse_from(["opus-mt-server", "serve", "--port", "9000"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { host: None, port: Some(9000) }));
    }

    #[test]
    fn test_download_requires_languages() {
        assert!(Cli::try_parse_from(["opus-mt-server", "download", "-s", "en"]).is_err());
    }
}
