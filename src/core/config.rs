//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::GenerationConfig;

/// Prefix for environment overrides, e.g. `OPUS_MT_PORT`, `OPUS_MT_HUB__ENDPOINT`
pub const ENV_PREFIX: &str = "OPUS_MT";

/// Model hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Base URL of the hub
    pub endpoint: String,
    /// Organisation publishing the models
    pub namespace: String,
    /// Branch, tag or commit to download
    pub revision: String,
    /// Access token, `HF_TOKEN` by default
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Download cache
    pub cache_dir: PathBuf,
    /// Directory of pre-downloaded models, laid out as `<models_dir>/<model name>/<file>`
    pub models_dir: Option<PathBuf>,
    /// Per-request timeout, covering whole downloads
    pub timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            namespace: "Helsinki-NLP".to_string(),
            revision: "main".to_string(),
            token: std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty()),
            cache_dir: default_cache_dir(),
            models_dir: None,
            timeout_ms: 300_000,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var("HF_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(|_| PathBuf::from(".cache"))
        .join("opus-mt-server")
}

/// Tokenizer files inside a model repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum TokenizerFiles {
    /// SentencePiece models plus the shared `vocab.json`, as OPUS-MT publishes them
    SentencePiece {
        /// Source-side SentencePiece model
        source: String,
        /// Target-side SentencePiece model
        target: String,
        /// Piece to id mapping
        vocab: String,
    },
    /// `tokenizers` JSON files of a converted model
    Json {
        /// Encoder-side tokenizer
        source: String,
        /// Decoder-side tokenizer; the source tokenizer is reused when absent
        target: Option<String>,
    },
}

impl Default for TokenizerFiles {
    fn default() -> Self {
        Self::SentencePiece {
            source: "source.spm".to_string(),
            target: "target.spm".to_string(),
            vocab: "vocab.json".to_string(),
        }
    }
}

impl TokenizerFiles {
    /// Tokenizer files without duplicates
    pub fn all(&self) -> Vec<&str> {
        let mut files: Vec<&str> = match self {
            Self::SentencePiece { source, target, vocab } => {
                vec![source.as_str(), target.as_str(), vocab.as_str()]
            }
            Self::Json { source, target } => {
                let mut files = vec![source.as_str()];
                files.extend(target.as_deref());
                files
            }
        };
        dedup(&mut files);
        files
    }
}

fn dedup(files: &mut Vec<&str>) {
    let mut seen = std::collections::HashSet::new();
    files.retain(|file| seen.insert(*file));
}

/// File names looked up inside a model repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactFiles {
    /// Model configuration, present in every model repository
    pub config: String,
    /// Weight files tried in order; the first one the repository has is used
    pub weights: Vec<String>,
    /// Tokenizer layout
    pub tokenizer: TokenizerFiles,
}

impl Default for ArtifactFiles {
    fn default() -> Self {
        Self {
            config: "config.json".to_string(),
            weights: vec!["model.safetensors".to_string(), "pytorch_model.bin".to_string()],
            tokenizer: TokenizerFiles::default(),
        }
    }
}

/// Configuration for the translation service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Bind address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Upper bound on models held in memory, 0 for unbounded
    pub max_loaded_models: usize,
    /// Upper bound on generations running at once
    pub max_concurrent: usize,
    /// Longest accepted input, EOS included
    pub max_input_tokens: usize,
    /// Run on CUDA when available
    pub use_gpu: bool,
    /// Where models come from
    pub hub: HubConfig,
    /// Which files make up a model
    pub artifacts: ArtifactFiles,
    /// Decoding parameters
    pub generation: GenerationConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_loaded_models: 4,
            max_concurrent: 4,
            max_input_tokens: 512,
            use_gpu: false,
            hub: HubConfig::default(),
            artifacts: ArtifactFiles::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration: defaults, then the optional file, then `OPUS_MT_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(TranslationError::ConfigError {
                    message: format!("config file not found: {}", path.display()),
                });
            }
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;
        if config.hub.token.is_none() {
            config.hub.token = HubConfig::default().token;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(TranslationError::ConfigError {
                message: message.to_string(),
            })
        };

        if self.hub.endpoint.is_empty() {
            return invalid("hub.endpoint is required");
        }

        if self.hub.namespace.is_empty() {
            return invalid("hub.namespace is required");
        }

        if self.max_concurrent == 0 {
            return invalid("max_concurrent must be greater than 0");
        }

        if self.artifacts.weights.is_empty() {
            return invalid("artifacts.weights must name at least one file");
        }

        if self.max_input_tokens == 0 {
            return invalid("max_input_tokens must be greater than 0");
        }

        if self.generation.max_new_tokens == 0 {
            return invalid("generation.max_new_tokens must be greater than 0");
        }

        if self.generation.num_beams == 0 {
            return invalid("generation.num_beams must be greater than 0");
        }

        if let Some(temperature) = self.generation.temperature {
            if temperature <= 0.0 {
                return invalid("generation.temperature must be greater than 0");
            }
        }

        if let Some(top_p) = self.generation.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return invalid("generation.top_p must be in (0, 1]");
            }
        }

        if self.max_loaded_models == 0 {
            warn!("max_loaded_models is 0: loaded models are never evicted");
        }

        if self.generation.num_beams > 1 && self.generation.temperature.is_some() {
            warn!("generation.temperature is ignored when num_beams > 1");
        }

        Ok(())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
