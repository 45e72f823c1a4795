//! Custom error types for translation operations

use thiserror::Error;

/// Translation-related errors
#[derive(Error, Debug)]
pub enum TranslationError {
    /// Language code cannot form a model name
    #[error("Invalid language code for {field}: {code:?}")]
    InvalidLanguage {
        /// Request field holding the code
        field: String,
        /// Rejected value
        code: String,
    },

    /// No pretrained model exists for the requested pair
    #[error("Model not found: {model_id}")]
    ModelNotFound {
        /// Hub repository id
        model_id: String,
    },

    /// The repository exists but lacks a file the loader asked for
    #[error("{file} not found in {model_id}")]
    ArtifactNotFound {
        /// Hub repository id
        model_id: String,
        /// Missing file name
        file: String,
    },

    /// Model artifacts were found but could not be loaded
    #[error("Failed to load model {model_id}: {message}")]
    ModelLoad {
        /// Hub repository id
        model_id: String,
        /// Details
        message: String,
    },

    /// Model hub returned an unexpected status
    #[error("API error: {status} - {message}")]
    ApiError {
        /// HTTP status
        status: u16,
        /// Details
        message: String,
    },

    /// Network error
    #[error("Network error: {message}")]
    NetworkError {
        /// Details
        message: String,
    },

    /// Tokenizer failed to encode or decode
    #[error("Tokenization error: {message}")]
    Tokenization {
        /// Details
        message: String,
    },

    /// Decoding loop failed
    #[error("Generation error: {message}")]
    Generation {
        /// Details
        message: String,
    },

    /// Input exceeds the configured token limit
    #[error("Input too long: {tokens} tokens exceeds limit of {max}")]
    InputTooLong {
        /// Encoded length
        tokens: usize,
        /// Configured limit
        max: usize,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Details
        message: String,
    },

    /// Wrapper for anyhow errors
    #[error("Internal error: {0}")]
    InternalError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Reqwest error
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Tensor runtime error
    #[error("Tensor error: {0}")]
    CandleError(#[from] candle_core::Error),

    /// Configuration source error
    #[error("Configuration source error: {0}")]
    ConfigSourceError(#[from] config::ConfigError),
}

impl TranslationError {
    /// Short machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TranslationError::InvalidLanguage { .. } => "invalid_language",
            TranslationError::ModelNotFound { .. } => "model_not_found",
            TranslationError::ModelLoad { .. } => "model_load_error",
            TranslationError::ArtifactNotFound { .. } => "artifact_not_found",
            TranslationError::ApiError { .. } | TranslationError::NetworkError { .. } => {
                "hub_error"
            }
            TranslationError::Tokenization { .. } => "tokenization_error",
            TranslationError::Generation { .. } | TranslationError::CandleError(_) => {
                "generation_error"
            }
            TranslationError::InputTooLong { .. } => "input_too_long",
            TranslationError::ConfigError { .. } | TranslationError::ConfigSourceError(_) => {
                "config_error"
            }
            _ => "internal_error",
        }
    }

    /// Whether the caller sent something unusable, as opposed to a server-side failure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TranslationError::InvalidLanguage { .. }
                | TranslationError::ModelNotFound { .. }
                | TranslationError::InputTooLong { .. }
        )
    }
}

impl From<anyhow::Error> for TranslationError {
    fn from(err: anyhow::Error) -> Self {
        TranslationError::InternalError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TranslationError {
    fn from(err: tokio::task::JoinError) -> Self {
        TranslationError::InternalError(format!("blocking task failed: {}", err))
    }
}

/// Result type for translation operations
pub type Result<T> = std::result::Result<T, TranslationError>;
