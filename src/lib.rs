//! OPUS-MT translation server
//!
//! Serves machine translation from pretrained Marian (OPUS-MT) models over
//! HTTP. Models are fetched from a Hugging Face compatible hub on first use
//! and kept in a bounded in-memory cache.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod core;
pub mod server;

// Re-export key types for convenience
pub use crate::core::{
    cache::ModelCache,
    config::ServiceConfig,
    errors::TranslationError,
    models::{GenerationConfig, LanguagePair, TranslationRequest, TranslationResponse},
    translator::Translator,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
