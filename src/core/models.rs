//! Core data models for translation

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use utoipa::ToSchema;

use crate::core::errors::{Result, TranslationError};

/// Prefix shared by every OPUS-MT model name
pub const MODEL_NAME_PREFIX: &str = "opus-mt";

fn language_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid language code pattern"))
}

/// Ordered (source, target) language pair selecting one translation model
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguagePair {
    /// Source language code
    pub src_lang: String,
    /// Target language code
    pub tgt_lang: String,
}

impl LanguagePair {
    /// Create a pair without validating it
    pub fn new(src_lang: impl Into<String>, tgt_lang: impl Into<String>) -> Self {
        Self {
            src_lang: src_lang.into(),
            tgt_lang: tgt_lang.into(),
        }
    }

    /// Check that both codes can be embedded in a model name.
    ///
    /// Codes end up in hub URLs and cache paths, so separators and path
    /// components are rejected here. Whether a model exists is only known
    /// once the repository is asked.
    pub fn validate(&self) -> Result<()> {
        for (field, code) in [("src_lang", &self.src_lang), ("tgt_lang", &self.tgt_lang)] {
            if !language_code_pattern().is_match(code) {
                return Err(TranslationError::InvalidLanguage {
                    field: field.to_string(),
                    code: code.clone(),
                });
            }
        }
        Ok(())
    }

    /// Model name, e.g. `opus-mt-en-fr`
    pub fn model_name(&self) -> String {
        format!("{}-{}-{}", MODEL_NAME_PREFIX, self.src_lang, self.tgt_lang)
    }

    /// Hub repository id, e.g. `Helsinki-NLP/opus-mt-en-fr`
    pub fn repo_id(&self, namespace: &str) -> String {
        format!("{}/{}", namespace, self.model_name())
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src_lang, self.tgt_lang)
    }
}

/// Translation request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TranslationRequest {
    /// Text to translate
    #[schema(example = "Hello world")]
    pub src_text: String,
    /// Source language code
    #[schema(example = "en")]
    pub src_lang: String,
    /// Target language code
    #[schema(example = "fr")]
    pub tgt_lang: String,
}

impl TranslationRequest {
    /// Create a request
    pub fn new(
        src_text: impl Into<String>,
        src_lang: impl Into<String>,
        tgt_lang: impl Into<String>,
    ) -> Self {
        Self {
            src_text: src_text.into(),
            src_lang: src_lang.into(),
            tgt_lang: tgt_lang.into(),
        }
    }

    /// The (source, target) pair this request asks for
    pub fn language_pair(&self) -> LanguagePair {
        LanguagePair::new(self.src_lang.clone(), self.tgt_lang.clone())
    }
}

/// Translation response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TranslationResponse {
    /// Translated text
    #[schema(example = "Bonjour le monde")]
    pub translated_text: String,
    /// Model name used for the translation
    #[schema(example = "opus-mt-en-fr")]
    pub model: String,
}

/// A model currently held by the cache
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoadedModelInfo {
    /// Model name
    pub model: String,
    /// When the model finished loading
    #[schema(value_type = String, format = DateTime)]
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

/// Decoding parameters.
///
/// `num_beams <= 1` selects incremental decoding; `temperature` switches
/// that path from argmax to sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens, EOS excluded
    pub max_new_tokens: usize,
    /// Beam width
    pub num_beams: usize,
    /// Exponent applied to hypothesis length when ranking finished beams
    pub length_penalty: f64,
    /// Sampling temperature; `None` decodes greedily
    pub temperature: Option<f64>,
    /// Nucleus sampling threshold
    pub top_p: Option<f64>,
    /// Sampling seed
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            num_beams: 4,
            length_penalty: 1.0,
            temperature: None,
            top_p: None,
            seed: 299792458,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding, mostly useful in tests and for low-latency setups
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            num_beams: 1,
            ..Default::default()
        }
    }
}

/// A loaded (tokenizer, model) pair able to translate text
pub trait TranslationModel: Send + Sync {
    /// Translate one text. Blocking; callers run it off the async runtime.
    fn translate(&self, text: &str, generation: &GenerationConfig) -> Result<String>;
}

/// Resolves a language pair to a loaded model
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Fetch and build the model for `pair`
    async fn load(&self, pair: &LanguagePair) -> Result<Arc<dyn TranslationModel>>;
}
