//! OPUS-MT (Marian) models on candle

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::marian::{self, MTModel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::{ArtifactFiles, ServiceConfig, TokenizerFiles};
use crate::core::errors::{Result, TranslationError};
use crate::core::generation::{self, SpecialTokens};
use crate::core::hub::ModelRepository;
use crate::core::models::{GenerationConfig, LanguagePair, ModelLoader, TranslationModel};
use crate::core::tokenizer::MarianTokenizer;

/// A loaded Marian encoder-decoder with its tokenizers
pub struct MarianModel {
    model: Mutex<MTModel>,
    tokens: SpecialTokens,
    tokenizer: MarianTokenizer,
    device: Device,
    max_input_tokens: usize,
}

impl MarianModel {
    /// Build the network from a variable store
    pub fn new(
        config: &marian::Config,
        vb: VarBuilder,
        tokenizer: MarianTokenizer,
        max_input_tokens: usize,
    ) -> Result<Self> {
        let device = vb.device().clone();
        let model = MTModel::new(config, vb)?;

        Ok(Self {
            model: Mutex::new(model),
            tokens: SpecialTokens::from_marian(config),
            tokenizer,
            device,
            max_input_tokens,
        })
    }

    /// Load from files already on disk
    pub fn from_files(
        config_path: &Path,
        weights_path: &Path,
        tokenizer: MarianTokenizer,
        device: &Device,
        max_input_tokens: usize,
    ) -> Result<Self> {
        let config = parse_config(&std::fs::read(config_path)?)?;
        let tensors = load_weights(weights_path, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);

        Self::new(&config, vb, tokenizer, max_input_tokens)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        // A single-element batch: padding to the longest element changes nothing
        let mut ids = self.tokenizer.encode(text)?;
        if ids.is_empty() {
            return Ok(ids);
        }
        // Marian encoders expect an EOS terminator regardless of tokenizer post-processing
        if ids.last().copied() != Some(self.tokens.eos) {
            ids.push(self.tokens.eos);
        }

        if ids.len() > self.max_input_tokens {
            return Err(TranslationError::InputTooLong {
                tokens: ids.len(),
                max: self.max_input_tokens,
            });
        }
        Ok(ids)
    }

    fn generate_ids(&self, input_ids: &[u32], generation_config: &GenerationConfig) -> Result<Vec<u32>> {
        let mut model = self.model.lock();
        model.reset_kv_cache();

        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let encoder_output = model.encoder().forward(&input, 0)?;
        generation::generate(
            &mut *model,
            &encoder_output,
            self.tokens,
            generation_config,
            &self.device,
        )
    }
}

impl TranslationModel for MarianModel {
    fn translate(&self, text: &str, generation_config: &GenerationConfig) -> Result<String> {
        let input_ids = self.encode(text)?;
        if input_ids.is_empty() {
            return Ok(String::new());
        }
        debug!("Encoded {} input tokens", input_ids.len());

        let output_ids = self.generate_ids(&input_ids, generation_config)?;
        self.tokenizer.decode(&output_ids)
    }
}

/// Parse a hub `config.json`, filling fields that older exports omit
pub fn parse_config(bytes: &[u8]) -> Result<marian::Config> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(object) = value.as_object_mut() {
        let eos = object.get("eos_token_id").cloned().unwrap_or(serde_json::json!(0));
        object.entry("forced_eos_token_id").or_insert(eos);
        object.entry("share_encoder_decoder_embeddings").or_insert(serde_json::json!(true));
        object.entry("use_cache").or_insert(serde_json::json!(true));
        object.entry("is_encoder_decoder").or_insert(serde_json::json!(true));
        object.entry("scale_embedding").or_insert(serde_json::json!(true));
    }
    Ok(serde_json::from_value(value)?)
}

/// Read safetensors or PyTorch (`.bin`, `.pt`, `.pth`) weights
pub fn load_weights(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("bin" | "pt" | "pth") => candle_core::pickle::read_all(path)?
            .into_iter()
            .map(|(name, tensor)| Ok::<_, TranslationError>((name, tensor.to_device(device)?)))
            .collect(),
        _ => Ok(candle_core::safetensors::load(path, device)?),
    }
}

/// Pick CUDA when requested and available, otherwise CPU
pub fn select_device(use_gpu: bool) -> Result<Device> {
    if use_gpu {
        let device = Device::cuda_if_available(0)?;
        if device.is_cpu() {
            info!("CUDA not available, running on CPU");
        }
        Ok(device)
    } else {
        Ok(Device::Cpu)
    }
}

/// Local paths of the tokenizer files of one model
#[derive(Debug, Clone)]
pub enum TokenizerPaths {
    /// SentencePiece models and vocabulary
    SentencePiece {
        /// Source-side model
        source: PathBuf,
        /// Target-side model
        target: PathBuf,
        /// Vocabulary
        vocab: PathBuf,
    },
    /// `tokenizers` JSON files
    Json {
        /// Encoder-side tokenizer
        source: PathBuf,
        /// Decoder-side tokenizer
        target: PathBuf,
    },
}

impl TokenizerPaths {
    /// Load the tokenizers
    pub fn load(&self) -> Result<MarianTokenizer> {
        match self {
            Self::SentencePiece { source, target, vocab } => {
                MarianTokenizer::sentencepiece(source, target, vocab)
            }
            Self::Json { source, target } => MarianTokenizer::json(source, target),
        }
    }
}

/// Every artifact of a model, on local disk
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// `config.json`
    pub config: PathBuf,
    /// Weights
    pub weights: PathBuf,
    /// Tokenizer files
    pub tokenizer: TokenizerPaths,
}

impl ModelFiles {
    /// All paths, without duplicates
    pub fn paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.config.as_path(), self.weights.as_path()];
        match &self.tokenizer {
            TokenizerPaths::SentencePiece { source, target, vocab } => {
                paths.extend([source.as_path(), target.as_path(), vocab.as_path()])
            }
            TokenizerPaths::Json { source, target } => paths.extend([source.as_path(), target.as_path()]),
        }
        let mut seen = std::collections::HashSet::new();
        paths.retain(|path| seen.insert(*path));
        paths
    }
}

/// Loads Marian models from the model repository
pub struct MarianLoader {
    repository: ModelRepository,
    files: ArtifactFiles,
    device: Device,
    max_input_tokens: usize,
}

impl MarianLoader {
    /// Create a loader over a repository
    pub fn new(repository: ModelRepository, files: ArtifactFiles, device: Device, max_input_tokens: usize) -> Self {
        Self {
            repository,
            files,
            device,
            max_input_tokens,
        }
    }

    /// Create from service configuration
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let repository = ModelRepository::new(config.hub.clone())?;
        let device = select_device(config.use_gpu)?;
        Ok(Self::new(repository, config.artifacts.clone(), device, config.max_input_tokens))
    }

    async fn resolve(&self, repo_id: &str, file: &str) -> Result<PathBuf> {
        self.repository.resolve(repo_id, file).await
    }

    async fn resolve_weights(&self, repo_id: &str) -> Result<PathBuf> {
        for file in &self.files.weights {
            match self.resolve(repo_id, file).await {
                Ok(path) => return Ok(path),
                Err(TranslationError::ArtifactNotFound { .. }) => {
                    debug!("{} has no {}, trying the next weights file", repo_id, file)
                }
                Err(e) => return Err(e),
            }
        }
        Err(TranslationError::ArtifactNotFound {
            model_id: repo_id.to_string(),
            file: self.files.weights.join(" or "),
        })
    }

    async fn resolve_tokenizer(&self, repo_id: &str) -> Result<TokenizerPaths> {
        Ok(match &self.files.tokenizer {
            TokenizerFiles::SentencePiece { source, target, vocab } => TokenizerPaths::SentencePiece {
                source: self.resolve(repo_id, source).await?,
                target: self.resolve(repo_id, target).await?,
                vocab: self.resolve(repo_id, vocab).await?,
            },
            TokenizerFiles::Json { source, target } => {
                let source_path = self.resolve(repo_id, source).await?;
                let target_path = match target {
                    Some(file) => self.resolve(repo_id, file).await?,
                    None => source_path.clone(),
                };
                TokenizerPaths::Json {
                    source: source_path,
                    target: target_path,
                }
            }
        })
    }

    /// Make sure every artifact of a model is on disk.
    ///
    /// A repository without a model config is reported as a missing model;
    /// any other missing file means the model exists but cannot be loaded.
    pub async fn fetch(&self, pair: &LanguagePair) -> Result<ModelFiles> {
        let repo_id = pair.repo_id(self.repository.namespace());

        let config = self.resolve(&repo_id, &self.files.config).await.map_err(|e| match e {
            TranslationError::ArtifactNotFound { model_id, .. } => TranslationError::ModelNotFound { model_id },
            other => other,
        })?;

        let rest = async {
            Ok::<_, TranslationError>((
                self.resolve_weights(&repo_id).await?,
                self.resolve_tokenizer(&repo_id).await?,
            ))
        };
        let (weights, tokenizer) = rest.await.map_err(|e| match e {
            TranslationError::ArtifactNotFound { model_id, file } => TranslationError::ModelLoad {
                model_id,
                message: format!("repository has no {}", file),
            },
            other => other,
        })?;

        Ok(ModelFiles {
            config,
            weights,
            tokenizer,
        })
    }
}

#[async_trait]
impl ModelLoader for MarianLoader {
    async fn load(&self, pair: &LanguagePair) -> Result<Arc<dyn TranslationModel>> {
        let repo_id = pair.repo_id(self.repository.namespace());
        let files = self.fetch(pair).await?;

        let device = self.device.clone();
        let max_input_tokens = self.max_input_tokens;
        let model = tokio::task::spawn_blocking(move || {
            let tokenizer = files.tokenizer.load()?;
            MarianModel::from_files(&files.config, &files.weights, tokenizer, &device, max_input_tokens)
        })
        .await?
        .map_err(|e| match e {
            TranslationError::Tokenization { .. } => e,
            other => TranslationError::ModelLoad {
                model_id: repo_id.clone(),
                message: other.to_string(),
            },
        })?;

        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hub::tests::{hub_config, serve_dir};
    use candle_core::IndexOp;
    use candle_nn::VarMap;
    use std::str::FromStr;
    use tokenizers::Tokenizer;

    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "<unk>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": "<pad>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"</s>": 0, "<unk>": 1, "<pad>": 2, "hello": 3, "world": 4, "bonjour": 5, "monde": 6, "le": 7},
            "unk_token": "<unk>"
        }
    }"#;

    const CONFIG_JSON: &str = r#"{
        "vocab_size": 8,
        "decoder_vocab_size": 8,
        "max_position_embeddings": 32,
        "encoder_layers": 1,
        "encoder_ffn_dim": 8,
        "encoder_attention_heads": 2,
        "decoder_layers": 1,
        "decoder_ffn_dim": 8,
        "decoder_attention_heads": 2,
        "use_cache": true,
        "is_encoder_decoder": true,
        "activation_function": "swish",
        "d_model": 4,
        "decoder_start_token_id": 2,
        "scale_embedding": true,
        "pad_token_id": 2,
        "eos_token_id": 0,
        "forced_eos_token_id": 0,
        "share_encoder_decoder_embeddings": true
    }"#;

    const BONJOUR: u32 = 5;

    fn json_tokenizer() -> MarianTokenizer {
        let tokenizer = Tokenizer::from_str(TOKENIZER_JSON).unwrap();
        MarianTokenizer::Json {
            source: tokenizer.clone(),
            target: tokenizer,
        }
    }

    /// A tiny model with all-zero weights: every logit ties, so decoding is
    /// deterministic but meaningless
    fn zero_model(max_input_tokens: usize) -> MarianModel {
        let config = parse_config(CONFIG_JSON.as_bytes()).unwrap();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        MarianModel::new(&config, vb, json_tokenizer(), max_input_tokens).unwrap()
    }

    /// Variables of the tiny model filled with small deterministic values.
    /// `favoured` gets a large output bias so greedy decoding keeps picking it.
    fn seeded_varmap(favoured: Option<u32>) -> VarMap {
        let config = parse_config(CONFIG_JSON.as_bytes()).unwrap();
        let varmap = VarMap::new();
        MTModel::new(&config, VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu)).unwrap();

        let vars = varmap.data().lock().unwrap();
        for (name, var) in vars.iter() {
            let offset: f32 = name.bytes().map(f32::from).sum();
            let values: Vec<f32> = (0..var.elem_count())
                .map(|i| ((i as f32) * 0.61 + offset).sin() * 0.1)
                .collect();
            var.set(&Tensor::from_vec(values, var.dims(), &Device::Cpu).unwrap()).unwrap();
        }
        if let Some(token) = favoured {
            let bias = vars.get("final_logits_bias").unwrap();
            let mut values = vec![0f32; bias.elem_count()];
            values[token as usize] = 50.0;
            bias.set(&Tensor::from_vec(values, bias.dims(), &Device::Cpu).unwrap()).unwrap();
        }
        drop(vars);
        varmap
    }

    fn seeded_model(favoured: Option<u32>) -> MarianModel {
        let config = parse_config(CONFIG_JSON.as_bytes()).unwrap();
        let varmap = seeded_varmap(favoured);
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MarianModel::new(&config, vb, json_tokenizer(), 16).unwrap()
    }

    #[test]
    fn test_encode_appends_eos() {
        let model = zero_model(16);
        assert_eq!(model.encode("hello world").unwrap(), vec![3, 4, 0]);
        assert!(model.encode("").unwrap().is_empty());
    }

    #[test]
    fn test_input_length_guard() {
        let model = zero_model(3);
        assert!(model.encode("hello world").is_ok());

        let err = model.encode("hello world hello").unwrap_err();
        assert!(matches!(err, TranslationError::InputTooLong { tokens: 4, max: 3 }));
    }

    #[test]
    fn test_empty_input_translates_to_empty() {
        let model = zero_model(16);
        let out = model.translate("", &GenerationConfig::greedy(4)).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn test_generation_terminates_within_budget() {
        let model = zero_model(16);

        let greedy = model.translate("hello world", &GenerationConfig::greedy(4)).unwrap();
        assert!(greedy.split_whitespace().count() <= 4);

        let beam = GenerationConfig {
            num_beams: 2,
            max_new_tokens: 4,
            ..GenerationConfig::default()
        };
        let out = model.translate("hello world", &beam).unwrap();
        assert!(out.split_whitespace().count() <= 4);
    }

    #[test]
    fn test_multi_token_decode_uses_kv_cache() {
        let model = seeded_model(Some(BONJOUR));

        let ids = model
            .generate_ids(&model.encode("hello world").unwrap(), &GenerationConfig::greedy(3))
            .unwrap();
        assert_eq!(ids, vec![BONJOUR; 3]);

        let greedy = model.translate("hello world", &GenerationConfig::greedy(3)).unwrap();
        assert_eq!(greedy, "bonjour bonjour bonjour");

        let beam = GenerationConfig {
            num_beams: 2,
            max_new_tokens: 3,
            ..GenerationConfig::default()
        };
        assert_eq!(model.translate("hello world", &beam).unwrap(), greedy);

        // The cache left behind by the previous run is reset
        assert_eq!(model.translate("hello world", &GenerationConfig::greedy(3)).unwrap(), greedy);
    }

    #[test]
    fn test_incremental_decode_matches_full_redecode() {
        let model = seeded_model(None);
        let input_ids = model.encode("hello world le monde").unwrap();
        let steps = 6;

        let incremental = model.generate_ids(&input_ids, &GenerationConfig::greedy(steps)).unwrap();

        let mut mt = model.model.lock();
        mt.reset_kv_cache();
        let input = Tensor::new(input_ids.as_slice(), &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        let encoder_output = mt.encoder().forward(&input, 0).unwrap();

        let mut ids = vec![model.tokens.decoder_start];
        for _ in 0..steps {
            mt.reset_kv_cache();
            let prefix = Tensor::new(ids.as_slice(), &Device::Cpu).unwrap().unsqueeze(0).unwrap();
            let logits: Vec<f32> = mt
                .decode(&prefix, &encoder_output, 0)
                .unwrap()
                .i((0, ids.len() - 1))
                .unwrap()
                .to_vec1()
                .unwrap();
            let next = logits
                .iter()
                .enumerate()
                .filter(|(id, _)| *id as u32 != model.tokens.pad)
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(id, _)| id as u32)
                .unwrap();
            if model.tokens.is_eos(next) {
                break;
            }
            ids.push(next);
        }

        assert_eq!(incremental, ids[1..].to_vec());
    }

    #[test]
    fn test_parse_config_fills_missing_fields() {
        let mut value: serde_json::Value = serde_json::from_str(CONFIG_JSON).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("forced_eos_token_id");
        object.remove("share_encoder_decoder_embeddings");
        object.insert("architectures".to_string(), serde_json::json!(["MarianMTModel"]));

        let config = parse_config(value.to_string().as_bytes()).unwrap();
        assert_eq!(config.forced_eos_token_id, 0);
        assert!(config.share_encoder_decoder_embeddings);
        assert_eq!(SpecialTokens::from_marian(&config).decoder_start, 2);
    }

    #[test]
    fn test_select_device_cpu() {
        assert!(select_device(false).unwrap().is_cpu());
    }

    fn publish(root: &Path, repo_id: &str, file: &str, contents: &[u8]) {
        let dir = root.join(repo_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), contents).unwrap();
    }

    fn json_layout() -> ArtifactFiles {
        ArtifactFiles {
            weights: vec!["model.bin".to_string(), "model.safetensors".to_string()],
            tokenizer: TokenizerFiles::Json {
                source: "tokenizer.json".to_string(),
                target: None,
            },
            ..ArtifactFiles::default()
        }
    }

    async fn loader(hub: &Path, cache: &Path, files: ArtifactFiles) -> MarianLoader {
        let addr = serve_dir(hub.to_path_buf()).await;
        let repository = ModelRepository::new(hub_config(format!("http://{}", addr), cache)).unwrap();
        MarianLoader::new(repository, files, Device::Cpu, 16)
    }

    #[tokio::test]
    async fn test_loader_end_to_end_with_weights_fallback() {
        let hub = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let repo_id = "Helsinki-NLP/opus-mt-en-fr";
        publish(hub.path(), repo_id, "config.json", CONFIG_JSON.as_bytes());
        publish(hub.path(), repo_id, "tokenizer.json", TOKENIZER_JSON.as_bytes());
        let weights = hub.path().join(repo_id).join("model.safetensors");
        seeded_varmap(Some(BONJOUR)).save(&weights).unwrap();

        let loader = loader(hub.path(), cache.path(), json_layout()).await;
        let model = loader.load(&LanguagePair::new("en", "fr")).await.unwrap();

        let out = model.translate("hello world", &GenerationConfig::greedy(2)).unwrap();
        assert_eq!(out, "bonjour bonjour");

        let files = loader.fetch(&LanguagePair::new("en", "fr")).await.unwrap();
        assert!(files.weights.ends_with("model.safetensors"));
        assert_eq!(files.paths().len(), 3);
    }

    #[tokio::test]
    async fn test_loader_missing_artifact_is_a_load_error() {
        let hub = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        publish(hub.path(), "Helsinki-NLP/opus-mt-en-fr", "config.json", CONFIG_JSON.as_bytes());

        let loader = loader(hub.path(), cache.path(), ArtifactFiles::default()).await;
        let err = loader.load(&LanguagePair::new("en", "fr")).await.err().unwrap();
        match err {
            TranslationError::ModelLoad { model_id, message } => {
                assert_eq!(model_id, "Helsinki-NLP/opus-mt-en-fr");
                assert!(message.contains("model.safetensors or pytorch_model.bin"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_loader_missing_model_is_not_found() {
        let hub = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        publish(hub.path(), "Helsinki-NLP/opus-mt-en-de", "README.md", b"no model here");

        let loader = loader(hub.path(), cache.path(), ArtifactFiles::default()).await;

        let err = loader.load(&LanguagePair::new("en", "zz")).await.err().unwrap();
        assert!(matches!(err, TranslationError::ModelNotFound { ref model_id } if model_id == "Helsinki-NLP/opus-mt-en-zz"));

        let err = loader.load(&LanguagePair::new("en", "de")).await.err().unwrap();
        assert!(matches!(err, TranslationError::ModelNotFound { .. }));
    }
}
