//! Translation service: admission control, model resolution and generation

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::core::cache::ModelCache;
use crate::core::config::ServiceConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::marian::MarianLoader;
use crate::core::models::{
    GenerationConfig, LanguagePair, LoadedModelInfo, ModelLoader, TranslationRequest,
    TranslationResponse,
};

/// Translator shared by every request handler
pub struct Translator {
    cache: ModelCache,
    semaphore: Arc<Semaphore>,
    generation: GenerationConfig,
}

impl Translator {
    /// Create a translator over any model loader
    pub fn new(loader: Arc<dyn ModelLoader>, config: &ServiceConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            cache: ModelCache::with_max_models(loader, config.max_loaded_models),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            generation: config.generation.clone(),
        })
    }

    /// Create a translator backed by Marian models from the hub
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let loader = MarianLoader::from_config(config)?;
        Self::new(Arc::new(loader), config)
    }

    /// Translate a single request
    pub async fn translate(&self, request: &TranslationRequest) -> Result<TranslationResponse> {
        let pair = request.language_pair();
        pair.validate()?;

        let cached = self.cache.get_model(&pair).await?;
        let model = cached.model.clone();

        // Bound in-flight generations only; a slow load must not hold a permit
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| TranslationError::InternalError(e.to_string()))?;
        let generation = self.generation.clone();
        let text = request.src_text.clone();

        debug!("Translating {} chars with {}", text.len(), pair.model_name());
        let started = std::time::Instant::now();
        let translated_text =
            tokio::task::spawn_blocking(move || model.translate(&text, &generation)).await??;
        info!("Translated {} in {:?}", pair, started.elapsed());

        Ok(TranslationResponse {
            translated_text,
            model: pair.model_name(),
        })
    }

    /// Resolve (and load if needed) the model for a pair without translating
    pub async fn warm_up(&self, pair: &LanguagePair) -> Result<String> {
        pair.validate()?;
        self.cache.get_model(pair).await?;
        Ok(pair.model_name())
    }

    /// Models currently held in memory
    pub fn loaded_models(&self) -> Vec<LoadedModelInfo> {
        self.cache.loaded()
    }

    /// Decoding parameters applied to every request
    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::tests::CountingLoader;
    use std::time::Duration;

    fn translator(loader: Arc<CountingLoader>) -> Translator {
        Translator::new(loader, &ServiceConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_translate_returns_model_name() {
        let loader = Arc::new(CountingLoader::default());
        let translator = translator(loader.clone());

        let response = translator
            .translate(&TranslationRequest::new("Hello world", "en", "fr"))
            .await
            .unwrap();

        assert_eq!(response.model, "opus-mt-en-fr");
        assert_eq!(response.translated_text, "[fr] Hello world");
    }

    #[tokio::test]
    async fn test_repeated_pair_reuses_cache() {
        let loader = Arc::new(CountingLoader::default());
        let translator = translator(loader.clone());
        let request = TranslationRequest::new("Good morning", "en", "de");

        let first = translator.translate(&request).await.unwrap();
        let second = translator.translate(&request).await.unwrap();

        assert_eq!(first.model, second.model);
        assert_eq!(loader.loads_for("opus-mt-en-de"), 1);
        assert_eq!(translator.loaded_models().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_language_never_reaches_loader() {
        let loader = Arc::new(CountingLoader::default());
        let translator = translator(loader.clone());

        let err = translator
            .translate(&TranslationRequest::new("Hello", "en/../..", "fr"))
            .await
            .unwrap_err();

        assert!(matches!(err, TranslationError::InvalidLanguage { .. }));
        assert_eq!(loader.total.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_pair_is_an_error_not_a_crash() {
        let loader = Arc::new(CountingLoader::default());
        let translator = translator(loader);

        let err = translator
            .translate(&TranslationRequest::new("Hello", "en", "xx"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::ModelNotFound { .. }));

        // The translator keeps serving other pairs
        assert!(translator
            .translate(&TranslationRequest::new("Hello", "en", "fr"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_uncached_pair() {
        let loader = Arc::new(CountingLoader::with_delay(Duration::from_millis(30)));
        let translator = Arc::new(translator(loader.clone()));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let translator = translator.clone();
                tokio::spawn(async move {
                    translator
                        .translate(&TranslationRequest::new(format!("text {}", i), "en", "it"))
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().model, "opus-mt-en-it");
        }

        assert_eq!(translator.loaded_models().len(), 1);
        assert_eq!(loader.loads_for("opus-mt-en-it"), 1);
    }

    #[tokio::test]
    async fn test_warm_up_loads_without_translating() {
        let loader = Arc::new(CountingLoader::default());
        let translator = translator(loader.clone());

        let name = translator.warm_up(&LanguagePair::new("fr", "en")).await.unwrap();
        assert_eq!(name, "opus-mt-fr-en");
        assert_eq!(loader.loads_for("opus-mt-fr-en"), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ServiceConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        let loader = Arc::new(CountingLoader::default());
        assert!(Translator::new(loader, &config).is_err());
    }

    #[tokio::test]
    async fn test_cached_pair_not_blocked_by_running_load() {
        let delay = Duration::from_millis(300);
        let loader = Arc::new(CountingLoader::with_delay(delay));
        let config = ServiceConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let translator = Arc::new(Translator::new(loader, &config).unwrap());

        translator.warm_up(&LanguagePair::new("en", "fr")).await.unwrap();

        let slow = {
            let translator = translator.clone();
            tokio::spawn(async move {
                translator
                    .translate(&TranslationRequest::new("Hallo", "de", "en"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = tokio::time::timeout(
            delay / 2,
            translator.translate(&TranslationRequest::new("Hello", "en", "fr")),
        )
        .await
        .expect("cached pair waited for an unrelated load")
        .unwrap();
        assert_eq!(fast.translated_text, "[fr] Hello");

        assert!(slow.await.unwrap().is_ok());
    }
}
