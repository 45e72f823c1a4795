//! In-memory model cache keyed by model name
//!
//! Loads in progress live in a pending map: each key owns a `OnceCell`
//! initialised by exactly one loader call, and concurrent callers for the
//! same key wait on it. Only finished models enter the LRU, so eviction
//! never touches a running load and failed loads never displace a model.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::{LanguagePair, LoadedModelInfo, ModelLoader, TranslationModel};

/// A loaded model together with its load time
pub struct CachedModel {
    /// The model itself
    pub model: Arc<dyn TranslationModel>,
    /// When the load finished
    pub loaded_at: DateTime<Utc>,
}

type Slot = Arc<OnceCell<Arc<CachedModel>>>;

struct Entries {
    loaded: LruCache<String, Arc<CachedModel>>,
    pending: HashMap<String, Slot>,
}

/// Model cache with single-flight loading and LRU eviction
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    entries: Mutex<Entries>,
}

impl ModelCache {
    /// Create a cache holding at most `capacity` models; `None` never evicts
    pub fn new(loader: Arc<dyn ModelLoader>, capacity: Option<NonZeroUsize>) -> Self {
        let loaded = match capacity {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };

        Self {
            loader,
            entries: Mutex::new(Entries {
                loaded,
                pending: HashMap::new(),
            }),
        }
    }

    /// Capacity from a config value where 0 means unbounded
    pub fn with_max_models(loader: Arc<dyn ModelLoader>, max_models: usize) -> Self {
        Self::new(loader, NonZeroUsize::new(max_models))
    }

    /// Get the model for a language pair, loading it on first use
    pub async fn get_model(&self, pair: &LanguagePair) -> Result<Arc<CachedModel>> {
        let key = pair.model_name();

        let slot = {
            let mut entries = self.entries.lock();
            if let Some(cached) = entries.loaded.get(&key) {
                debug!("Cache hit for {}", key);
                return Ok(cached.clone());
            }
            entries
                .pending
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = slot
            .get_or_try_init(|| async {
                info!("Loading model {}", key);
                let started = std::time::Instant::now();
                let model = self.loader.load(pair).await?;
                info!("Loaded model {} in {:?}", key, started.elapsed());
                Ok::<_, TranslationError>(Arc::new(CachedModel {
                    model,
                    loaded_at: Utc::now(),
                }))
            })
            .await
            .cloned();

        let mut entries = self.entries.lock();
        if entries.pending.get(&key).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            entries.pending.remove(&key);
        }

        match result {
            Ok(cached) => {
                if entries.loaded.get(&key).is_none() {
                    if let Some((evicted, _)) = entries.loaded.push(key.clone(), cached.clone()) {
                        info!("Evicted model {} from cache", evicted);
                    }
                }
                Ok(cached)
            }
            Err(e) => {
                warn!("Failed to load model {}: {}", key, e);
                Err(e)
            }
        }
    }

    /// Models that finished loading, most recently used first
    pub fn loaded(&self) -> Vec<LoadedModelInfo> {
        let entries = self.entries.lock();
        entries
            .loaded
            .iter()
            .map(|(key, cached)| LoadedModelInfo {
                model: key.clone(),
                loaded_at: cached.loaded_at,
            })
            .collect()
    }

    /// Number of models held in memory
    pub fn len(&self) -> usize {
        self.entries.lock().loaded.len()
    }

    /// Whether no model is held in memory
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of loads still in progress
    pub fn pending(&self) -> usize {
        self.entries.lock().pending.len()
    }
}
