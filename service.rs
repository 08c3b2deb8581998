use crate::cache::{CacheBackend, MemoryStore, ResultCache};
use crate::config::{CacheSettings, GatewayConfig};
use crate::db::SqliteStore;
use crate::error::Result;
use crate::fingerprint::FingerprintGenerator;
use crate::indexer::ReferenceIndexer;
use crate::inference::InferenceRunner;
use crate::loader::{ModelLoader, ModelState};
use crate::model::{ModelInput, ModelProvider};
use crate::models::{IndexReport, ModelInfo, RecognitionResult, RecognizeOptions};
use crate::onnx::OnnxModelProvider;
use crate::preprocess::ImagePreprocessor;
use crate::recognizer::Recognizer;
use crate::similarity::SimilarityComparator;
use std::path::Path;
use std::sync::Arc;

/// Public surface of the gateway: recognition, comparison, batch indexing
/// and cache maintenance over one shared model and cache.
#[derive(Clone)]
pub struct RecognitionService {
    config: Arc<GatewayConfig>,
    recognizer: Arc<Recognizer>,
    comparator: SimilarityComparator,
}

impl RecognitionService {
    /// Production wiring: ONNX model from `model_dir`, cache per `config.cache_settings()`.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let provider: Arc<dyn ModelProvider> = Arc::new(OnnxModelProvider::from_config(&config));
        let backend = open_backend(&config.cache_settings());
        Self::with_components(config, provider, backend)
    }

    pub fn with_components(
        config: GatewayConfig,
        provider: Arc<dyn ModelProvider>,
        backend: Option<Arc<dyn CacheBackend>>,
    ) -> Result<Self> {
        config.validate()?;
        let fingerprints = FingerprintGenerator::new(config.hash_grid_size);
        let input = ModelInput {
            size: config.input_size,
            layout: config.tensor_layout,
        };
        let cache = match backend {
            Some(backend) => {
                log::info!(
                    "Recognition cache: {} (ttl {}s)",
                    backend.name(),
                    config.cache_ttl.as_secs()
                );
                ResultCache::new(backend, config.cache_namespace.clone(), config.cache_ttl)
            }
            None => {
                log::info!("Recognition cache disabled");
                ResultCache::disabled(config.cache_namespace.clone())
            }
        };
        let recognizer = Recognizer::new(
            ImagePreprocessor::new(input, fingerprints),
            ModelLoader::new(provider),
            InferenceRunner::new(config.output_activation),
            cache,
        );
        Ok(Self {
            config: Arc::new(config),
            recognizer: Arc::new(recognizer),
            comparator: SimilarityComparator::new(fingerprints),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Options with the configured default threshold.
    pub fn default_options(&self) -> RecognizeOptions {
        RecognizeOptions {
            threshold: self.config.default_threshold,
            ..RecognizeOptions::default()
        }
    }

    pub async fn recognize(
        &self,
        bytes: Vec<u8>,
        options: &RecognizeOptions,
    ) -> Result<RecognitionResult> {
        self.recognizer.recognize(Arc::new(bytes), options).await
    }

    /// Perceptual similarity in `[0, 1]`; `0` when either image is unusable.
    pub async fn compare_images(&self, a: Vec<u8>, b: Vec<u8>) -> f64 {
        let comparator = self.comparator;
        match tokio::task::spawn_blocking(move || comparator.similarity(&a, &b)).await {
            Ok(score) => score,
            Err(err) => {
                log::warn!("Similarity task failed: {err}");
                0.0
            }
        }
    }

    pub async fn index_reference_images(&self, directory: &Path) -> Result<IndexReport> {
        ReferenceIndexer::new(
            self.recognizer.clone(),
            self.config.default_threshold,
            self.config.index_concurrency,
        )
        .index_directory(directory)
        .await
    }

    /// Drops every cached result under this service's namespace.
    pub async fn clear_recognition_cache(&self) -> bool {
        match self.recognizer.cache().clear_namespace().await {
            Ok(removed) => {
                log::info!(
                    "Cleared {removed} cached recognition results under {}",
                    self.recognizer.cache().namespace()
                );
                true
            }
            Err(err) => {
                log::warn!("Failed to clear recognition cache: {err}");
                false
            }
        }
    }

    pub async fn purge_expired_cache(&self) -> Result<usize> {
        self.recognizer.cache().purge_expired().await
    }

    /// Loads and warms the model now instead of on the first request.
    pub async fn ensure_model_loaded(&self) -> Result<ModelInfo> {
        self.recognizer.loader().ensure_loaded().await?;
        Ok(self.model_info())
    }

    pub fn model_state(&self) -> ModelState {
        self.recognizer.loader().state()
    }

    pub fn model_info(&self) -> ModelInfo {
        let loader = self.recognizer.loader();
        let handle = loader.loaded();
        ModelInfo {
            state: loader.state(),
            provider: handle.as_ref().map(|h| h.provider_label().to_string()),
            label_count: handle.as_ref().map_or(0, |h| h.labels().len()),
            input_size: self.config.input_size,
            tensor_layout: self.config.tensor_layout,
        }
    }
}

fn open_backend(settings: &CacheSettings) -> Option<Arc<dyn CacheBackend>> {
    match settings {
        CacheSettings::Memory => Some(Arc::new(MemoryStore::new())),
        CacheSettings::Sqlite { path } => match SqliteStore::open(path) {
            Ok(store) => Some(Arc::new(store)),
            Err(err) => {
                log::warn!(
                    "Cache database {} unavailable; recognizing without cache: {err}",
                    path.display()
                );
                None
            }
        },
        CacheSettings::Disabled => None,
    }
}
