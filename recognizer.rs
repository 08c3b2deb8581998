//! Request pipeline: preprocess, cache lookup, inference on miss, ranking,
//! cache store.

use crate::cache::ResultCache;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::inference::InferenceRunner;
use crate::loader::ModelLoader;
use crate::models::{
    BoundingBox, Enrichment, ImageInfo, RecognitionResult, RecognizeOptions,
};
use crate::preprocess::ImagePreprocessor;
use crate::ranking::ResultRanker;
use std::sync::Arc;
use std::time::Instant;

const LOCATION_SPAN: f64 = 0.8;

pub struct Recognizer {
    preprocessor: ImagePreprocessor,
    loader: ModelLoader,
    runner: InferenceRunner,
    cache: ResultCache,
}

impl Recognizer {
    pub fn new(
        preprocessor: ImagePreprocessor,
        loader: ModelLoader,
        runner: InferenceRunner,
        cache: ResultCache,
    ) -> Self {
        Self {
            preprocessor,
            loader,
            runner,
            cache,
        }
    }

    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn runner(&self) -> &InferenceRunner {
        &self.runner
    }

    pub async fn recognize(
        &self,
        bytes: Arc<Vec<u8>>,
        options: &RecognizeOptions,
    ) -> Result<RecognitionResult> {
        let started = Instant::now();
        if !options.threshold.is_finite() || !(0.0..=1.0).contains(&options.threshold) {
            return Err(Error::InvalidInput(format!(
                "threshold must be within [0, 1], got {}",
                options.threshold
            )));
        }

        let preprocessor = self.preprocessor;
        let prepared = tokio::task::spawn_blocking(move || preprocessor.preprocess(&bytes))
            .await
            .map_err(|e| Error::Decode(format!("preprocess task failed: {e}")))??;

        let fingerprint = prepared.fingerprint.unwrap_or_else(|err| {
            log::warn!("Fingerprint fell back to a volatile value: {err}");
            Fingerprint::volatile()
        });
        let cacheable = options.use_cache && fingerprint.is_content_stable();

        if cacheable {
            let cached = self.cache.get(&fingerprint).await;
            if let Some(mut hit) = cached.and_then(|hit| hit.narrowed_to(options.threshold)) {
                // Same hash, possibly different encoding or scale.
                hit.image_info.width = prepared.width;
                hit.image_info.height = prepared.height;
                hit.image_info.format = prepared.format;
                hit.performance.cached = true;
                hit.performance.total_time_ms = elapsed_ms(started);
                if options.enhanced_analysis {
                    hit.enrichment = estimate_location(&hit);
                }
                log::debug!("Cache hit for {fingerprint}");
                return Ok(hit);
            }
        }

        let handle = self.loader.ensure_loaded().await?;
        let output = self.runner.predict(prepared.tensor, handle.clone()).await?;
        let predictions = ResultRanker::new(handle.labels()).rank(&output.probabilities, options.threshold);

        let mut result = RecognitionResult::from_ranked(
            predictions,
            ImageInfo {
                width: prepared.width,
                height: prepared.height,
                format: prepared.format,
                fingerprint: fingerprint.clone(),
            },
            output.elapsed.as_millis() as u64,
        );
        result.performance.total_time_ms = elapsed_ms(started);
        result.threshold = Some(options.threshold);

        if cacheable {
            self.cache.put(&fingerprint, &result, self.cache.ttl()).await;
        }
        if options.enhanced_analysis {
            result.enrichment = estimate_location(&result);
        }
        Ok(result)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Centered box over the middle of the frame, sized from the image
/// dimensions alone. Only produced when there is a top match.
fn estimate_location(result: &RecognitionResult) -> Option<Enrichment> {
    let top = result.top_match.as_ref()?;
    let info = &result.image_info;
    let width = (info.width as f64 * LOCATION_SPAN).round() as u32;
    let height = (info.height as f64 * LOCATION_SPAN).round() as u32;
    Some(Enrichment {
        label: top.name.clone(),
        object_location: BoundingBox {
            x: (info.width - width) / 2,
            y: (info.height - height) / 2,
            width,
            height,
        },
        coverage: LOCATION_SPAN * LOCATION_SPAN,
        confidence: ((top.confidence * LOCATION_SPAN) * 100.0).round() / 100.0,
    })
}
