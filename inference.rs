use crate::config::OutputActivation;
use crate::error::{Error, Result};
use crate::model::ModelHandle;
use crate::ranking::softmax;
use ndarray::Array4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct InferenceOutput {
    pub probabilities: Vec<f32>,
    pub elapsed: Duration,
}

/// Runs forward passes off the async executor and tracks how many input
/// tensors are still alive.
#[derive(Clone)]
pub struct InferenceRunner {
    activation: OutputActivation,
    live_buffers: Arc<AtomicUsize>,
}

/// Owns the input tensor for the duration of one pass. Dropping it, on any
/// path, releases the tensor and the live count.
struct BufferScope {
    tensor: Array4<f32>,
    live: Arc<AtomicUsize>,
}

impl BufferScope {
    fn acquire(tensor: Array4<f32>, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { tensor, live }
    }
}

impl Drop for BufferScope {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InferenceRunner {
    pub fn new(activation: OutputActivation) -> Self {
        Self {
            activation,
            live_buffers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::SeqCst)
    }

    pub async fn predict(
        &self,
        tensor: Array4<f32>,
        handle: Arc<ModelHandle>,
    ) -> Result<InferenceOutput> {
        let scope = BufferScope::acquire(tensor, self.live_buffers.clone());
        let activation = self.activation;
        let started = Instant::now();
        let raw = tokio::task::spawn_blocking(move || {
            let scope = scope;
            handle.predict(scope.tensor.view())
        })
        .await
        .map_err(|e| Error::Inference(format!("inference task failed: {e}")))??;
        let elapsed = started.elapsed();
        log::debug!("Inference finished in {}ms", elapsed.as_millis());

        let probabilities = match activation {
            OutputActivation::Probabilities => raw,
            OutputActivation::Softmax => softmax(&raw),
        };
        Ok(InferenceOutput {
            probabilities,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LabelMap;
    use crate::test_support::{FailingBackend, FixedBackend, TEST_INPUT};

    fn handle(backend: Box<dyn crate::model::InferenceBackend>) -> Arc<ModelHandle> {
        Arc::new(ModelHandle::new(backend, LabelMap::default(), TEST_INPUT))
    }

    fn input() -> Array4<f32> {
        Array4::zeros(TEST_INPUT.shape())
    }

    #[tokio::test]
    async fn returns_probabilities_and_releases_buffer() {
        let runner = InferenceRunner::new(OutputActivation::Probabilities);
        let out = runner
            .predict(input(), handle(Box::new(FixedBackend::new(vec![0.25, 0.75]))))
            .await
            .unwrap();
        assert_eq!(out.probabilities, vec![0.25, 0.75]);
        assert_eq!(runner.live_buffers(), 0);
    }

    #[tokio::test]
    async fn failure_still_releases_buffer() {
        let runner = InferenceRunner::new(OutputActivation::Probabilities);
        let res = runner.predict(input(), handle(Box::new(FailingBackend))).await;
        assert!(matches!(res, Err(Error::Inference(_))));
        assert_eq!(runner.live_buffers(), 0);
    }

    #[tokio::test]
    async fn wrong_shape_is_rejected_and_released() {
        let runner = InferenceRunner::new(OutputActivation::Probabilities);
        let res = runner
            .predict(
                Array4::zeros((1, 3, 16, 16)),
                handle(Box::new(FixedBackend::new(vec![1.0]))),
            )
            .await;
        assert!(matches!(res, Err(Error::Inference(_))));
        assert_eq!(runner.live_buffers(), 0);
    }

    #[tokio::test]
    async fn softmax_activation_normalizes_logits() {
        let runner = InferenceRunner::new(OutputActivation::Softmax);
        let out = runner
            .predict(input(), handle(Box::new(FixedBackend::new(vec![0.0, 0.0]))))
            .await
            .unwrap();
        assert_eq!(out.probabilities, vec![0.5, 0.5]);
    }
}
