//! Fixtures shared by the unit tests.

use crate::cache::CacheBackend;
use crate::config::TensorLayout;
use crate::error::{Error, Result};
use crate::model::{InferenceBackend, LabelMap, ModelHandle, ModelInput, ModelProvider};
use image::{ImageFormat, RgbImage};
use ndarray::ArrayView4;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const TEST_INPUT: ModelInput = ModelInput {
    size: 16,
    layout: TensorLayout::Nhwc,
};

pub fn png_bytes<F>(w: u32, h: u32, pixel: F) -> Vec<u8>
where
    F: Fn(u32, u32) -> [u8; 3],
{
    let img = RgbImage::from_fn(w, h, |x, y| image::Rgb(pixel(x, y)));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

pub fn gradient_png(w: u32, h: u32) -> Vec<u8> {
    png_bytes(w, h, |x, y| {
        let gx = (x * 255 / w.max(1)) as u8;
        let gy = (y * 255 / h.max(1)) as u8;
        [gx, gy, gx / 2 + gy / 2]
    })
}

/// Deterministic per-pixel noise from a xorshift generator.
pub fn noise_png(w: u32, h: u32, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut values = Vec::with_capacity((w * h) as usize);
    for _ in 0..(w * h) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        values.push((state >> 24) as u8);
    }
    png_bytes(w, h, |x, y| {
        let v = values[(y * w + x) as usize];
        [v, v, v]
    })
}

pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rg_{tag}_{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Returns the same output for every call and counts invocations.
pub struct FixedBackend {
    output: Vec<f32>,
    calls: Arc<AtomicUsize>,
}

impl FixedBackend {
    pub fn new(output: Vec<f32>) -> Self {
        Self {
            output,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl InferenceBackend for FixedBackend {
    fn predict(&self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }

    fn provider_label(&self) -> &str {
        "fixed"
    }
}

pub struct FailingBackend;

impl InferenceBackend for FailingBackend {
    fn predict(&self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>> {
        Err(Error::Inference("backend exploded".into()))
    }
}

/// Model provider whose loads are counted, optionally slow, and optionally
/// failing for the first `n` attempts.
pub struct ScriptedProvider {
    output: Vec<f32>,
    labels: LabelMap,
    delay: Duration,
    fail_remaining: AtomicUsize,
    broken_backend: bool,
    loads: AtomicUsize,
    predictions: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(output: Vec<f32>) -> Self {
        Self {
            output,
            labels: LabelMap::default(),
            delay: Duration::ZERO,
            fail_remaining: AtomicUsize::new(0),
            broken_backend: false,
            loads: AtomicUsize::new(0),
            predictions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_backend() -> Self {
        Self {
            broken_backend: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_labels(mut self, labels: LabelMap) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(self, attempts: usize) -> Self {
        self.fail_remaining.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Forward passes across every handle this provider produced,
    /// warm-up included.
    pub fn predictions(&self) -> usize {
        self.predictions.load(Ordering::SeqCst)
    }
}

impl ModelProvider for ScriptedProvider {
    fn load(&self) -> Result<ModelHandle> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::ModelLoad("scripted failure".into()));
        }
        let backend: Box<dyn InferenceBackend> = if self.broken_backend {
            Box::new(FailingBackend)
        } else {
            Box::new(FixedBackend {
                output: self.output.clone(),
                calls: self.predictions.clone(),
            })
        };
        Ok(ModelHandle::new(backend, self.labels.clone(), TEST_INPUT))
    }

    fn describe(&self) -> String {
        "scripted provider".into()
    }
}

/// Cache backend that behaves like an unreachable server.
pub struct UnavailableStore;

impl CacheBackend for UnavailableStore {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::Cache("connection refused".into()))
    }

    fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Err(Error::Cache("connection refused".into()))
    }

    fn delete_prefix(&self, _prefix: &str) -> Result<usize> {
        Err(Error::Cache("connection refused".into()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}
