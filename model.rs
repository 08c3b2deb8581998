use crate::config::TensorLayout;
use crate::error::{Error, Result};
use ndarray::{Array4, ArrayView4};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Forward pass of a loaded model. Implementations must tolerate calls from
/// several threads at once.
pub trait InferenceBackend: Send + Sync {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>>;

    /// Human-readable execution provider, e.g. `"CPU"`.
    fn provider_label(&self) -> &str {
        "custom"
    }
}

/// Produces a ready [`ModelHandle`]. Called from a blocking thread.
pub trait ModelProvider: Send + Sync {
    fn load(&self) -> Result<ModelHandle>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInput {
    pub size: u32,
    pub layout: TensorLayout,
}

impl ModelInput {
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        let s = self.size as usize;
        match self.layout {
            TensorLayout::Nhwc => (1, s, s, 3),
            TensorLayout::Nchw => (1, 3, s, s),
        }
    }
}

pub struct ModelHandle {
    backend: Box<dyn InferenceBackend>,
    labels: LabelMap,
    input: ModelInput,
}

impl ModelHandle {
    pub fn new(backend: Box<dyn InferenceBackend>, labels: LabelMap, input: ModelInput) -> Self {
        Self {
            backend,
            labels,
            input,
        }
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn input(&self) -> ModelInput {
        self.input
    }

    pub fn provider_label(&self) -> &str {
        self.backend.provider_label()
    }

    pub fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>> {
        let expected = self.input.shape();
        if input.dim() != expected {
            return Err(Error::Inference(format!(
                "tensor shape {:?} does not match model input {:?}",
                input.dim(),
                expected
            )));
        }
        self.backend.predict(input)
    }

    /// Runs one pass over a zero tensor so lazy backend setup happens now.
    pub fn warm_up(&self) -> Result<()> {
        let dummy = Array4::<f32>::zeros(self.input.shape());
        self.predict(dummy.view()).map(|_| ())
    }
}

/// Class index to display name, loaded alongside the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMap {
    names: HashMap<usize, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabels {
    Indexed(HashMap<String, String>),
    Ordered(Vec<String>),
}

impl LabelMap {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).enumerate().collect(),
        }
    }

    /// A missing or unreadable file yields an empty map.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            log::warn!("No label mapping found at {}", path.display());
            return Self::default();
        }
        let contents = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("Failed to read labels from {}: {}", path.display(), err);
                return Self::default();
            }
        };
        match Self::parse(&contents) {
            Ok(map) => {
                if map.is_empty() {
                    log::warn!("Labels file is empty or invalid: {}", path.display());
                }
                map
            }
            Err(err) => {
                log::warn!("Failed to parse labels from {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn parse(json: &str) -> Result<Self> {
        let raw: RawLabels = serde_json::from_str(json)?;
        let names = match raw {
            RawLabels::Ordered(list) => list.into_iter().enumerate().collect(),
            RawLabels::Indexed(map) => {
                let mut names = HashMap::with_capacity(map.len());
                for (key, name) in map {
                    match key.trim().parse::<usize>() {
                        Ok(idx) => {
                            names.insert(idx, name);
                        }
                        Err(_) => log::warn!("Skipping non-numeric label key {key:?}"),
                    }
                }
                names
            }
        };
        Ok(Self { names })
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(&index).map(String::as_str)
    }

    /// Display name for `index`, or `unknown_<index>` when unmapped.
    pub fn name(&self, index: usize) -> String {
        self.get(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("unknown_{index}"))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
