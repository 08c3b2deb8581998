use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CACHE_NAMESPACE: &str = "image:recognition:";
pub const DEFAULT_THRESHOLD: f64 = 0.65;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Cache database the CLI falls back to, inside `model_dir`.
pub const CLI_CACHE_DB: &str = "recognition-cache.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, height, width, 3]`
    #[default]
    Nhwc,
    /// `[1, 3, height, width]`
    Nchw,
}

/// What the model's first output holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputActivation {
    #[default]
    Probabilities,
    Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderChoice {
    #[default]
    Auto,
    CpuOnly,
    DirectMlOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CacheSettings {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
    Disabled,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_model_file")]
    pub model_file: PathBuf,
    #[serde(default = "default_labels_file")]
    pub labels_file: PathBuf,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default)]
    pub tensor_layout: TensorLayout,
    #[serde(default)]
    pub output_activation: OutputActivation,
    #[serde(default)]
    pub provider: ProviderChoice,
    #[serde(default)]
    pub device_id: Option<u32>,
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: Duration,
    #[serde(default = "default_cache_namespace")]
    pub cache_namespace: String,
    /// `None` when the config leaves the backend unset; see [`GatewayConfig::cache_settings`].
    #[serde(default)]
    pub cache: Option<CacheSettings>,
    #[serde(default = "default_hash_grid_size")]
    pub hash_grid_size: u32,
    #[serde(default = "default_index_concurrency")]
    pub index_concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            model_file: default_model_file(),
            labels_file: default_labels_file(),
            input_size: default_input_size(),
            tensor_layout: TensorLayout::default(),
            output_activation: OutputActivation::default(),
            provider: ProviderChoice::default(),
            device_id: None,
            default_threshold: default_threshold(),
            cache_ttl: default_cache_ttl(),
            cache_namespace: default_cache_namespace(),
            cache: None,
            hash_grid_size: default_hash_grid_size(),
            index_concurrency: default_index_concurrency(),
        }
    }
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_model_file() -> PathBuf {
    PathBuf::from("model.onnx")
}

fn default_labels_file() -> PathBuf {
    PathBuf::from("labels.json")
}

fn default_input_size() -> u32 {
    224
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_cache_ttl() -> Duration {
    DEFAULT_CACHE_TTL
}

fn default_cache_namespace() -> String {
    DEFAULT_CACHE_NAMESPACE.to_string()
}

fn default_hash_grid_size() -> u32 {
    8
}

fn default_index_concurrency() -> usize {
    4
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `RECOGNITION_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RECOGNITION_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(ttl) = lookup("RECOGNITION_CACHE_TTL_SECS") {
            let secs: u64 = ttl.trim().parse().map_err(|_| {
                Error::Config(format!("RECOGNITION_CACHE_TTL_SECS is not a number: {ttl}"))
            })?;
            self.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(db) = lookup("RECOGNITION_CACHE_DB") {
            self.cache = Some(CacheSettings::Sqlite {
                path: PathBuf::from(db),
            });
        }
        self.validate()?;
        Ok(self)
    }

    /// Backend to open; an unset backend means the in-process memory store.
    pub fn cache_settings(&self) -> CacheSettings {
        self.cache.clone().unwrap_or_default()
    }

    /// Short-lived processes get nothing from a memory cache, so an unset
    /// backend becomes a SQLite file in `model_dir`.
    pub fn with_persistent_cache_default(mut self) -> Self {
        if self.cache.is_none() {
            self.cache = Some(CacheSettings::Sqlite {
                path: self.model_dir.join(CLI_CACHE_DB),
            });
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(Error::Config("input_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.default_threshold) {
            return Err(Error::Config(format!(
                "default_threshold must be within [0, 1], got {}",
                self.default_threshold
            )));
        }
        if !(2..=32).contains(&self.hash_grid_size) || self.hash_grid_size % 2 != 0 {
            return Err(Error::Config(format!(
                "hash_grid_size must be even and within [2, 32], got {}",
                self.hash_grid_size
            )));
        }
        if self.index_concurrency == 0 {
            return Err(Error::Config("index_concurrency must be positive".into()));
        }
        Ok(())
    }
}

/// Model artifact locations, resolved once when the service is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPaths {
    pub model: PathBuf,
    pub labels: PathBuf,
}

impl ModelPaths {
    pub fn resolve(config: &GatewayConfig) -> Self {
        let paths = Self {
            model: resolve_in(&config.model_dir, &config.model_file),
            labels: resolve_in(&config.model_dir, &config.labels_file),
        };
        if !paths.model.exists() {
            log::warn!("Model not found: {}", paths.model.display());
        }
        paths
    }
}

fn resolve_in(dir: &Path, name: &Path) -> PathBuf {
    if name.is_absolute() {
        name.to_path_buf()
    } else {
        dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_json_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(config.cache_namespace, "image:recognition:");
        assert_eq!(config.default_threshold, 0.65);
        assert_eq!(config.cache, None);
        assert_eq!(config.cache_settings(), CacheSettings::Memory);
        assert_eq!(config.tensor_layout, TensorLayout::Nhwc);
    }

    #[test]
    fn parses_sqlite_backend_and_ttl_seconds() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"cache": {"backend": "sqlite", "path": "/tmp/cache.db"}, "cache_ttl": 60, "tensor_layout": "nchw"}"#,
        )
        .unwrap();
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.tensor_layout, TensorLayout::Nchw);
        assert_eq!(
            config.cache_settings(),
            CacheSettings::Sqlite {
                path: PathBuf::from("/tmp/cache.db")
            }
        );
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("RECOGNITION_MODEL_DIR", "/opt/models"),
            ("RECOGNITION_CACHE_TTL_SECS", "120"),
        ]
        .into_iter()
        .collect();
        let config = GatewayConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.cache_ttl, Duration::from_secs(120));
    }

    #[test]
    fn bad_ttl_override_is_rejected() {
        let result = GatewayConfig::default().with_overrides(|key| {
            (key == "RECOGNITION_CACHE_TTL_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn odd_or_out_of_range_grid_is_rejected() {
        for grid in [1, 3, 7, 33, 34] {
            let config = GatewayConfig {
                hash_grid_size: grid,
                ..GatewayConfig::default()
            };
            assert!(matches!(config.validate(), Err(Error::Config(_))), "grid {grid}");
        }
        let config = GatewayConfig {
            hash_grid_size: 6,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unset_cache_becomes_sqlite_for_short_lived_runs() {
        let config = GatewayConfig {
            model_dir: PathBuf::from("/srv/models"),
            ..GatewayConfig::default()
        }
        .with_persistent_cache_default();
        assert_eq!(
            config.cache_settings(),
            CacheSettings::Sqlite {
                path: PathBuf::from("/srv/models/recognition-cache.db")
            }
        );

        let explicit: GatewayConfig =
            serde_json::from_str(r#"{"cache": {"backend": "memory"}}"#).unwrap();
        assert_eq!(
            explicit.with_persistent_cache_default().cache_settings(),
            CacheSettings::Memory
        );
    }

    #[test]
    fn relative_model_paths_resolve_against_model_dir() {
        let config = GatewayConfig {
            model_dir: PathBuf::from("/srv/models"),
            labels_file: PathBuf::from("/etc/labels.json"),
            ..GatewayConfig::default()
        };
        let paths = ModelPaths::resolve(&config);
        assert_eq!(paths.model, PathBuf::from("/srv/models/model.onnx"));
        assert_eq!(paths.labels, PathBuf::from("/etc/labels.json"));
    }
}
