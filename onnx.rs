use crate::config::{GatewayConfig, ModelPaths, ProviderChoice};
use crate::error::{Error, Result};
use crate::model::{InferenceBackend, LabelMap, ModelHandle, ModelInput, ModelProvider};
use ndarray::ArrayView4;
use std::path::Path;
#[cfg(target_os = "windows")]
use std::path::PathBuf;
use std::sync::Mutex;

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

#[cfg(target_os = "windows")]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceProvider {
    Cpu,
    DirectML { device_id: u32 },
}

impl InferenceProvider {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::DirectML { .. } => "GPU (DirectML)",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrtRuntimeConfig {
    pub provider: ProviderChoice,
    pub device_id: Option<u32>,
}

impl OrtRuntimeConfig {
    fn resolved_device_id(self) -> u32 {
        self.device_id.unwrap_or(0)
    }
}

#[cfg(target_os = "windows")]
fn pick_ort_dll(candidates: Vec<PathBuf>) -> Option<(PathBuf, PathBuf)> {
    for candidate in candidates {
        if candidate.exists() {
            let dir = candidate.parent()?.to_path_buf();
            return Some((candidate, dir));
        }
    }
    None
}

#[cfg(target_os = "windows")]
fn resolve_ort_dylib_path() -> Option<(PathBuf, PathBuf)> {
    if let Ok(path) = std::env::var("ORT_DYLIB_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            let dir = path.parent()?.to_path_buf();
            return Some((path, dir));
        }
    }
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            candidates.push(parent.join("onnxruntime").join("onnxruntime.dll"));
        }
    }
    pick_ort_dll(candidates)
}

#[cfg(target_os = "windows")]
fn set_ort_dylib_path(dll_path: &Path, dll_dir: &Path) {
    std::env::set_var("ORT_DYLIB_PATH", dll_path);
    let paths = std::env::var_os("PATH").unwrap_or_default();
    let mut new_paths = std::ffi::OsString::new();
    new_paths.push(dll_dir);
    new_paths.push(";");
    new_paths.push(&paths);
    std::env::set_var("PATH", new_paths);
}

fn ensure_environment() -> Result<()> {
    let committed = ort::init()
        .with_name("recognition-gateway")
        .commit()
        .map_err(|e| Error::Init(format!("Failed to init ORT environment: {e}")))?;
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
    }
    Ok(())
}

pub fn build_session(
    model_path: &Path,
    cfg: OrtRuntimeConfig,
) -> Result<(Session, InferenceProvider)> {
    if !model_path.exists() {
        return Err(Error::ModelLoad(format!(
            "Model not found: {}",
            model_path.display()
        )));
    }
    #[cfg(target_os = "windows")]
    {
        if let Some((dll_path, dll_dir)) = resolve_ort_dylib_path() {
            set_ort_dylib_path(&dll_path, &dll_dir);
        } else {
            return Err(Error::Init(
                "onnxruntime.dll not found; set ORT_DYLIB_PATH".into(),
            ));
        }
    }
    ensure_environment()?;
    let device_id = cfg.resolved_device_id();

    let try_build = |use_dml: bool| -> Result<Session> {
        let build = || -> Result<Session> {
            #[allow(unused_mut)]
            let mut builder = Session::builder()
                .map_err(|e| Error::Init(format!("{e}")))?
                .with_optimization_level(GraphOptimizationLevel::Level1)
                .map_err(|e| Error::Init(format!("{e}")))?;
            if use_dml {
                #[cfg(target_os = "windows")]
                {
                    builder = builder
                        .with_memory_pattern(false)
                        .map_err(|e| Error::Init(format!("{e}")))?;
                    let ep = DirectMLExecutionProvider::default()
                        .with_device_id(device_id as i32)
                        .build();
                    builder = builder
                        .with_execution_providers([ep])
                        .map_err(|e| Error::Init(format!("{e}")))?;
                }
            }
            builder
                .commit_from_file(model_path)
                .map_err(|e| Error::Init(format!("{e}")))
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(build)) {
            Ok(res) => res,
            Err(_) => Err(Error::Init(
                "ONNX Runtime panicked while building session".into(),
            )),
        }
    };

    let wants_dml = matches!(cfg.provider, ProviderChoice::Auto | ProviderChoice::DirectMlOnly);
    #[cfg(target_os = "windows")]
    {
        if wants_dml {
            if let Ok(true) = DirectMLExecutionProvider::default().is_available() {
                match try_build(true) {
                    Ok(session) => {
                        return Ok((session, InferenceProvider::DirectML { device_id }))
                    }
                    Err(err) => log::warn!("DirectML session build failed: {err}"),
                }
            }
        }
    }

    if cfg.provider == ProviderChoice::DirectMlOnly {
        return Err(Error::Init(format!(
            "DirectML execution provider unavailable for {} (device {device_id})",
            model_path.display()
        )));
    }
    if wants_dml && cfg!(target_os = "windows") {
        log::warn!(
            "DirectML execution provider unavailable; falling back to CPU for {}",
            model_path.display()
        );
    }

    let session = try_build(false)?;
    Ok((session, InferenceProvider::Cpu))
}

/// Classifier backed by an ONNX Runtime session. `Session::run` needs
/// exclusive access, so concurrent predictions queue on the mutex.
pub struct OnnxBackend {
    session: Mutex<Session>,
    provider: InferenceProvider,
}

impl InferenceBackend for OnnxBackend {
    fn predict(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>> {
        let tensor = TensorRef::from_array_view(input)
            .map_err(|e| Error::Inference(format!("Invalid input tensor: {e}")))?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Inference("session lock poisoned".into()))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| Error::Inference(format!("Failed to run model: {e}")))?;
        if outputs.len() == 0 {
            return Err(Error::Inference("Model returned no outputs".into()));
        }
        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(format!("Unexpected model output: {e}")))?;
        Ok(data.to_vec())
    }

    fn provider_label(&self) -> &str {
        self.provider.label()
    }
}

/// Loads `model.onnx` plus its JSON label map from the configured directory.
pub struct OnnxModelProvider {
    paths: ModelPaths,
    runtime: OrtRuntimeConfig,
    input: ModelInput,
}

impl OnnxModelProvider {
    pub fn new(paths: ModelPaths, runtime: OrtRuntimeConfig, input: ModelInput) -> Self {
        Self {
            paths,
            runtime,
            input,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            ModelPaths::resolve(config),
            OrtRuntimeConfig {
                provider: config.provider,
                device_id: config.device_id,
            },
            ModelInput {
                size: config.input_size,
                layout: config.tensor_layout,
            },
        )
    }
}

impl ModelProvider for OnnxModelProvider {
    fn load(&self) -> Result<ModelHandle> {
        let (session, provider) = build_session(&self.paths.model, self.runtime)?;
        let labels = LabelMap::load(&self.paths.labels);
        log::info!(
            "Built {} session for {} with {} labels",
            provider.label(),
            self.paths.model.display(),
            labels.len()
        );
        let backend = OnnxBackend {
            session: Mutex::new(session),
            provider,
        };
        Ok(ModelHandle::new(Box::new(backend), labels, self.input))
    }

    fn describe(&self) -> String {
        self.paths.model.display().to_string()
    }
}
