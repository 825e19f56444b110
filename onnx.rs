use crate::engine::Network;
use crate::error::{Error, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionOutputs};
use ort::value::{Tensor, ValueType};

#[cfg(target_os = "windows")]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};

lazy_static! {
    static ref ORT_ENVIRONMENT: std::result::Result<(), String> = init_environment();
}

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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderChoice {
    Auto,
    CpuOnly,
    #[serde(rename = "directml_only")]
    DirectMLOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct OrtRuntimeConfig {
    pub provider: ProviderChoice,
    pub device_id: Option<u32>,
    pub intra_threads: usize,
}

impl OrtRuntimeConfig {
    #[cfg(target_os = "windows")]
    fn resolved_device_id(self) -> u32 {
        self.device_id.unwrap_or(0)
    }
}

/// Where the serialized graph comes from.
#[derive(Debug, Clone, Copy)]
pub enum ModelSource<'a> {
    File(&'a Path),
    Memory(&'a [u8]),
}

impl ModelSource<'_> {
    fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

#[cfg(target_os = "windows")]
const RUNTIME_LIBRARY: (&str, &str) = ("win-x64-directml", "onnxruntime.dll");
#[cfg(target_os = "macos")]
const RUNTIME_LIBRARY: (&str, &str) = ("osx-universal2", "libonnxruntime.dylib");
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const RUNTIME_LIBRARY: (&str, &str) = ("linux-x64", "libonnxruntime.so");

fn pick_ort_dylib(candidates: Vec<PathBuf>) -> Option<(PathBuf, PathBuf)> {
    for candidate in candidates {
        if candidate.exists() {
            let dir = candidate.parent()?.to_path_buf();
            return Some((candidate, dir));
        }
    }
    None
}

/// `ORT_DYLIB_PATH` first, then the copy staged by the build script, then the
/// vendored tree when running from the source checkout.
fn resolve_ort_dylib_path() -> Option<(PathBuf, PathBuf)> {
    let (platform, library) = RUNTIME_LIBRARY;
    let mut candidates = Vec::new();
    if let Ok(path) = std::env::var("ORT_DYLIB_PATH") {
        candidates.push(PathBuf::from(path));
    }
    if let Ok(exe) = std::env::current_exe() {
        for dir in exe.ancestors().skip(1).take(2) {
            candidates.push(dir.join("onnxruntime").join(library));
        }
    }
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        candidates.push(
            Path::new(&manifest_dir)
                .join("vendor")
                .join("onnxruntime")
                .join(platform)
                .join(library),
        );
    }
    pick_ort_dylib(candidates)
}

fn set_ort_dylib_path(dylib_path: &Path, _dylib_dir: &Path) {
    std::env::set_var("ORT_DYLIB_PATH", dylib_path);
    #[cfg(target_os = "windows")]
    {
        // DirectML.dll is resolved through PATH, not relative to onnxruntime.dll.
        let paths = std::env::var_os("PATH").unwrap_or_default();
        let mut new_paths = std::ffi::OsString::new();
        new_paths.push(_dylib_dir);
        new_paths.push(";");
        new_paths.push(&paths);
        std::env::set_var("PATH", new_paths);
    }
}

fn init_environment() -> std::result::Result<(), String> {
    match resolve_ort_dylib_path() {
        Some((dylib_path, dylib_dir)) => {
            log::debug!("Using ONNX Runtime at {}", dylib_path.display());
            set_ort_dylib_path(&dylib_path, &dylib_dir);
        }
        None if cfg!(target_os = "windows") => {
            return Err("onnxruntime.dll not found; set ORT_DYLIB_PATH".into());
        }
        // Left to the system loader's search path.
        None => {}
    }
    let build = || {
        ort::init()
            .with_name("image-classifier")
            .commit()
            .map_err(|e| format!("Failed to init ORT environment: {e}"))
    };
    let committed = match catch_unwind(AssertUnwindSafe(build)) {
        Ok(res) => res?,
        Err(_) => return Err("ONNX Runtime library could not be loaded".into()),
    };
    if committed {
        if let Ok(env) = ort::environment::get_environment() {
            env.set_log_level(ort::logging::LogLevel::Warning);
        }
    }
    Ok(())
}

fn ensure_environment() -> Result<()> {
    (*ORT_ENVIRONMENT).clone().map_err(Error::AssetLoad)
}

fn configure(use_dml: bool, cfg: OrtRuntimeConfig) -> Result<SessionBuilder> {
    let mut builder = Session::builder()
        .map_err(|e| Error::AssetLoad(format!("{e}")))?
        .with_optimization_level(GraphOptimizationLevel::Level1)
        .map_err(|e| Error::AssetLoad(format!("{e}")))?
        .with_parallel_execution(false)
        .map_err(|e| Error::AssetLoad(format!("{e}")))?;
    if cfg.intra_threads > 0 {
        builder = builder
            .with_intra_threads(cfg.intra_threads)
            .map_err(|e| Error::AssetLoad(format!("{e}")))?;
    }
    if use_dml {
        #[cfg(target_os = "windows")]
        {
            builder = builder
                .with_memory_pattern(false)
                .map_err(|e| Error::AssetLoad(format!("{e}")))?;
            let ep = DirectMLExecutionProvider::default()
                .with_device_id(cfg.resolved_device_id() as i32)
                .build();
            builder = builder
                .with_execution_providers([ep])
                .map_err(|e| Error::AssetLoad(format!("{e}")))?;
        }
    }
    Ok(builder)
}

pub fn build_session(
    source: ModelSource<'_>,
    cfg: OrtRuntimeConfig,
) -> Result<(Session, InferenceProvider)> {
    if let ModelSource::File(path) = source {
        if !path.exists() {
            return Err(Error::AssetLoad(format!(
                "Model not found: {}",
                path.display()
            )));
        }
    }
    ensure_environment()?;

    let try_build = |use_dml: bool| -> Result<Session> {
        let build = || -> Result<Session> {
            let builder = configure(use_dml, cfg)?;
            match source {
                ModelSource::File(path) => builder.commit_from_file(path),
                ModelSource::Memory(bytes) => builder.commit_from_memory(bytes),
            }
            .map_err(|e| Error::AssetLoad(format!("{e}")))
        };
        match catch_unwind(AssertUnwindSafe(build)) {
            Ok(res) => res,
            Err(_) => Err(Error::AssetLoad(
                "ONNX Runtime panicked while building session".into(),
            )),
        }
    };

    let wants_dml = matches!(cfg.provider, ProviderChoice::Auto | ProviderChoice::DirectMLOnly);
    #[cfg(target_os = "windows")]
    {
        if wants_dml {
            if let Ok(true) = DirectMLExecutionProvider::default().is_available() {
                if let Ok(session) = try_build(true) {
                    return Ok((
                        session,
                        InferenceProvider::DirectML {
                            device_id: cfg.resolved_device_id(),
                        },
                    ));
                }
            }
        }
    }

    if wants_dml {
        log::warn!(
            "DirectML execution provider unavailable; falling back to CPU for {}",
            source.describe()
        );
    }

    let session = try_build(false)?;
    Ok((session, InferenceProvider::Cpu))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nhwc,
    Nchw,
}

/// Infers the memory layout and `[H, W, C]` input shape from declared dims.
///
/// Dynamic dimensions (`-1`) fall back to `default_size`; channels default to 3.
pub fn input_geometry(dims: &[i64], default_size: usize) -> (TensorLayout, [usize; 3]) {
    let known = |d: i64| (d > 0).then_some(d as usize);
    if dims.len() == 4 {
        match (known(dims[1]), known(dims[2]), known(dims[3])) {
            (Some(3), h, w) if known(dims[3]) != Some(3) => {
                return (
                    TensorLayout::Nchw,
                    [h.unwrap_or(default_size), w.unwrap_or(default_size), 3],
                );
            }
            (h, w, c) => {
                return (
                    TensorLayout::Nhwc,
                    [
                        h.unwrap_or(default_size),
                        w.unwrap_or(default_size),
                        c.unwrap_or(3),
                    ],
                );
            }
        }
    }
    (TensorLayout::Nhwc, [default_size, default_size, 3])
}

/// Product of declared output dims ignoring the batch axis; `None` if any is dynamic.
pub fn output_length(dims: &[i64]) -> Option<usize> {
    let tail = if dims.len() > 1 { &dims[1..] } else { dims };
    tail.iter()
        .try_fold(1usize, |acc, &d| (d > 0).then(|| acc * d as usize))
}

fn tensor_dims(value_type: &ValueType) -> Option<Vec<i64>> {
    match value_type {
        ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
        _ => None,
    }
}

/// ONNX Runtime backed forward pass.
pub struct OrtNetwork {
    session: Session,
    provider: InferenceProvider,
    layout: TensorLayout,
    input_shape: [usize; 3],
    output_len: Option<usize>,
}

impl OrtNetwork {
    pub fn load(
        source: ModelSource<'_>,
        cfg: OrtRuntimeConfig,
        default_size: usize,
    ) -> Result<Self> {
        let (session, provider) = build_session(source, cfg)?;
        let input_dims = session
            .inputs
            .first()
            .and_then(|input| tensor_dims(&input.input_type))
            .ok_or_else(|| Error::AssetLoad("Model declares no tensor input".into()))?;
        let output_dims = session
            .outputs
            .first()
            .and_then(|output| tensor_dims(&output.output_type))
            .ok_or_else(|| Error::AssetLoad("Model declares no tensor output".into()))?;
        let (layout, input_shape) = input_geometry(&input_dims, default_size);
        let output_len = output_length(&output_dims);
        log::info!(
            "Loaded model {} on {} (input {:?} {:?}, output {:?})",
            source.describe(),
            provider.label(),
            input_dims,
            layout,
            output_dims
        );
        Ok(Self {
            session,
            provider,
            layout,
            input_shape,
            output_len,
        })
    }

    pub fn provider(&self) -> InferenceProvider {
        self.provider
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }
}

impl Network for OrtNetwork {
    fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    fn forward(&mut self, input: &crate::preprocess::InputTensor) -> Result<Vec<f32>> {
        let [h, w, c] = self.input_shape;
        let (shape, data) = match self.layout {
            TensorLayout::Nhwc => (
                vec![1usize, h, w, c],
                input.iter().copied().collect::<Vec<f32>>(),
            ),
            TensorLayout::Nchw => (
                vec![1usize, c, h, w],
                crate::preprocess::hwc_to_chw(input),
            ),
        };
        let value = Tensor::from_array((shape.as_slice(), data))
            .map_err(|e| Error::Inference(format!("Invalid input tensor: {e}")))?;
        let outputs = self
            .session
            .run(ort::inputs![value])
            .map_err(|e| Error::Inference(format!("Failed to run model: {e}")))?;
        first_output_scores(&outputs)
    }
}

/// Scores from the first output of a run; classifiers declare exactly one.
fn first_output_scores(outputs: &SessionOutputs<'_>) -> Result<Vec<f32>> {
    if outputs.len() == 0 {
        return Err(Error::Inference("Model returned no outputs".into()));
    }
    let (_, scores) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| Error::Inference(format!("Unexpected output tensor: {e}")))?;
    Ok(scores.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nhwc_geometry_is_detected() {
        let (layout, shape) = input_geometry(&[1, 224, 224, 3], 224);
        assert_eq!(layout, TensorLayout::Nhwc);
        assert_eq!(shape, [224, 224, 3]);
    }

    #[test]
    fn nchw_geometry_is_detected() {
        let (layout, shape) = input_geometry(&[-1, 3, 224, 224], 224);
        assert_eq!(layout, TensorLayout::Nchw);
        assert_eq!(shape, [224, 224, 3]);
    }

    #[test]
    fn dynamic_spatial_dims_fall_back_to_default() {
        let (layout, shape) = input_geometry(&[-1, -1, -1, 3], 224);
        assert_eq!(layout, TensorLayout::Nhwc);
        assert_eq!(shape, [224, 224, 3]);
        let (_, shape) = input_geometry(&[1, 3], 224);
        assert_eq!(shape, [224, 224, 3]);
    }

    #[test]
    fn output_length_skips_batch_axis() {
        assert_eq!(output_length(&[1, 1000]), Some(1000));
        assert_eq!(output_length(&[-1, 1001]), Some(1001));
        assert_eq!(output_length(&[1, -1]), None);
    }

    #[test]
    fn missing_model_file_is_asset_load_failure() {
        let path = std::env::temp_dir().join("ic_missing_model.onnx");
        let _ = std::fs::remove_file(&path);
        let cfg = OrtRuntimeConfig {
            provider: ProviderChoice::CpuOnly,
            device_id: None,
            intra_threads: 1,
        };
        assert!(matches!(
            OrtNetwork::load(ModelSource::File(&path), cfg, 224),
            Err(Error::AssetLoad(_))
        ));
    }

    #[test]
    fn forward_reads_scores_through_session_outputs() {
        // Pins the output accessor against the ort version in Cargo.toml.
        let read: for<'a, 'r> fn(&'a SessionOutputs<'r>) -> Result<Vec<f32>> =
            first_output_scores;
        let _ = read;
    }

    #[test]
    fn provider_choice_serializes_snake_case() {
        let json = serde_json::to_string(&ProviderChoice::DirectMLOnly).unwrap();
        assert_eq!(json, "\"directml_only\"");
        let parsed: ProviderChoice = serde_json::from_str("\"cpu_only\"").unwrap();
        assert_eq!(parsed, ProviderChoice::CpuOnly);
    }
}
