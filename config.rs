use crate::error::Result;
use crate::onnx::{OrtRuntimeConfig, ProviderChoice};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_INPUT_SIZE: usize = 224;
pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub model_path: PathBuf,
    /// Falls back to the `<model>.labels.txt` sidecar when unset.
    #[serde(default)]
    pub labels_path: Option<PathBuf>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Zero leaves the runtime's own default in place.
    #[serde(default)]
    pub intra_threads: usize,
    #[serde(default = "default_provider")]
    pub provider: ProviderChoice,
    #[serde(default)]
    pub device_id: Option<u32>,
    #[serde(default = "default_input_size")]
    pub input_size: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("mobilenet_v2_1.0_224.onnx"),
            labels_path: None,
            top_k: DEFAULT_TOP_K,
            intra_threads: 0,
            provider: ProviderChoice::Auto,
            device_id: None,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_provider() -> ProviderChoice {
    ProviderChoice::Auto
}

fn default_input_size() -> usize {
    DEFAULT_INPUT_SIZE
}

impl ClassifierConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&contents)?;
        if let Some(parent) = path.parent() {
            config.model_path = resolve_relative(parent, &config.model_path);
            config.labels_path = config
                .labels_path
                .as_deref()
                .map(|labels| resolve_relative(parent, labels));
        }
        log::info!("Loaded classifier config from {}", path.display());
        Ok(config)
    }

    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(threads) = env_usize("IMAGE_CLASSIFIER_THREADS") {
            self.intra_threads = threads;
        }
        if let Some(top_k) = env_usize("IMAGE_CLASSIFIER_TOP_K") {
            self.top_k = top_k;
        }
        match env::var("IMAGE_CLASSIFIER_PROVIDER")
            .ok()
            .as_deref()
            .map(|v| v.to_ascii_lowercase())
        {
            Some(v) if v == "cpu" => self.provider = ProviderChoice::CpuOnly,
            Some(v) if v == "directml" || v == "dml" => {
                self.provider = ProviderChoice::DirectMLOnly
            }
            Some(v) if v == "auto" => self.provider = ProviderChoice::Auto,
            Some(other) => {
                log::warn!("Ignoring unknown IMAGE_CLASSIFIER_PROVIDER value: {other}");
            }
            None => {}
        }
        self
    }

    pub fn runtime(&self) -> OrtRuntimeConfig {
        OrtRuntimeConfig {
            provider: self.provider,
            device_id: self.device_id,
            intra_threads: self.intra_threads,
        }
    }

    pub fn resolved_labels_path(&self) -> PathBuf {
        match &self.labels_path {
            Some(path) => path.clone(),
            None => crate::labels::sidecar_path(&self.model_path),
        }
    }
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!("Ignoring {key}={raw}: {err}");
            None
        }
    }
}
