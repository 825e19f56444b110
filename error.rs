use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid Image: {0}")]
    InvalidImage(String),

    #[error("Asset Load Failed: {0}")]
    AssetLoad(String),

    #[error("Inference engine not loaded")]
    NotLoaded,

    #[error("Tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Inference Failed: {0}")]
    Inference(String),

    #[error("Classification already in progress")]
    Busy,

    #[error("Event '{event}' is not valid in state {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("Classification worker is no longer running")]
    WorkerGone,
}

impl Error {
    /// Stable name of the failure class, used in state snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::InvalidImage(_) => "invalid_image",
            Self::AssetLoad(_) => "asset_load",
            Self::NotLoaded => "not_loaded",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::Inference(_) => "inference",
            Self::Busy => "busy",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::WorkerGone => "worker_gone",
        }
    }
}
