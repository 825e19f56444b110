use crate::config::ClassifierConfig;
use crate::error::{Error, Result};
use crate::onnx::{ModelSource, OrtNetwork};
use crate::preprocess::InputTensor;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A loaded network able to run one forward pass at a time.
///
/// `forward` takes `&mut self`: scratch state inside the runtime is reused
/// between calls, so a single instance never runs two passes concurrently.
pub trait Network: Send {
    /// Declared `[H, W, C]` input shape.
    fn input_shape(&self) -> [usize; 3];

    /// Declared output length, if the model states it statically.
    fn output_len(&self) -> Option<usize>;

    fn forward(&mut self, input: &InputTensor) -> Result<Vec<f32>>;
}

pub struct InferenceEngine {
    network: Box<dyn Network>,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("input_shape", &self.network.input_shape())
            .field("output_len", &self.network.output_len())
            .finish()
    }
}

impl InferenceEngine {
    pub fn new(network: impl Network + 'static) -> Self {
        Self {
            network: Box::new(network),
        }
    }

    pub fn load(config: &ClassifierConfig) -> Result<Self> {
        let network = OrtNetwork::load(
            ModelSource::File(&config.model_path),
            config.runtime(),
            config.input_size,
        )?;
        Ok(Self::new(network))
    }

    pub fn load_from_memory(model: &[u8], config: &ClassifierConfig) -> Result<Self> {
        let network = OrtNetwork::load(
            ModelSource::Memory(model),
            config.runtime(),
            config.input_size,
        )?;
        Ok(Self::new(network))
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.network.input_shape()
    }

    pub fn output_len(&self) -> Option<usize> {
        self.network.output_len()
    }

    pub fn execute(&mut self, tensor: &InputTensor) -> Result<Vec<f32>> {
        let expected = self.network.input_shape();
        if tensor.shape() != &expected[..] {
            return Err(Error::ShapeMismatch {
                expected: expected.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }
        let network = &mut self.network;
        match catch_unwind(AssertUnwindSafe(|| network.forward(tensor))) {
            Ok(res) => res,
            Err(_) => Err(Error::Inference("Inference runtime panicked".into())),
        }
    }

    /// Releases the runtime session now instead of at scope end.
    pub fn close(self) {
        log::debug!("Releasing inference engine {:?}", self.input_shape());
    }
}

/// An engine that either loaded successfully or never did.
#[derive(Debug, Default)]
pub enum EngineSlot {
    Ready(InferenceEngine),
    #[default]
    NotLoaded,
}

impl From<InferenceEngine> for EngineSlot {
    fn from(engine: InferenceEngine) -> Self {
        Self::Ready(engine)
    }
}

impl EngineSlot {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn engine_mut(&mut self) -> Result<&mut InferenceEngine> {
        match self {
            Self::Ready(engine) => Ok(engine),
            Self::NotLoaded => Err(Error::NotLoaded),
        }
    }

    pub fn execute(&mut self, tensor: &InputTensor) -> Result<Vec<f32>> {
        self.engine_mut()?.execute(tensor)
    }

    /// Tears the engine down; later calls report [`Error::NotLoaded`].
    pub fn unload(&mut self) {
        if let Self::Ready(engine) = std::mem::take(self) {
            engine.close();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FixedNetwork, PanickingNetwork};
    use super::*;
    use ndarray::Array3;

    fn input() -> InputTensor {
        Array3::zeros((224, 224, 3))
    }

    #[test]
    fn execute_returns_network_output() {
        let mut engine = InferenceEngine::new(FixedNetwork::new(vec![0.1, 0.9]));
        assert_eq!(engine.execute(&input()).unwrap(), vec![0.1, 0.9]);
        assert_eq!(engine.output_len(), Some(2));
    }

    #[test]
    fn execute_rejects_wrong_shape() {
        let mut engine = InferenceEngine::new(FixedNetwork::new(vec![1.0]));
        let err = engine.execute(&Array3::zeros((112, 112, 3))).unwrap_err();
        match err {
            Error::ShapeMismatch { expected, actual } => {
                assert_eq!(expected, vec![224, 224, 3]);
                assert_eq!(actual, vec![112, 112, 3]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn runtime_panic_becomes_inference_error() {
        let mut engine = InferenceEngine::new(PanickingNetwork);
        assert!(matches!(engine.execute(&input()), Err(Error::Inference(_))));
    }

    #[test]
    fn corrupt_model_blob_is_asset_load_failure() {
        let config = ClassifierConfig {
            provider: crate::onnx::ProviderChoice::CpuOnly,
            ..ClassifierConfig::default()
        };
        assert!(matches!(
            InferenceEngine::load_from_memory(b"not a model", &config),
            Err(Error::AssetLoad(_))
        ));
    }

    #[test]
    fn unloaded_slot_reports_not_loaded() {
        let mut slot = EngineSlot::NotLoaded;
        assert!(!slot.is_ready());
        assert!(matches!(slot.execute(&input()), Err(Error::NotLoaded)));
    }

    #[test]
    fn unload_tears_engine_down() {
        let mut slot = EngineSlot::from(InferenceEngine::new(FixedNetwork::new(vec![1.0])));
        assert!(slot.execute(&input()).is_ok());
        slot.unload();
        assert!(matches!(slot.execute(&input()), Err(Error::NotLoaded)));
    }
}
