use crate::config::ClassifierConfig;
use crate::engine::{EngineSlot, InferenceEngine};
use crate::error::{Error, Result};
use crate::labels::LabelTable;
use crate::models::Classification;
use crate::preprocess::Preprocessor;
use crate::ranking;
use chrono::Utc;
use image::RgbaImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Preprocess, forward pass and ranking behind one call.
#[derive(Debug)]
pub struct ClassificationPipeline {
    preprocessor: Preprocessor,
    engine: EngineSlot,
    labels: LabelTable,
    top_k: usize,
}

impl ClassificationPipeline {
    pub fn new(engine: InferenceEngine, labels: LabelTable, top_k: usize) -> Self {
        let [height, width, _] = engine.input_shape();
        if height != width {
            log::warn!("Model input is not square ({height}x{width}); inputs will mismatch");
        }
        match engine.output_len() {
            Some(len) if len != labels.len() => log::warn!(
                "Model outputs {len} classes but {} labels are loaded; extra indices map to Unknown",
                labels.len()
            ),
            _ => {}
        }
        Self {
            preprocessor: Preprocessor::new(height),
            engine: EngineSlot::Ready(engine),
            labels,
            top_k,
        }
    }

    /// Loads labels and model; either one failing is an [`Error::AssetLoad`].
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let labels = LabelTable::load(&config.resolved_labels_path())?;
        let engine = InferenceEngine::load(config)?;
        Ok(Self::new(engine, labels, config.top_k))
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_ready()
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn classify(&mut self, pixels: &RgbaImage) -> Result<Classification> {
        let engine = self.engine.engine_mut()?;
        let tensor = self.preprocessor.preprocess(pixels)?;

        let started = Instant::now();
        let output = engine.execute(&tensor)?;
        let elapsed = started.elapsed();

        let results = ranking::rank(&output, &self.labels, self.top_k);
        match results.first() {
            Some(top) => log::info!(
                "Classified {}x{} image as {} ({:.2}) in {} ms",
                pixels.width(),
                pixels.height(),
                top.label,
                top.confidence,
                elapsed.as_millis()
            ),
            None if output.is_empty() => {
                log::warn!("Model produced no scores ({} ms)", elapsed.as_millis())
            }
            None => log::info!(
                "Classified {}x{} image with top_k = 0; {} scores not reported ({} ms)",
                pixels.width(),
                pixels.height(),
                output.len(),
                elapsed.as_millis()
            ),
        }
        Ok(Classification {
            results,
            elapsed,
            classified_at: Utc::now(),
        })
    }

    /// Releases the model; subsequent calls fail with [`Error::NotLoaded`].
    pub fn close(&mut self) {
        self.engine.unload();
    }
}

/// Async entry point that runs classification on tokio's blocking pool.
///
/// Admits one call at a time; a call made while another is running gets
/// [`Error::Busy`] instead of queueing.
#[derive(Clone)]
pub struct SharedPipeline {
    pipeline: Arc<Mutex<ClassificationPipeline>>,
    in_flight: Arc<AtomicBool>,
}

struct AdmissionGuard(Arc<AtomicBool>);

impl AdmissionGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SharedPipeline {
    pub fn new(pipeline: ClassificationPipeline) -> Self {
        Self {
            pipeline: Arc::new(Mutex::new(pipeline)),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub async fn classify(&self, pixels: RgbaImage) -> Result<Classification> {
        let guard = AdmissionGuard::acquire(&self.in_flight).inspect_err(|_| {
            log::warn!("Rejected classification request; another one is running");
        })?;
        let pipeline = self.pipeline.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut pipeline = pipeline
                .lock()
                .map_err(|_| Error::Inference("Pipeline lock poisoned".into()))?;
            pipeline.classify(&pixels)
        })
        .await
        .map_err(|e| {
            log::warn!("Classification task join error: {e}");
            Error::WorkerGone
        })?
    }

    pub fn close(&self) {
        if let Ok(mut pipeline) = self.pipeline.lock() {
            pipeline.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FixedNetwork;
    use crate::onnx::ProviderChoice;
    use image::Rgba;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn table(n: usize) -> LabelTable {
        (0..n).map(|i| format!("class_{i}")).collect()
    }

    fn solid(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([10, 20, 30, 255]))
    }

    #[test]
    fn classify_ranks_network_output() {
        let mut scores = vec![0.0; 10];
        scores[7] = 0.6;
        scores[2] = 0.3;
        let engine = InferenceEngine::new(FixedNetwork::new(scores));
        let mut pipeline = ClassificationPipeline::new(engine, table(10), 5);

        let classification = pipeline.classify(&solid(640, 480)).unwrap();
        assert_eq!(classification.results.len(), 5);
        assert_eq!(classification.results[0].label, "class_7");
        assert_eq!(classification.results[1].label, "class_2");
        assert_eq!(classification.top().map(|r| r.confidence), Some(0.6));
    }

    #[test]
    fn elapsed_covers_the_forward_pass() {
        let mut network = FixedNetwork::new(vec![1.0]);
        network.delay = Some(Duration::from_millis(30));
        let mut pipeline = ClassificationPipeline::new(InferenceEngine::new(network), table(1), 5);

        let classification = pipeline.classify(&solid(8, 8)).unwrap();
        assert!(classification.elapsed_ms() >= 30);
    }

    #[test]
    fn invalid_image_is_propagated_and_pipeline_survives() {
        let network = FixedNetwork::new(vec![0.5, 0.5]);
        let calls = network.calls.clone();
        let mut pipeline = ClassificationPipeline::new(InferenceEngine::new(network), table(2), 5);

        assert!(matches!(
            pipeline.classify(&RgbaImage::new(0, 0)),
            Err(Error::InvalidImage(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(pipeline.classify(&solid(3, 3)).is_ok());
    }

    #[test]
    fn shape_mismatch_is_propagated() {
        let mut network = FixedNetwork::new(vec![1.0]);
        network.input_shape = [224, 224, 1];
        let mut pipeline = ClassificationPipeline::new(InferenceEngine::new(network), table(1), 5);
        assert!(matches!(
            pipeline.classify(&solid(4, 4)),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn closed_pipeline_reports_not_loaded() {
        let engine = InferenceEngine::new(FixedNetwork::new(vec![1.0]));
        let mut pipeline = ClassificationPipeline::new(engine, table(1), 5);
        pipeline.close();
        assert!(!pipeline.is_ready());
        assert!(matches!(
            pipeline.classify(&solid(4, 4)),
            Err(Error::NotLoaded)
        ));
    }

    #[test]
    fn zero_top_k_runs_the_model_and_reports_nothing() {
        let network = FixedNetwork::new(vec![0.2, 0.8]);
        let calls = network.calls.clone();
        let mut pipeline = ClassificationPipeline::new(InferenceEngine::new(network), table(2), 0);

        let classification = pipeline.classify(&solid(4, 4)).unwrap();
        assert!(classification.results.is_empty());
        assert!(classification.top().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_model_output_yields_empty_results() {
        let engine = InferenceEngine::new(FixedNetwork::new(Vec::new()));
        let mut pipeline = ClassificationPipeline::new(engine, table(1), 5);
        assert!(pipeline.classify(&solid(4, 4)).unwrap().results.is_empty());
    }

    #[test]
    fn missing_assets_fail_construction() {
        let dir = std::env::temp_dir().join("ic_pipeline_assets");
        std::fs::create_dir_all(&dir).unwrap();
        let model_path = dir.join("absent.onnx");
        let _ = std::fs::remove_file(&model_path);
        let mut config = ClassifierConfig {
            model_path: model_path.clone(),
            provider: ProviderChoice::CpuOnly,
            ..ClassifierConfig::default()
        };

        // No labels sidecar yet.
        let _ = std::fs::remove_file(crate::labels::sidecar_path(&model_path));
        assert!(matches!(
            ClassificationPipeline::from_config(&config),
            Err(Error::AssetLoad(_))
        ));

        // Labels present, model still missing.
        let labels_path = dir.join("labels.txt");
        std::fs::write(&labels_path, "cat\ndog\n").unwrap();
        config.labels_path = Some(labels_path);
        assert!(matches!(
            ClassificationPipeline::from_config(&config),
            Err(Error::AssetLoad(_))
        ));
    }

    #[tokio::test]
    async fn shared_pipeline_classifies_off_thread() {
        let engine = InferenceEngine::new(FixedNetwork::new(vec![0.2, 0.8]));
        let shared = SharedPipeline::new(ClassificationPipeline::new(engine, table(2), 5));
        let classification = shared.classify(solid(32, 32)).await.unwrap();
        assert_eq!(classification.results[0].label, "class_1");
        assert!(!shared.is_busy());
    }

    #[tokio::test]
    async fn shared_pipeline_rejects_second_request_while_busy() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let mut network = FixedNetwork::new(vec![1.0]);
        network.gate = Some(gate.clone());
        let calls = network.calls.clone();
        let shared = SharedPipeline::new(ClassificationPipeline::new(
            InferenceEngine::new(network),
            table(1),
            5,
        ));

        let first = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.classify(solid(4, 4)).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(matches!(
            shared.classify(solid(4, 4)).await,
            Err(Error::Busy)
        ));
        drop(held);

        assert!(first.await.unwrap().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(shared.classify(solid(4, 4)).await.is_ok());
    }
}
