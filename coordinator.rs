use crate::config::ClassifierConfig;
use crate::error::{Error, Result};
use crate::models::Classification;
use crate::pipeline::ClassificationPipeline;
use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const WORKER_POLL: Duration = Duration::from_millis(200);

/// Where the caller-facing classification flow currently stands.
#[derive(Debug)]
pub enum PipelineState {
    Idle,
    Selecting,
    Processing {
        request: Uuid,
    },
    /// Holds the classified image until the state moves on.
    ShowingResults {
        request: Uuid,
        classification: Classification,
        image: RgbaImage,
    },
    Failed {
        request: Option<Uuid>,
        reason: FailureReason,
    },
}

impl PipelineState {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Selecting => Phase::Selecting,
            Self::Processing { .. } => Phase::Processing,
            Self::ShowingResults { .. } => Phase::ShowingResults,
            Self::Failed { .. } => Phase::Failed,
        }
    }

    pub fn name(&self) -> &'static str {
        self.phase().name()
    }

    fn snapshot(&self) -> PipelineSnapshot {
        let mut snapshot = PipelineSnapshot {
            phase: self.phase(),
            request: None,
            classification: None,
            image_size: None,
            failure: None,
        };
        match self {
            Self::Idle | Self::Selecting => {}
            Self::Processing { request } => snapshot.request = Some(*request),
            Self::ShowingResults {
                request,
                classification,
                image,
            } => {
                snapshot.request = Some(*request);
                snapshot.classification = Some(classification.clone());
                snapshot.image_size = Some(image.dimensions());
            }
            Self::Failed { request, reason } => {
                snapshot.request = *request;
                snapshot.failure = Some(reason.clone());
            }
        }
        snapshot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Selecting,
    Processing,
    ShowingResults,
    Failed,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Selecting => "Selecting",
            Self::Processing => "Processing",
            Self::ShowingResults => "ShowingResults",
            Self::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: String,
    pub message: String,
}

impl From<&Error> for FailureReason {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// What observers see of a state; the image itself stays with the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub phase: Phase,
    pub request: Option<Uuid>,
    pub classification: Option<Classification>,
    pub image_size: Option<(u32, u32)>,
    pub failure: Option<FailureReason>,
}

struct Job {
    request: Uuid,
    image: RgbaImage,
}

struct Completion {
    request: Uuid,
    image: RgbaImage,
    outcome: Result<Classification>,
}

/// Drives one [`ClassificationPipeline`] from a caller thread.
///
/// State only changes on the caller's thread, through the event methods and
/// [`poll`](Self::poll)/[`wait`](Self::wait). Classification runs on a
/// dedicated worker that owns the pipeline, so two forward passes never
/// overlap. While a live request is processing, further submissions get
/// [`Error::Busy`]. A cancelled request keeps running to completion on the
/// worker and its result is dropped when it arrives.
pub struct PipelineCoordinator {
    state: PipelineState,
    live: Option<Uuid>,
    jobs: Option<Sender<Job>>,
    completions: Receiver<Completion>,
    observers: Vec<Sender<PipelineSnapshot>>,
    worker: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl PipelineCoordinator {
    pub fn new(pipeline: ClassificationPipeline) -> Result<Self> {
        let (job_tx, job_rx) = bounded::<Job>(1);
        let (done_tx, done_rx) = bounded::<Completion>(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("classifier-worker".into())
                .spawn(move || run_worker(pipeline, job_rx, done_tx, shutdown))?
        };
        Ok(Self {
            state: PipelineState::Idle,
            live: None,
            jobs: Some(job_tx),
            completions: done_rx,
            observers: Vec::new(),
            worker: Some(worker),
            shutdown,
        })
    }

    /// Loads model and labels up front; asset problems are returned, not deferred.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        Self::new(ClassificationPipeline::from_config(config)?)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.state.snapshot()
    }

    pub fn image(&self) -> Option<&RgbaImage> {
        match &self.state {
            PipelineState::ShowingResults { image, .. } => Some(image),
            _ => None,
        }
    }

    /// New observers immediately receive the current state, then every transition.
    pub fn subscribe(&mut self) -> Receiver<PipelineSnapshot> {
        let (tx, rx) = unbounded();
        let _ = tx.send(self.state.snapshot());
        self.observers.push(tx);
        rx
    }

    pub fn request_source_selection(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Idle => {
                self.transition(PipelineState::Selecting);
                Ok(())
            }
            _ => Err(self.invalid("request_source_selection")),
        }
    }

    pub fn cancel_selection(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Selecting => {
                self.transition(PipelineState::Idle);
                Ok(())
            }
            _ => Err(self.invalid("cancel_selection")),
        }
    }

    /// Hands an acquired image to the worker and moves to `Processing`.
    pub fn submit_image(&mut self, image: RgbaImage) -> Result<Uuid> {
        match self.state {
            PipelineState::Selecting => {}
            PipelineState::Processing { .. } => {
                log::warn!("Rejected image while a classification is already processing");
                return Err(Error::Busy);
            }
            _ => return Err(self.invalid("submit_image")),
        }
        let jobs = self.jobs.as_ref().ok_or(Error::WorkerGone)?;
        let request = Uuid::new_v4();
        match jobs.try_send(Job { request, image }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Rejected image; worker is still finishing a cancelled request");
                return Err(Error::Busy);
            }
            Err(TrySendError::Disconnected(_)) => return Err(Error::WorkerGone),
        }
        self.live = Some(request);
        self.transition(PipelineState::Processing { request });
        Ok(request)
    }

    /// Abandons the running request; its result will be discarded on arrival.
    pub fn cancel_processing(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Processing { request } => {
                log::info!("Cancelled classification {request}");
                self.live = None;
                self.transition(PipelineState::Idle);
                Ok(())
            }
            _ => Err(self.invalid("cancel_processing")),
        }
    }

    /// Leaves `ShowingResults` or `Failed`, releasing any held image.
    pub fn dismiss(&mut self) -> Result<()> {
        match &self.state {
            PipelineState::ShowingResults { image, .. } => {
                log::debug!("Releasing {}x{} image", image.width(), image.height());
                self.transition(PipelineState::Idle);
                Ok(())
            }
            PipelineState::Failed { .. } => {
                self.transition(PipelineState::Idle);
                Ok(())
            }
            _ => Err(self.invalid("dismiss")),
        }
    }

    /// Applies every completion already delivered, without blocking.
    ///
    /// Returns whether the state changed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        loop {
            match self.completions.try_recv() {
                Ok(completion) => changed |= self.apply(completion),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    changed |= self.worker_lost();
                    break;
                }
            }
        }
        changed
    }

    /// Blocks until the live request completes or `timeout` passes.
    ///
    /// Returns `Ok(false)` on timeout or when nothing is processing.
    pub fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while self.live.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(completion) => {
                    if self.apply(completion) {
                        return Ok(true);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => {
                    self.worker_lost();
                    return Err(Error::WorkerGone);
                }
            }
        }
        Ok(false)
    }

    /// Stops the worker and releases the model.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Relaxed);
        self.jobs = None;
        // Unblocks a worker stuck delivering a completion nobody will read.
        drop(std::mem::replace(
            &mut self.completions,
            crossbeam_channel::never(),
        ));
        if worker.join().is_err() {
            log::warn!("Classification worker panicked during shutdown");
        }
        self.live = None;
        log::info!("Classification coordinator shut down");
    }

    fn apply(&mut self, completion: Completion) -> bool {
        if self.live != Some(completion.request) {
            log::warn!(
                "Discarding result of stale classification {}",
                completion.request
            );
            return false;
        }
        self.live = None;
        let next = match completion.outcome {
            Ok(classification) => PipelineState::ShowingResults {
                request: completion.request,
                classification,
                image: completion.image,
            },
            Err(err) => {
                log::warn!("Classification {} failed: {err}", completion.request);
                PipelineState::Failed {
                    request: Some(completion.request),
                    reason: FailureReason::from(&err),
                }
            }
        };
        self.transition(next);
        true
    }

    fn worker_lost(&mut self) -> bool {
        self.jobs = None;
        let Some(request) = self.live.take() else {
            return false;
        };
        log::warn!("Classification worker exited while {request} was processing");
        self.transition(PipelineState::Failed {
            request: Some(request),
            reason: FailureReason::from(&Error::WorkerGone),
        });
        true
    }

    fn transition(&mut self, next: PipelineState) {
        log::debug!("Pipeline state {} -> {}", self.state.name(), next.name());
        self.state = next;
        let snapshot = self.state.snapshot();
        self.observers
            .retain(|observer| observer.send(snapshot.clone()).is_ok());
    }

    fn invalid(&self, event: &'static str) -> Error {
        Error::InvalidTransition {
            state: self.state.name(),
            event,
        }
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    mut pipeline: ClassificationPipeline,
    rx: Receiver<Job>,
    tx: Sender<Completion>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let job = match rx.recv_timeout(WORKER_POLL) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let outcome = match catch_unwind(AssertUnwindSafe(|| pipeline.classify(&job.image))) {
            Ok(res) => res,
            Err(_) => Err(Error::Inference(
                "Classification panicked; result discarded".into(),
            )),
        };
        let completion = Completion {
            request: job.request,
            image: job.image,
            outcome,
        };
        if tx.send(completion).is_err() {
            break;
        }
    }
    pipeline.close();
    log::debug!("Classification worker stopped");
}
