//! Synthesis manager: keeps the model context resident and queues requests.
//!
//! The manager owns one [`AudioSynthesisEngine`] on a dedicated worker thread.
//! Callers submit requests through a bounded channel and are answered in
//! arrival order, so the device only ever sees one sampling call at a time.
//! Failures are returned as-is; retry policy belongs to the caller.
//!
//! # Example
//!
//! ```no_run
//! use photong::config::EngineConfig;
//! use photong::engine::GenerateRequest;
//! use photong::manager::SynthesisManager;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = SynthesisManager::start(EngineConfig::default()).await.unwrap();
//!     let clip = manager
//!         .generate(GenerateRequest::new("acoustic folk guitar", 42))
//!         .await
//!         .unwrap();
//!     println!("{:.2}s", clip.duration_s);
//! }
//! ```

use std::sync::{Arc, Mutex};

use candle_core::Device;
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::engine::{AudioSynthesisEngine, GenerateRequest, InterpolateRequest, SynthesizedClip};
use crate::sampler::ConditionedSampler;
use crate::{Error, Result};

const QUEUE_DEPTH: usize = 64;

/// Work item for the engine thread.
enum Job {
    Generate {
        request: GenerateRequest,
        reply: oneshot::Sender<Result<SynthesizedClip>>,
    },
    Interpolate {
        request: InterpolateRequest,
        reply: oneshot::Sender<Result<SynthesizedClip>>,
    },
    Release {
        done: oneshot::Sender<()>,
    },
}

/// Handle for submitting synthesis requests to a running manager.
#[derive(Clone)]
pub struct SynthesisManager {
    tx: Arc<Mutex<Option<mpsc::Sender<Job>>>>,
}

impl SynthesisManager {
    /// Load the diffusion model and start the engine thread.
    ///
    /// Weights are fetched from the HuggingFace hub on first use unless
    /// `config.model.local_dir` points at a local copy.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        // Loading does synchronous I/O and heavy compute.
        let engine = tokio::task::spawn_blocking(move || {
            let device = preferred_device(config.model.cuda_device);
            tracing::info!(device = ?device, checkpoint = %config.model.checkpoint, "loading model");
            AudioSynthesisEngine::load(config, &device)
        })
        .await
        .map_err(|join_error| Error::Manager(format!("model load task panicked: {join_error}")))??;

        Ok(Self::with_engine(engine))
    }

    /// Start the engine thread around an already constructed engine.
    pub fn with_engine<S>(engine: AudioSynthesisEngine<S>) -> Self
    where
        S: ConditionedSampler + 'static,
    {
        let (tx, rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        tokio::task::spawn_blocking(move || run_engine(engine, rx));
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Submit a single-prompt request and wait for the clip.
    pub async fn generate(&self, request: GenerateRequest) -> Result<SynthesizedClip> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(Job::Generate { request, reply }).await?;
        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }

    /// Submit an interpolation request and wait for the clip.
    pub async fn interpolate(&self, request: InterpolateRequest) -> Result<SynthesizedClip> {
        let (reply, reply_rx) = oneshot::channel();
        self.submit(Job::Interpolate { request, reply }).await?;
        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }

    /// Finish queued work, then drop the engine and free its device memory.
    ///
    /// Every handle sharing this manager fails with [`Error::Manager`] afterwards.
    pub async fn release(&self) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.submit(Job::Release { done }).await?;
        self.close();
        done_rx
            .await
            .map_err(|_| Error::Manager("engine thread exited before release".into()))
    }

    pub fn is_released(&self) -> bool {
        self.sender().is_none()
    }

    async fn submit(&self, job: Job) -> Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| Error::Manager("manager has been released".into()))?;
        tx.send(job)
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.tx.lock().ok().and_then(|guard| guard.clone())
    }

    fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

/// The engine loop, run on a dedicated blocking thread.
fn run_engine<S: ConditionedSampler>(
    mut engine: AudioSynthesisEngine<S>,
    mut rx: mpsc::Receiver<Job>,
) {
    while let Some(job) = rx.blocking_recv() {
        match job {
            // Ignore send errors: the caller may have given up.
            Job::Generate { request, reply } => {
                let _ = reply.send(engine.generate(&request));
            }
            Job::Interpolate { request, reply } => {
                let _ = reply.send(engine.interpolate(&request));
            }
            Job::Release { done } => {
                rx.close();
                drop(engine);
                tracing::info!("model context released");
                let _ = done.send(());
                return;
            }
        }
    }
    tracing::info!("synthesis manager shut down");
}

/// Return the preferred device: CUDA if available, otherwise CPU.
pub fn preferred_device(cuda_ordinal: usize) -> Device {
    Device::cuda_if_available(cuda_ordinal).unwrap_or(Device::Cpu)
}
