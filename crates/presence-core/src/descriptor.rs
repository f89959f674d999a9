//! Descriptor service: model lifecycle and the image → descriptor contract.

use crate::still::StillImage;
use crate::types::{Descriptor, FaceErrorCode};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    NotFound(String),
    #[error("model load failed: {0}")]
    LoadFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("no usable face detected")]
    NoFaceDetected,
    #[error("analysis failed: {0}")]
    AnalysisFailed(String),
    #[error("descriptor model is not ready")]
    NotReady,
}

impl AnalysisError {
    pub fn code(&self) -> FaceErrorCode {
        match self {
            Self::NoFaceDetected => FaceErrorCode::NoFaceDetected,
            Self::AnalysisFailed(_) | Self::NotReady => FaceErrorCode::AnalysisFailed,
        }
    }
}

/// A loaded model that turns a still into a descriptor.
#[async_trait]
pub trait DescriptorModel: Send + Sync {
    async fn compute(&self, image: &StillImage) -> Result<Descriptor, AnalysisError>;
}

/// Loads a [`DescriptorModel`]. Called at most once per successful load.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn DescriptorModel>, ModelError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    NotLoaded,
    Loading,
    Ready,
    Failed(ModelError),
}

struct Inner {
    loader: Box<dyn ModelLoader>,
    model: OnceCell<Arc<dyn DescriptorModel>>,
    readiness: Mutex<Readiness>,
}

/// Clone-safe handle to the descriptor model.
#[derive(Clone)]
pub struct DescriptorService {
    inner: Arc<Inner>,
}

impl DescriptorService {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader: Box::new(loader),
                model: OnceCell::new(),
                readiness: Mutex::new(Readiness::NotLoaded),
            }),
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.lock_readiness().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.model.initialized()
    }

    /// Load the model if needed.
    ///
    /// Concurrent callers wait on the one in-flight load. After a failure
    /// the next caller starts a fresh attempt.
    pub async fn ensure_loaded(&self) -> Result<(), ModelError> {
        self.inner
            .model
            .get_or_try_init(|| async {
                self.set_readiness(Readiness::Loading);
                let mut pending = PendingLoad {
                    service: self,
                    finished: false,
                };
                tracing::info!("loading descriptor model");
                let loaded = self.inner.loader.load().await;
                pending.finished = true;
                match loaded {
                    Ok(model) => {
                        self.set_readiness(Readiness::Ready);
                        tracing::info!("descriptor model ready");
                        Ok(model)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "descriptor model failed to load");
                        self.set_readiness(Readiness::Failed(e.clone()));
                        Err(e)
                    }
                }
            })
            .await
            .map(|_| ())
    }

    /// Compute a descriptor for `image`.
    ///
    /// Returns `NotReady` until [`ensure_loaded`](Self::ensure_loaded) has succeeded.
    pub async fn compute_descriptor(&self, image: &StillImage) -> Result<Descriptor, AnalysisError> {
        let model = self.inner.model.get().cloned().ok_or(AnalysisError::NotReady)?;
        let result = model.compute(image).await;
        match &result {
            Ok(d) => tracing::debug!(dims = d.len(), "descriptor computed"),
            Err(e) => tracing::debug!(error = %e, "descriptor extraction rejected"),
        }
        result
    }

    fn set_readiness(&self, readiness: Readiness) {
        *self.lock_readiness() = readiness;
    }

    fn lock_readiness(&self) -> std::sync::MutexGuard<'_, Readiness> {
        self.inner
            .readiness
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resets `Loading` to `NotLoaded` when a load future is dropped mid-flight.
struct PendingLoad<'a> {
    service: &'a DescriptorService,
    finished: bool,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut readiness = self.service.lock_readiness();
        if *readiness == Readiness::Loading {
            tracing::debug!("descriptor model load abandoned");
            *readiness = Readiness::NotLoaded;
        }
    }
}
