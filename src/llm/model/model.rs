use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::params::ModelParams;
use crate::llm::backend::{Backend, Runtime, RuntimeLease};
use crate::llm::error::{ConfigError, LoadError};
use crate::llm::session::{ContextParams, InferenceContext};
use crate::llm::tokenizer::Tokenizer;

/// Loaded weight state shared by a handle, its tokenizers and its contexts.
///
/// The native model is freed when the last `Arc` goes away.
pub(crate) struct ModelShared<B: Backend> {
    id: Uuid,
    path: PathBuf,
    params: ModelParams,
    // Emptied only by `drop`.
    native: Option<B::Model>,
    // Dropped after `native` has been freed, so teardown always comes last.
    lease: RuntimeLease<B>,
}

impl<B: Backend> ModelShared<B> {
    pub(crate) fn backend(&self) -> &B {
        self.lease.backend()
    }

    pub(crate) fn native(&self) -> &B::Model {
        match &self.native {
            Some(native) => native,
            None => unreachable!("model weights used after free"),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn params(&self) -> &ModelParams {
        &self.params
    }
}

impl<B: Backend> Drop for ModelShared<B> {
    fn drop(&mut self) {
        info!(model = %self.id, path = %self.path.display(), "Freeing model weights");
        if let Some(native) = self.native.take() {
            self.lease.backend().free_model(native);
        }
    }
}

/// Owner of a loaded model.
///
/// Contexts created from the handle keep the weights alive on their own, so the handle
/// may be released before them. Once released, the handle cannot create anything new.
pub struct ModelHandle<B: Backend> {
    shared: Option<Arc<ModelShared<B>>>,
}

impl<B: Backend> fmt::Debug for ModelHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shared {
            Some(shared) => f
                .debug_struct("ModelHandle")
                .field("id", &shared.id)
                .field("path", &shared.path)
                .field("params", &shared.params)
                .field("references", &Arc::strong_count(shared))
                .finish(),
            None => f.debug_struct("ModelHandle").field("released", &true).finish(),
        }
    }
}

impl<B: Backend> ModelHandle<B> {
    /// Loads a model file through `runtime`.
    ///
    /// # Errors
    ///
    /// Returns a `LoadError` when the file is missing, corrupt or unsupported, when the
    /// requested offload/mmap configuration does not fit in memory, or when `params` are
    /// contradictory.
    pub fn load(runtime: &Runtime<B>, path: impl AsRef<Path>, params: ModelParams) -> Result<Self, LoadError> {
        let path = path.as_ref();
        params.validate()?;

        let lease = runtime.acquire();
        info!(
            path = %path.display(),
            gpu_layers = params.gpu_layers,
            vocab_only = params.vocab_only,
            use_mmap = params.use_mmap,
            use_mlock = params.use_mlock,
            "Loading model"
        );

        // On failure the lease drops here, tearing the backend down again if it was idle.
        let native = lease.backend().load(path, &params).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Model load failed");
            e
        })?;

        let shared = ModelShared {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            params,
            native: Some(native),
            lease,
        };
        info!(model = %shared.id, "Model loaded");

        Ok(Self {
            shared: Some(Arc::new(shared)),
        })
    }

    fn shared(&self) -> Result<&Arc<ModelShared<B>>, ConfigError> {
        self.shared.as_ref().ok_or(ConfigError::ModelReleased)
    }

    /// Human-readable summary (architecture, size, quantization) from the backend.
    pub fn describe(&self) -> Result<String, ConfigError> {
        let shared = self.shared()?;
        Ok(shared.backend().describe(shared.native()))
    }

    /// A tokenizer bound to this model's vocabulary.
    pub fn tokenizer(&self) -> Result<Tokenizer<B>, ConfigError> {
        Ok(Tokenizer::new(Arc::clone(self.shared()?)))
    }

    /// Creates a new inference context over this model.
    pub fn create_context(&self, params: ContextParams) -> Result<InferenceContext<B>, ConfigError> {
        InferenceContext::create(self, params)
    }

    pub(crate) fn share(&self) -> Result<Arc<ModelShared<B>>, ConfigError> {
        self.shared().map(Arc::clone)
    }

    /// Drops this handle's reference to the weights. Calling it again does nothing.
    pub fn release(&mut self) {
        if let Some(shared) = self.shared.take() {
            info!(
                model = %shared.id,
                remaining = Arc::strong_count(&shared) - 1,
                "Releasing model handle"
            );
        }
    }

    pub fn is_released(&self) -> bool {
        self.shared.is_none()
    }

    pub fn id(&self) -> Option<Uuid> {
        self.shared.as_ref().map(|s| s.id)
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.as_ref().map(|s| s.path.as_path())
    }

    pub fn params(&self) -> Option<&ModelParams> {
        self.shared.as_ref().map(|s| &s.params)
    }
}
