use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use super::Backend;
use crate::llm::error::LoadError;
use crate::llm::model::{ModelHandle, ModelParams};

struct RuntimeInner<B: Backend> {
    backend: B,
    /// Number of live models. The backend is initialized while this is non-zero.
    live_models: Mutex<usize>,
}

impl<B: Backend> RuntimeInner<B> {
    fn live(&self) -> MutexGuard<'_, usize> {
        self.live_models.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Process-wide backend capability.
///
/// The backend is started when the first model is loaded and shut down when the last
/// model is freed. Clones share the same lifecycle.
pub struct Runtime<B: Backend> {
    inner: Arc<RuntimeInner<B>>,
}

impl<B: Backend> Clone for Runtime<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Runtime<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                backend,
                live_models: Mutex::new(0),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn system_info(&self) -> String {
        self.inner.backend.system_info()
    }

    /// Loads a model through this runtime. Equivalent to [`ModelHandle::load`].
    pub fn load_model(&self, path: impl AsRef<Path>, params: ModelParams) -> Result<ModelHandle<B>, LoadError> {
        ModelHandle::load(self, path, params)
    }

    pub fn live_models(&self) -> usize {
        *self.inner.live()
    }

    pub fn is_initialized(&self) -> bool {
        self.live_models() > 0
    }

    /// Registers one more live model, starting the backend if it was idle.
    pub(crate) fn acquire(&self) -> RuntimeLease<B> {
        let mut live = self.inner.live();
        if *live == 0 {
            info!("Initializing backend");
            self.inner.backend.init();
        }
        *live += 1;
        RuntimeLease {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Keeps the backend initialized for as long as it is held.
pub(crate) struct RuntimeLease<B: Backend> {
    inner: Arc<RuntimeInner<B>>,
}

impl<B: Backend> RuntimeLease<B> {
    pub(crate) fn backend(&self) -> &B {
        &self.inner.backend
    }
}

impl<B: Backend> Drop for RuntimeLease<B> {
    fn drop(&mut self) {
        let mut live = self.inner.live();
        *live = live.saturating_sub(1);
        if *live == 0 {
            info!("Last model freed, tearing down backend");
            self.inner.backend.teardown();
        }
    }
}
