use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::generation::{GenerationOptions, GenerationStream, Prompt};
use super::params::ContextParams;
use crate::llm::backend::{Backend, Evaluation};
use crate::llm::error::{ConfigError, ContextOverflow, EvalError, EvaluateError, TokenizeError};
use crate::llm::model::{ModelHandle, ModelShared};
use crate::llm::tokenizer::{Token, Tokenizer};

/// KV-cache bookkeeping guarded by the context's lock.
struct CacheState<B: Backend> {
    // Emptied only by `drop`.
    native: Option<B::Context>,
    /// Tokens committed to the cache so far
    occupied: usize,
    /// Set when the native cache may no longer match `occupied`
    poisoned: bool,
}

impl<B: Backend> CacheState<B> {
    fn native_mut(&mut self) -> Result<&mut B::Context, EvalError> {
        self.native.as_mut().ok_or(EvalError::Poisoned)
    }
}

/// Mutable per-session state over a shared model.
///
/// `evaluate` is the only state transition. Calls on one context are serialized by an
/// internal lock; separate contexts over the same model run independently.
pub struct InferenceContext<B: Backend> {
    id: Uuid,
    params: ContextParams,
    state: Mutex<CacheState<B>>,
    model: Arc<ModelShared<B>>,
}

impl<B: Backend> fmt::Debug for InferenceContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceContext")
            .field("id", &self.id)
            .field("model", &self.model.id())
            .field("n_ctx", &self.params.n_ctx)
            .finish()
    }
}

impl<B: Backend> InferenceContext<B> {
    /// Creates a context with a KV-cache of `params.n_ctx` tokens.
    ///
    /// # Errors
    ///
    /// `ConfigError` if the handle was released, a size is zero, a float knob is not
    /// finite, the model was loaded vocab-only, or the backend finds the cache/rope
    /// configuration incompatible with the model.
    pub fn create(model: &ModelHandle<B>, params: ContextParams) -> Result<Self, ConfigError> {
        let shared = model.share()?;
        params.validate()?;
        if shared.params().vocab_only {
            return Err(ConfigError::VocabOnly);
        }

        let native = shared.backend().new_context(shared.native(), &params)?;
        let id = Uuid::new_v4();
        info!(
            context = %id,
            model = %shared.id(),
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_threads = params.n_threads,
            "Created inference context"
        );

        Ok(Self {
            id,
            params,
            state: Mutex::new(CacheState {
                native: Some(native),
                occupied: 0,
                poisoned: false,
            }),
            model: shared,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState<B>>, EvalError> {
        self.state.lock().map_err(|_| EvalError::Poisoned)
    }

    /// Appends `tokens` to the KV-cache and runs one forward pass over them.
    ///
    /// Waits if another evaluation on this context is in flight. On any error the cache
    /// is left exactly as it was before the call.
    pub fn evaluate(&self, tokens: &[Token]) -> Result<Evaluation, EvaluateError> {
        self.check_batch(tokens)?;
        let mut state = self.lock()?;
        self.commit(&mut state, tokens)
    }

    /// Like [`evaluate`](Self::evaluate) but fails with `EvalError::Busy` instead of waiting.
    pub fn try_evaluate(&self, tokens: &[Token]) -> Result<Evaluation, EvaluateError> {
        self.check_batch(tokens)?;
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return Err(EvalError::Busy.into()),
            Err(TryLockError::Poisoned(_)) => return Err(EvalError::Poisoned.into()),
        };
        self.commit(&mut state, tokens)
    }

    fn check_batch(&self, tokens: &[Token]) -> Result<(), EvalError> {
        if tokens.is_empty() {
            return Err(EvalError::EmptyBatch);
        }
        let vocab_size = self.model.backend().vocab_size(self.model.native());
        if let Some(&token) = tokens.iter().find(|t| t.0 as usize >= vocab_size) {
            return Err(EvalError::InvalidToken { token, vocab_size });
        }
        Ok(())
    }

    fn commit(&self, state: &mut CacheState<B>, tokens: &[Token]) -> Result<Evaluation, EvaluateError> {
        if state.poisoned {
            return Err(EvalError::Poisoned.into());
        }
        let capacity = self.capacity();
        let before = state.occupied;
        if before + tokens.len() > capacity {
            let overflow = ContextOverflow {
                occupied: before,
                requested: tokens.len(),
                capacity,
            };
            warn!(context = %self.id, %overflow, "Rejected evaluation");
            return Err(overflow.into());
        }

        let backend = self.model.backend();
        let mut output = None;
        for chunk in tokens.chunks(self.params.effective_batch()) {
            match backend.forward(state.native_mut()?, chunk) {
                Ok(evaluation) => output = Some(evaluation),
                Err(e) => {
                    warn!(context = %self.id, error = %e, "Forward pass failed, rolling back");
                    if let Err(rollback) = backend.truncate(state.native_mut()?, before) {
                        error!(context = %self.id, error = %rollback, "Rollback failed, context poisoned");
                        state.poisoned = true;
                    }
                    return Err(e.into());
                }
            }
        }

        state.occupied = before + tokens.len();
        debug!(
            context = %self.id,
            batch = tokens.len(),
            occupied = state.occupied,
            capacity,
            "Evaluated batch"
        );
        // `tokens` is non-empty, so at least one chunk ran.
        output.ok_or_else(|| EvalError::EmptyBatch.into())
    }

    /// Clears the KV-cache. The context stays usable.
    ///
    /// A successful reset also recovers a context poisoned by a failed rollback.
    pub fn reset(&self) -> Result<(), EvalError> {
        let mut state = self.lock()?;
        if let Err(e) = self.model.backend().truncate(state.native_mut()?, 0) {
            state.poisoned = true;
            return Err(e);
        }
        state.occupied = 0;
        state.poisoned = false;
        info!(context = %self.id, "Context reset");
        Ok(())
    }

    /// Starts a pull-based generation over this context.
    pub fn generate(
        &self,
        prompt: impl Into<Prompt>,
        options: GenerationOptions,
    ) -> Result<GenerationStream<'_, B>, TokenizeError> {
        GenerationStream::start(self, prompt, options)
    }

    /// Number of tokens currently held in the KV-cache.
    pub fn occupied(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.occupied,
            Err(poisoned) => poisoned.into_inner().occupied,
        }
    }

    pub fn capacity(&self) -> usize {
        self.params.n_ctx as usize
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tokenizer(&self) -> Tokenizer<B> {
        Tokenizer::new(Arc::clone(&self.model))
    }

    pub fn model_description(&self) -> String {
        self.model.backend().describe(self.model.native())
    }
}

impl<B: Backend> Drop for InferenceContext<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(native) = state.native.take() {
            self.model.backend().free_context(native);
            info!(context = %self.id, "Freed inference context");
        }
    }
}
