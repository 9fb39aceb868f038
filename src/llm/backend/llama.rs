//! Adapter over the `llama_cpp` bindings.
//!
//! `llama_cpp` only exposes sampling through completion handles, so `forward` advances
//! the session and samples a single token with the standard sampler. The completion
//! worker may already have decoded that token into the session; when it has, the token
//! is remembered and skipped when the caller feeds it back in.

use std::path::Path;

use llama_cpp::standard_sampler::StandardSampler;
use llama_cpp::{LlamaModel, LlamaParams, LlamaSession, SessionParams};
use tracing::{debug, warn};

use super::{Backend, Evaluation};
use crate::llm::error::{ConfigError, EvalError, LoadError, TokenizeError};
use crate::llm::model::{check_gguf_magic, ModelParams};
use crate::llm::session::ContextParams;
use crate::llm::tokenizer::{Sequence, Token};

fn to_native(token: Token) -> llama_cpp::Token {
    llama_cpp::Token(token.0 as i32)
}

fn from_native(token: llama_cpp::Token) -> Token {
    Token(token.0 as u32)
}

pub struct LlamaContext {
    session: LlamaSession,
    /// Sampled token the completion worker already decoded into the session
    ahead: Option<Token>,
}

#[derive(Debug, Clone, Default)]
pub struct LlamaCppBackend;

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for LlamaCppBackend {
    type Model = LlamaModel;
    type Context = LlamaContext;

    fn system_info(&self) -> String {
        format!(
            "llama.cpp (llama_cpp bindings) | THREADS = {}",
            std::thread::available_parallelism().map_or(1, |n| n.get())
        )
    }

    fn load(&self, path: &Path, params: &ModelParams) -> Result<LlamaModel, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }
        check_gguf_magic(path)?;
        let llama_params = LlamaParams {
            n_gpu_layers: params.gpu_layers,
            vocab_only: params.vocab_only,
            use_mmap: params.use_mmap,
            use_mlock: params.use_mlock,
            ..Default::default()
        };
        LlamaModel::load_from_file(path, llama_params).map_err(|e| LoadError::Backend(e.to_string()))
    }

    fn describe(&self, model: &LlamaModel) -> String {
        format!(
            "llama.cpp model, {} layers, {}-token vocabulary, trained on {} tokens",
            model.layers(),
            model.vocabulary_size(),
            model.train_len()
        )
    }

    fn new_context(&self, model: &LlamaModel, params: &ContextParams) -> Result<LlamaContext, ConfigError> {
        if params.returns_logits() {
            return Err(ConfigError::Incompatible(
                "llama_cpp sessions do not expose logits or embeddings".to_string(),
            ));
        }
        if !params.mul_mat_q {
            return Err(ConfigError::Incompatible(
                "llama_cpp sessions always use the mul_mat_q kernels".to_string(),
            ));
        }
        let session_params = SessionParams {
            seed: params.seed,
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            n_threads: params.n_threads,
            n_threads_batch: params.n_threads_batch,
            rope_scaling_type: params.rope_scaling_type.llama_value(),
            rope_freq_base: params.rope_freq_base,
            rope_freq_scale: params.rope_freq_scale,
            yarn_ext_factor: params.yarn_ext_factor,
            yarn_attn_factor: params.yarn_attn_factor,
            yarn_beta_fast: params.yarn_beta_fast,
            yarn_beta_slow: params.yarn_beta_slow,
            yarn_orig_ctx: params.yarn_orig_ctx,
            type_k: params.cache_type_k.ggml_type(),
            type_v: params.cache_type_v.ggml_type(),
            offload_kqv: params.offload_kqv,
            ..Default::default()
        };
        let session = model
            .create_session(session_params)
            .map_err(|e| ConfigError::Backend(e.to_string()))?;
        Ok(LlamaContext { session, ahead: None })
    }

    fn tokenize(&self, model: &LlamaModel, text: &str, add_bos: bool) -> Result<Sequence, TokenizeError> {
        let tokens = model
            .tokenize_bytes(text.as_bytes(), add_bos, false)
            .map_err(|e| TokenizeError::Backend(e.to_string()))?;
        Ok(tokens.into_iter().map(from_native).collect())
    }

    fn detokenize(&self, model: &LlamaModel, tokens: &[Token]) -> String {
        tokens
            .iter()
            .map(|&t| model.token_to_piece(to_native(t)))
            .collect()
    }

    fn token_bos(&self, model: &LlamaModel) -> Token {
        from_native(model.bos())
    }

    fn token_eos(&self, model: &LlamaModel) -> Token {
        from_native(model.eos())
    }

    fn vocab_size(&self, model: &LlamaModel) -> usize {
        model.vocabulary_size()
    }

    fn forward(&self, context: &mut LlamaContext, tokens: &[Token]) -> Result<Evaluation, EvalError> {
        let mut feed = tokens;
        if let Some(ahead) = context.ahead.take() {
            if tokens.first() == Some(&ahead) {
                feed = &tokens[1..];
            } else {
                let size = context.session.context_size();
                context.session.truncate_context(size.saturating_sub(1));
            }
        }

        if !feed.is_empty() {
            let native: Vec<llama_cpp::Token> = feed.iter().copied().map(to_native).collect();
            context
                .session
                .advance_context_with_tokens(native)
                .map_err(|e| EvalError::Backend(e.to_string()))?;
        }

        let base = context.session.context_size();
        let handle = context
            .session
            .start_completing_with(StandardSampler::default(), 1)
            .map_err(|e| EvalError::Backend(e.to_string()))?;
        let sampled: Vec<llama_cpp::Token> = handle.into_iter().collect();
        let token = match sampled.first() {
            Some(&token) => from_native(token),
            None => {
                warn!("Completion handle produced no token");
                return Err(EvalError::Backend("no token sampled".to_string()));
            }
        };

        if context.session.context_size() > base {
            context.ahead = Some(token);
        }
        debug!(batch = tokens.len(), cached = base, %token, "llama forward");
        Ok(Evaluation::Token(token))
    }

    fn truncate(&self, context: &mut LlamaContext, len: usize) -> Result<(), EvalError> {
        context.ahead = None;
        context.session.truncate_context(len);
        Ok(())
    }
}
