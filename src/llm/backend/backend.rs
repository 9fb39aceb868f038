use std::path::Path;

use crate::llm::error::{ConfigError, EvalError, LoadError, TokenizeError};
use crate::llm::model::ModelParams;
use crate::llm::session::ContextParams;
use crate::llm::tokenizer::{Sequence, Token};

/// Output of one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The sampled next token (default mode).
    Token(Token),
    /// The full logit vector for the last position, when the context was created with
    /// `logits_all` or `embedding`.
    Logits(Vec<f32>),
}

impl Evaluation {
    pub fn token(&self) -> Option<Token> {
        match self {
            Evaluation::Token(token) => Some(*token),
            Evaluation::Logits(_) => None,
        }
    }

    /// The sampled token, or the greedy argmax of the logit vector.
    pub fn greedy_token(&self) -> Option<Token> {
        match self {
            Evaluation::Token(token) => Some(*token),
            Evaluation::Logits(logits) => logits
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_nan())
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, _)| Token(idx as u32)),
        }
    }
}

/// Compute capability the session layer orchestrates.
///
/// Implementations own weight parsing and the numerical kernels. The session layer only
/// relies on the contract documented on each method.
pub trait Backend: Send + Sync + 'static {
    /// Loaded, read-only weight state.
    type Model: Send + Sync + 'static;
    /// Mutable per-session state, including the KV-cache.
    type Context: Send + 'static;

    /// One-time process-wide startup. Called when the first model is loaded.
    fn init(&self) {}

    /// Process-wide shutdown. Called when the last model is freed.
    fn teardown(&self) {}

    /// Static capability/build description.
    fn system_info(&self) -> String;

    fn load(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, LoadError>;

    /// Human-readable summary of a loaded model.
    fn describe(&self, model: &Self::Model) -> String;

    fn new_context(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context, ConfigError>;

    fn tokenize(&self, model: &Self::Model, text: &str, add_bos: bool) -> Result<Sequence, TokenizeError>;

    fn detokenize(&self, model: &Self::Model, tokens: &[Token]) -> String;

    fn token_bos(&self, model: &Self::Model) -> Token;

    fn token_eos(&self, model: &Self::Model) -> Token;

    fn vocab_size(&self, model: &Self::Model) -> usize;

    /// Appends `tokens` to the context's cache and runs one forward pass over them.
    ///
    /// On error nothing may be committed to the cache.
    fn forward(&self, context: &mut Self::Context, tokens: &[Token]) -> Result<Evaluation, EvalError>;

    /// Drops cached state past the first `len` tokens. `len == 0` empties the cache.
    fn truncate(&self, context: &mut Self::Context, len: usize) -> Result<(), EvalError>;

    fn free_context(&self, context: Self::Context) {
        drop(context);
    }

    fn free_model(&self, model: Self::Model) {
        drop(model);
    }
}
