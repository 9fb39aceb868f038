use std::path::PathBuf;
use thiserror::Error;

use crate::llm::tokenizer::Token;

/// Failure to bring model weights into memory.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("model file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("unsupported model format: {0}")]
    Unsupported(String),
    #[error("corrupt model file {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("insufficient memory for requested configuration: {0}")]
    OutOfMemory(String),
    #[error("invalid model parameters: {0}")]
    InvalidParams(String),
    #[error("backend failed to load model: {0}")]
    Backend(String),
}

/// Invalid or incompatible context/model parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than 0")]
    NonPositive { field: &'static str },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("{field} must not be negative")]
    Negative { field: &'static str },
    #[error("model was loaded with vocab_only and cannot host an inference context")]
    VocabOnly,
    #[error("model handle has been released")]
    ModelReleased,
    #[error("configuration incompatible with model: {0}")]
    Incompatible(String),
    #[error("backend rejected context configuration: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenizeError {
    #[error("text contains an interior NUL byte at offset {position}")]
    InteriorNul { position: usize },
    #[error("text is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    #[error("backend tokenizer failed: {0}")]
    Backend(String),
}

/// An evaluation that would push the KV-cache past its capacity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("context overflow: {occupied} cached + {requested} new tokens exceeds capacity of {capacity}")]
pub struct ContextOverflow {
    pub occupied: usize,
    pub requested: usize,
    pub capacity: usize,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("cannot evaluate an empty token batch")]
    EmptyBatch,
    #[error("token {token} is outside the vocabulary of {vocab_size} entries")]
    InvalidToken { token: Token, vocab_size: usize },
    #[error("another evaluation is in flight on this context")]
    Busy,
    #[error("context state was poisoned by a panicked evaluation")]
    Poisoned,
    #[error("backend forward pass failed: {0}")]
    Backend(String),
}

/// Everything `InferenceContext::evaluate` can fail with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluateError {
    #[error(transparent)]
    Overflow(#[from] ContextOverflow),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

impl EvaluateError {
    pub fn is_overflow(&self) -> bool {
        matches!(self, EvaluateError::Overflow(_))
    }
}

/// Why a stream was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The caller signalled its `CancelToken`.
    Caller,
    /// The per-generation wall-clock timeout elapsed.
    Timeout,
}

/// A stream that stopped because the caller (or its deadline) asked it to.
///
/// This is a normal terminal state, not a failure of the computation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("generation cancelled ({cause:?}) after {emitted} tokens")]
pub struct CancelledError {
    pub cause: CancelCause,
    pub emitted: usize,
}

/// Crate-level error wrapping the whole taxonomy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tokenize(#[from] TokenizeError),
    #[error(transparent)]
    Overflow(#[from] ContextOverflow),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
}

impl From<EvaluateError> for Error {
    fn from(err: EvaluateError) -> Self {
        match err {
            EvaluateError::Overflow(e) => Error::Overflow(e),
            EvaluateError::Eval(e) => Error::Eval(e),
        }
    }
}

impl Error {
    /// True for cancellation, which callers usually treat as success.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
