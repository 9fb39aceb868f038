pub mod backend;
pub mod error;
pub mod model;
pub mod session;
pub mod tokenizer;

pub use backend::{Backend, Evaluation, Runtime};
pub use error::{
    CancelCause, CancelledError, ConfigError, ContextOverflow, Error, EvalError, EvaluateError, LoadError,
    TokenizeError,
};
pub use model::{ModelHandle, ModelParams};
pub use session::{
    CancelToken, Completion, ContextParams, GenerationOptions, GenerationPhase, GenerationStream, InferenceContext,
    Prompt, StopReason, StreamEvent, TokenStream,
};
pub use tokenizer::{Sequence, Token, Tokenizer};
