//! # llm-session
//!
//! Model and context lifecycle plus step-wise autoregressive generation over a pluggable
//! compute [`Backend`].
//!
//! ## Key Components
//!
//! - [`Runtime`]: process-wide backend lifecycle, initialized while any model is live
//! - [`ModelHandle`]: loaded, read-only weights shared by every context built on them
//! - [`Tokenizer`]: text <-> token conversion bound to a model's vocabulary
//! - [`InferenceContext`]: per-session KV-cache and the single-step `evaluate` transition
//! - [`GenerationStream`] / [`TokenStream`]: cancellable, pull-based token generation
//!
//! ```no_run
//! use llm_session::{ContextParams, GenerationOptions, ModelParams, Runtime, SimBackend, SimModelSpec};
//!
//! let runtime = Runtime::new(SimBackend::new().with_model("tiny.gguf", SimModelSpec::default()));
//! let model = runtime.load_model("tiny.gguf", ModelParams::default())?;
//! let context = model.create_context(ContextParams::with_n_ctx(256))?;
//!
//! let stream = context.generate("Once upon a time", GenerationOptions::default().with_max_tokens(5))?;
//! let completion = stream.complete()?;
//! println!("{:?} {:?}", completion.tokens, completion.reason);
//! # Ok::<(), llm_session::Error>(())
//! ```

pub mod config;
pub mod llm;
pub mod logging;

pub use llm::backend::{SimBackend, SimModelSpec, SimStats};
#[cfg(feature = "llama")]
pub use llm::backend::LlamaCppBackend;
pub use llm::*;
