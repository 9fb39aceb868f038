pub mod context;
pub mod generation;
pub mod params;
pub mod stream;

pub use context::InferenceContext;
pub use generation::{
    CancelToken, Completion, GenerationOptions, GenerationPhase, GenerationState, GenerationStream, Prompt,
    StopReason,
};
pub use params::{CacheType, ContextParams, RopeScaling};
pub use stream::{StreamEvent, TokenStream};
