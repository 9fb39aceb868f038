pub mod backend;
pub mod runtime;
pub mod sim;
#[cfg(feature = "llama")]
pub mod llama;

pub use backend::{Backend, Evaluation};
pub use runtime::Runtime;
pub(crate) use runtime::RuntimeLease;
pub use sim::{SimBackend, SimModelSpec, SimStats};
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
