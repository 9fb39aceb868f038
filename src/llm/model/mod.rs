mod format;
mod model;
pub mod params;

pub use format::{check_gguf_magic, GGUF_MAGIC};
pub use model::ModelHandle;
pub(crate) use model::ModelShared;
pub use params::ModelParams;
