mod tokenizer;
pub mod types;

pub use tokenizer::Tokenizer;
pub use types::{Sequence, Token};
