use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use super::types::{Sequence, Token};
use crate::llm::backend::Backend;
use crate::llm::error::TokenizeError;
use crate::llm::model::ModelShared;

/// Text <-> token conversion bound to one model's vocabulary.
///
/// Cheap to clone; every clone keeps the model's weights alive.
pub struct Tokenizer<B: Backend> {
    model: Arc<ModelShared<B>>,
}

impl<B: Backend> Clone for Tokenizer<B> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
        }
    }
}

impl<B: Backend> Tokenizer<B> {
    pub(crate) fn new(model: Arc<ModelShared<B>>) -> Self {
        Self { model }
    }

    /// Converts text into tokens, optionally prefixed with the vocabulary's BOS token.
    pub fn encode(&self, text: &str, add_bos: bool) -> Result<Sequence, TokenizeError> {
        if let Some(position) = text.bytes().position(|b| b == 0) {
            return Err(TokenizeError::InteriorNul { position });
        }

        let mut tokens = self
            .model
            .backend()
            .tokenize(self.model.native(), text, add_bos)?;

        // Some vocabularies ignore the add_bos hint; the prefix is part of our contract.
        let bos = self.token_bos();
        if add_bos && tokens.first() != Some(&bos) {
            tokens.insert(0, bos);
        }

        debug!(chars = text.len(), tokens = tokens.len(), add_bos, "encoded text");
        Ok(tokens)
    }

    /// Like [`encode`](Self::encode) for raw bytes, rejecting malformed UTF-8.
    pub fn encode_bytes(&self, bytes: &[u8], add_bos: bool) -> Result<Sequence, TokenizeError> {
        let text = std::str::from_utf8(bytes).map_err(|e| TokenizeError::InvalidUtf8(e.to_string()))?;
        self.encode(text, add_bos)
    }

    /// Converts tokens back into text.
    pub fn decode(&self, tokens: &[Token]) -> String {
        self.model.backend().detokenize(self.model.native(), tokens)
    }

    /// Encodes each text independently. Order is preserved; the first failure is returned.
    pub fn batch_encode<S>(&self, texts: &[S], add_bos: bool) -> Result<Vec<Sequence>, TokenizeError>
    where
        S: AsRef<str> + Sync,
    {
        texts
            .par_iter()
            .map(|text| self.encode(text.as_ref(), add_bos))
            .collect()
    }

    pub fn batch_decode<T>(&self, sequences: &[T]) -> Vec<String>
    where
        T: AsRef<[Token]> + Sync,
    {
        sequences
            .par_iter()
            .map(|tokens| self.decode(tokens.as_ref()))
            .collect()
    }

    pub fn token_bos(&self) -> Token {
        self.model.backend().token_bos(self.model.native())
    }

    pub fn token_eos(&self) -> Token {
        self.model.backend().token_eos(self.model.native())
    }

    pub fn vocab_size(&self) -> usize {
        self.model.backend().vocab_size(self.model.native())
    }
}
