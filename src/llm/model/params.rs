use serde::Deserialize;

use crate::llm::error::LoadError;

/// Load-time parameters for a model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Number of layers to offload to an accelerator
    pub gpu_layers: u32,
    /// Load only the vocabulary, no weights
    pub vocab_only: bool,
    /// Memory-map the weights file instead of reading it
    pub use_mmap: bool,
    /// Pin mapped pages in memory
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

impl ModelParams {
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.vocab_only && self.gpu_layers > 0 {
            return Err(LoadError::InvalidParams(format!(
                "gpu_layers = {} requested for a vocab_only load",
                self.gpu_layers
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_llama_cpp() {
        let params = ModelParams::default();
        assert_eq!(params.gpu_layers, 0);
        assert!(params.use_mmap);
        assert!(!params.use_mlock);
        assert!(!params.vocab_only);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn vocab_only_rejects_offload() {
        let params = ModelParams {
            vocab_only: true,
            gpu_layers: 8,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(LoadError::InvalidParams(_))));
    }
}
