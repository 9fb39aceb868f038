use serde::Deserialize;

use crate::llm::error::ConfigError;

/// Positional-encoding extrapolation scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RopeScaling {
    /// Use whatever the model file specifies
    #[default]
    Unspecified,
    None,
    Linear,
    Yarn,
}

impl RopeScaling {
    /// Value of llama.cpp's `llama_rope_scaling_type`.
    pub fn llama_value(self) -> i32 {
        match self {
            RopeScaling::Unspecified => -1,
            RopeScaling::None => 0,
            RopeScaling::Linear => 1,
            RopeScaling::Yarn => 2,
        }
    }
}

/// Storage precision for the KV-cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    F32,
    #[default]
    F16,
    Q8_0,
    Q5_1,
    Q5_0,
    Q4_1,
    Q4_0,
}

impl CacheType {
    pub fn is_quantized(self) -> bool {
        !matches!(self, CacheType::F32 | CacheType::F16)
    }

    /// `ggml_type` id of this storage precision.
    pub fn ggml_type(self) -> u32 {
        match self {
            CacheType::F32 => 0,
            CacheType::F16 => 1,
            CacheType::Q4_0 => 2,
            CacheType::Q4_1 => 3,
            CacheType::Q5_0 => 6,
            CacheType::Q5_1 => 7,
            CacheType::Q8_0 => 8,
        }
    }
}

/// Parameters for one inference context.
///
/// Defaults follow llama.cpp's `llama_context_default_params`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// RNG seed, `u32::MAX` for a random one
    pub seed: u32,
    /// Maximum number of tokens held in the KV-cache
    pub n_ctx: u32,
    /// Maximum tokens submitted to the backend per forward call
    pub n_batch: u32,
    /// Threads used for single-token decoding
    pub n_threads: u32,
    /// Threads used for batch (prefill) processing
    pub n_threads_batch: u32,
    pub rope_scaling_type: RopeScaling,
    /// RoPE base frequency, 0 = from model
    pub rope_freq_base: f32,
    /// RoPE frequency scaling factor, 0 = from model
    pub rope_freq_scale: f32,
    /// YaRN extrapolation mix factor, negative = from model
    pub yarn_ext_factor: f32,
    pub yarn_attn_factor: f32,
    pub yarn_beta_fast: f32,
    pub yarn_beta_slow: f32,
    /// YaRN original context size, 0 = from model
    pub yarn_orig_ctx: u32,
    pub cache_type_k: CacheType,
    pub cache_type_v: CacheType,
    pub mul_mat_q: bool,
    /// Return the full logit vector instead of a sampled token
    pub logits_all: bool,
    /// Embedding mode, also returns a vector instead of a sampled token
    pub embedding: bool,
    /// Keep the KQV ops and KV-cache on the accelerator
    pub offload_kqv: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            seed: u32::MAX,
            n_ctx: 512,
            n_batch: 512,
            n_threads: 4,
            n_threads_batch: 4,
            rope_scaling_type: RopeScaling::Unspecified,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            yarn_ext_factor: -1.0,
            yarn_attn_factor: 1.0,
            yarn_beta_fast: 32.0,
            yarn_beta_slow: 1.0,
            yarn_orig_ctx: 0,
            cache_type_k: CacheType::F16,
            cache_type_v: CacheType::F16,
            mul_mat_q: true,
            logits_all: false,
            embedding: false,
            offload_kqv: true,
        }
    }
}

impl ContextParams {
    /// Context with `n_ctx` capacity and defaults everywhere else.
    pub fn with_n_ctx(n_ctx: u32) -> Self {
        Self {
            n_ctx,
            ..Default::default()
        }
    }

    /// True when `evaluate` yields a vector rather than a sampled token.
    pub fn returns_logits(&self) -> bool {
        self.logits_all || self.embedding
    }

    /// Tokens per backend call, never larger than the context itself.
    pub fn effective_batch(&self) -> usize {
        self.n_batch.min(self.n_ctx) as usize
    }

    /// Checks the model-independent constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("n_ctx", self.n_ctx),
            ("n_batch", self.n_batch),
            ("n_threads", self.n_threads),
            ("n_threads_batch", self.n_threads_batch),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::NonPositive { field });
            }
        }

        let finite = [
            ("rope_freq_base", self.rope_freq_base),
            ("rope_freq_scale", self.rope_freq_scale),
            ("yarn_ext_factor", self.yarn_ext_factor),
            ("yarn_attn_factor", self.yarn_attn_factor),
            ("yarn_beta_fast", self.yarn_beta_fast),
            ("yarn_beta_slow", self.yarn_beta_slow),
        ];
        for (field, value) in finite {
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { field });
            }
        }

        if self.rope_freq_base < 0.0 {
            return Err(ConfigError::Negative { field: "rope_freq_base" });
        }
        if self.rope_freq_scale < 0.0 {
            return Err(ConfigError::Negative { field: "rope_freq_scale" });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let params = ContextParams::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.n_ctx, 512);
        assert_eq!(params.seed, u32::MAX);
        assert!(!params.returns_logits());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for field in ["n_ctx", "n_batch", "n_threads", "n_threads_batch"] {
            let mut params = ContextParams::default();
            match field {
                "n_ctx" => params.n_ctx = 0,
                "n_batch" => params.n_batch = 0,
                "n_threads" => params.n_threads = 0,
                _ => params.n_threads_batch = 0,
            }
            assert_eq!(params.validate(), Err(ConfigError::NonPositive { field }));
        }
    }

    #[test]
    fn non_finite_rope_is_rejected() {
        let params = ContextParams {
            rope_freq_scale: f32::NAN,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(ConfigError::NotFinite { field: "rope_freq_scale" })
        );

        let params = ContextParams {
            rope_freq_base: -10_000.0,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(ConfigError::Negative { field: "rope_freq_base" })
        );
    }

    #[test]
    fn batch_is_clamped_to_context() {
        let params = ContextParams {
            n_ctx: 64,
            n_batch: 512,
            ..Default::default()
        };
        assert_eq!(params.effective_batch(), 64);
    }

    #[test]
    fn native_ids_match_llama_cpp() {
        assert_eq!(RopeScaling::default().llama_value(), -1);
        assert_eq!(RopeScaling::Yarn.llama_value(), 2);
        assert_eq!(CacheType::default().ggml_type(), 1);
        assert_eq!(CacheType::Q8_0.ggml_type(), 8);
        assert_eq!(CacheType::Q5_0.ggml_type(), 6);
        assert!(CacheType::Q4_0.is_quantized());
        assert!(!CacheType::F32.is_quantized());
    }
}
