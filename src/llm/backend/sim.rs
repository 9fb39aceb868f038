//! Deterministic in-process backend.
//!
//! Uses a byte-level vocabulary and picks each next token as a pure function of the seed
//! and the whole cached history, so results are reproducible and depend on every token
//! the context has seen. Models are registered in memory by path; no files are read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{Backend, Evaluation};
use crate::llm::error::{ConfigError, EvalError, LoadError, TokenizeError};
use crate::llm::model::ModelParams;
use crate::llm::session::{ContextParams, RopeScaling};
use crate::llm::tokenizer::{Sequence, Token};

pub const UNK: Token = Token(0);
pub const BOS: Token = Token(1);
pub const EOS: Token = Token(2);
/// Token id of byte 0x00; byte `b` is `Token(b + BYTE_OFFSET)`.
pub const BYTE_OFFSET: u32 = 3;
pub const VOCAB_SIZE: usize = 256 + BYTE_OFFSET as usize;

/// Behaviour of one registered model.
#[derive(Debug, Clone)]
pub struct SimModelSpec {
    pub architecture: String,
    pub n_layers: u32,
    /// Context length the model was "trained" on
    pub train_ctx: u32,
    /// Produce EOS once the cached history reaches this many tokens
    pub eos_at: Option<usize>,
    /// Fail any forward pass that would grow the history to this many tokens
    pub fail_at: Option<usize>,
    /// Report the file as corrupt on load
    pub corrupt: bool,
    /// Report the file as an unknown format on load
    pub unsupported: bool,
    /// Fail every cache truncation
    pub fail_truncate: bool,
}

impl Default for SimModelSpec {
    fn default() -> Self {
        Self {
            architecture: "llama".to_string(),
            n_layers: 4,
            train_ctx: 4096,
            eos_at: None,
            fail_at: None,
            corrupt: false,
            unsupported: false,
            fail_truncate: false,
        }
    }
}

/// Call counters shared by a backend and every model/context it creates.
#[derive(Debug, Default)]
pub struct SimStats {
    init_calls: AtomicUsize,
    teardown_calls: AtomicUsize,
    loads: AtomicUsize,
    models_freed: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_freed: AtomicUsize,
    forward_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimStats {
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn teardown_calls(&self) -> usize {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn models_freed(&self) -> usize {
        self.models_freed.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn contexts_freed(&self) -> usize {
        self.contexts_freed.load(Ordering::SeqCst)
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    /// Highest number of forward passes ever observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a SimStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a SimStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SimModel {
    spec: SimModelSpec,
    params: ModelParams,
}

pub struct SimContext {
    spec: SimModelSpec,
    seed: u64,
    history: Vec<Token>,
    returns_logits: bool,
    stats: Arc<SimStats>,
}

impl SimContext {
    /// Tokens currently held in the simulated KV-cache.
    pub fn history(&self) -> &[Token] {
        &self.history
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimBackend {
    models: HashMap<PathBuf, SimModelSpec>,
    gpu_layer_budget: u32,
    forward_delay: Option<Duration>,
    stats: Arc<SimStats>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model that `load` will accept at `path`.
    pub fn with_model(mut self, path: impl Into<PathBuf>, spec: SimModelSpec) -> Self {
        self.models.insert(path.into(), spec);
        self
    }

    /// Layers that may be offloaded before loads fail with `OutOfMemory`.
    pub fn with_gpu_layer_budget(mut self, layers: u32) -> Self {
        self.gpu_layer_budget = layers;
        self
    }

    /// Sleeps inside every forward pass.
    pub fn with_forward_delay(mut self, delay: Duration) -> Self {
        self.forward_delay = Some(delay);
        self
    }

    pub fn stats(&self) -> Arc<SimStats> {
        Arc::clone(&self.stats)
    }

    fn next_token(seed: u64, history: &[Token]) -> Token {
        // FNV-1a over the seed and every cached token.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for word in std::iter::once(seed).chain(history.iter().map(|t| u64::from(t.0))) {
            for byte in word.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
        }
        let mut rng = StdRng::seed_from_u64(hash);
        // Printable ASCII keeps decoded samples readable.
        let byte: u8 = rng.random_range(b' '..=b'~');
        Token(u32::from(byte) + BYTE_OFFSET)
    }
}

impl Backend for SimBackend {
    type Model = SimModel;
    type Context = SimContext;

    fn init(&self) {
        self.stats.init_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn teardown(&self) {
        self.stats.teardown_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn system_info(&self) -> String {
        format!(
            "SIM = 1 | BYTE_VOCAB = {} | GPU_LAYER_BUDGET = {} | FORWARD_DELAY_MS = {}",
            VOCAB_SIZE,
            self.gpu_layer_budget,
            self.forward_delay.map_or(0, |d| d.as_millis())
        )
    }

    fn load(&self, path: &Path, params: &ModelParams) -> Result<SimModel, LoadError> {
        let spec = self
            .models
            .get(path)
            .ok_or_else(|| LoadError::NotFound(path.to_path_buf()))?;
        if spec.unsupported {
            return Err(LoadError::Unsupported(format!("{} is not a GGUF file", path.display())));
        }
        if spec.corrupt {
            return Err(LoadError::Corrupt {
                path: path.to_path_buf(),
                reason: "tensor data truncated".to_string(),
            });
        }
        if params.gpu_layers > self.gpu_layer_budget {
            return Err(LoadError::OutOfMemory(format!(
                "{} layers requested for offload, {} fit",
                params.gpu_layers, self.gpu_layer_budget
            )));
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(SimModel {
            spec: spec.clone(),
            params: params.clone(),
        })
    }

    fn describe(&self, model: &SimModel) -> String {
        format!(
            "{} {}-layer sim model, {}-token byte vocabulary, F32 (gpu_layers = {}, mmap = {})",
            model.spec.architecture, model.spec.n_layers, VOCAB_SIZE, model.params.gpu_layers, model.params.use_mmap
        )
    }

    fn new_context(&self, model: &SimModel, params: &ContextParams) -> Result<SimContext, ConfigError> {
        if params.n_ctx > model.spec.train_ctx && params.rope_scaling_type == RopeScaling::None {
            return Err(ConfigError::Incompatible(format!(
                "n_ctx {} exceeds training context {} with rope scaling disabled",
                params.n_ctx, model.spec.train_ctx
            )));
        }
        if params.cache_type_v.is_quantized() && !params.offload_kqv {
            return Err(ConfigError::Incompatible(format!(
                "{:?} V-cache requires offload_kqv",
                params.cache_type_v
            )));
        }
        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(SimContext {
            spec: model.spec.clone(),
            seed: u64::from(params.seed),
            history: Vec::with_capacity(params.n_ctx as usize),
            returns_logits: params.returns_logits(),
            stats: Arc::clone(&self.stats),
        })
    }

    fn tokenize(&self, _model: &SimModel, text: &str, add_bos: bool) -> Result<Sequence, TokenizeError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(|b| Token(u32::from(b) + BYTE_OFFSET)));
        Ok(tokens)
    }

    fn detokenize(&self, _model: &SimModel, tokens: &[Token]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|t| t.0 >= BYTE_OFFSET && (t.0 as usize) < VOCAB_SIZE)
            .map(|t| (t.0 - BYTE_OFFSET) as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn token_bos(&self, _model: &SimModel) -> Token {
        BOS
    }

    fn token_eos(&self, _model: &SimModel) -> Token {
        EOS
    }

    fn vocab_size(&self, _model: &SimModel) -> usize {
        VOCAB_SIZE
    }

    fn forward(&self, context: &mut SimContext, tokens: &[Token]) -> Result<Evaluation, EvalError> {
        let stats = Arc::clone(&context.stats);
        stats.forward_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&stats);

        if let Some(delay) = self.forward_delay {
            thread::sleep(delay);
        }

        let new_len = context.history.len() + tokens.len();
        if context.spec.fail_at.is_some_and(|at| new_len >= at) {
            return Err(EvalError::Backend(format!("simulated failure growing cache to {}", new_len)));
        }

        context.history.extend_from_slice(tokens);
        let next = if context.spec.eos_at.is_some_and(|at| new_len >= at) {
            EOS
        } else {
            Self::next_token(context.seed, &context.history)
        };
        debug!(batch = tokens.len(), cached = new_len, next = %next, "sim forward");

        if context.returns_logits {
            let mut logits = vec![0.0f32; VOCAB_SIZE];
            logits[next.0 as usize] = 1.0;
            Ok(Evaluation::Logits(logits))
        } else {
            Ok(Evaluation::Token(next))
        }
    }

    fn truncate(&self, context: &mut SimContext, len: usize) -> Result<(), EvalError> {
        if context.spec.fail_truncate {
            return Err(EvalError::Backend(format!("simulated failure truncating cache to {}", len)));
        }
        context.history.truncate(len);
        Ok(())
    }

    fn free_context(&self, context: SimContext) {
        self.stats.contexts_freed.fetch_add(1, Ordering::SeqCst);
        drop(context);
    }

    fn free_model(&self, model: SimModel) {
        self.stats.models_freed.fetch_add(1, Ordering::SeqCst);
        drop(model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_token_depends_on_whole_history() {
        let history = [Token(10), Token(20), Token(30)];
        let a = SimBackend::next_token(7, &history);
        assert_eq!(a, SimBackend::next_token(7, &history));
        assert!((u32::from(b' ') + BYTE_OFFSET..=u32::from(b'~') + BYTE_OFFSET).contains(&a.0));

        let differs = (0..32u32).any(|first| SimBackend::next_token(7, &[Token(first), Token(20), Token(30)]) != a);
        assert!(differs);
    }

    #[test]
    fn forward_failure_leaves_history_alone() {
        let backend = SimBackend::new().with_model(
            "m",
            SimModelSpec {
                fail_at: Some(3),
                ..SimModelSpec::default()
            },
        );
        let model = backend.load(Path::new("m"), &ModelParams::default()).unwrap();
        let mut context = backend.new_context(&model, &ContextParams::default()).unwrap();

        backend.forward(&mut context, &[Token(40), Token(41)]).unwrap();
        assert!(backend.forward(&mut context, &[Token(42)]).is_err());
        assert_eq!(context.history(), &[Token(40), Token(41)]);
        assert_eq!(backend.stats().forward_calls(), 2);
    }
}
