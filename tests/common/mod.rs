#![allow(dead_code)]

use std::sync::Arc;

use llm_session::{ContextParams, ModelHandle, ModelParams, Runtime, SimBackend, SimModelSpec, SimStats};

pub const MODEL: &str = "models/tiny-sim.gguf";

pub struct Fixture {
    pub runtime: Runtime<SimBackend>,
    pub model: ModelHandle<SimBackend>,
    pub stats: Arc<SimStats>,
}

pub fn backend(spec: SimModelSpec) -> SimBackend {
    SimBackend::new().with_model(MODEL, spec).with_gpu_layer_budget(32)
}

pub fn fixture_with(backend: SimBackend) -> Fixture {
    let stats = backend.stats();
    let runtime = Runtime::new(backend);
    let model = runtime
        .load_model(MODEL, ModelParams::default())
        .expect("sim model should load");
    Fixture { runtime, model, stats }
}

pub fn fixture(spec: SimModelSpec) -> Fixture {
    fixture_with(backend(spec))
}

pub fn params(n_ctx: u32) -> ContextParams {
    ContextParams {
        seed: 42,
        ..ContextParams::with_n_ctx(n_ctx)
    }
}
