mod common;

use std::path::PathBuf;

use common::{backend, fixture, params, MODEL};
use llm_session::{ConfigError, LoadError, ModelHandle, ModelParams, Runtime, SimModelSpec};

#[test]
fn test_load_reports_missing_file() {
    let backend = backend(SimModelSpec::default());
    let stats = backend.stats();
    let runtime = Runtime::new(backend);

    let err = runtime.load_model("models/absent.gguf", ModelParams::default()).unwrap_err();
    assert_eq!(err, LoadError::NotFound(PathBuf::from("models/absent.gguf")));

    // The failed load briefly started the backend and shut it down again.
    assert_eq!(stats.init_calls(), 1);
    assert_eq!(stats.teardown_calls(), 1);
    assert!(!runtime.is_initialized());
}

#[test]
fn test_load_reports_corrupt_file() {
    let runtime = Runtime::new(backend(SimModelSpec {
        corrupt: true,
        ..SimModelSpec::default()
    }));
    assert!(matches!(
        runtime.load_model(MODEL, ModelParams::default()),
        Err(LoadError::Corrupt { .. })
    ));
}

#[test]
fn test_load_reports_unsupported_format() {
    let backend = backend(SimModelSpec {
        unsupported: true,
        ..SimModelSpec::default()
    });
    let stats = backend.stats();
    let runtime = Runtime::new(backend);

    assert!(matches!(
        runtime.load_model(MODEL, ModelParams::default()),
        Err(LoadError::Unsupported(_))
    ));
    assert_eq!(stats.loads(), 0);
    assert!(!runtime.is_initialized());
}

#[test]
fn test_load_reports_out_of_memory() {
    let runtime = Runtime::new(backend(SimModelSpec::default()));
    let params = ModelParams {
        gpu_layers: 64,
        ..ModelParams::default()
    };
    assert!(matches!(runtime.load_model(MODEL, params), Err(LoadError::OutOfMemory(_))));
}

#[test]
fn test_contradictory_params_fail_before_backend() {
    let backend = backend(SimModelSpec::default());
    let stats = backend.stats();
    let runtime = Runtime::new(backend);
    let params = ModelParams {
        vocab_only: true,
        gpu_layers: 4,
        ..ModelParams::default()
    };

    assert!(matches!(runtime.load_model(MODEL, params), Err(LoadError::InvalidParams(_))));
    assert_eq!(stats.init_calls(), 0);
}

#[test]
fn test_vocab_only_model_cannot_host_context() {
    let runtime = Runtime::new(backend(SimModelSpec::default()));
    let model = ModelHandle::load(
        &runtime,
        MODEL,
        ModelParams {
            vocab_only: true,
            ..ModelParams::default()
        },
    )
    .unwrap();

    assert_eq!(model.create_context(params(64)).unwrap_err(), ConfigError::VocabOnly);
}

#[test]
fn test_release_is_idempotent() {
    let mut fx = fixture(SimModelSpec::default());
    assert!(fx.model.id().is_some());
    assert_eq!(fx.model.path(), Some(std::path::Path::new(MODEL)));

    fx.model.release();
    fx.model.release();

    assert!(fx.model.is_released());
    assert_eq!(fx.model.id(), None);
    assert_eq!(fx.stats.models_freed(), 1);
    assert_eq!(fx.model.describe(), Err(ConfigError::ModelReleased));
    assert_eq!(fx.model.create_context(params(64)).unwrap_err(), ConfigError::ModelReleased);
    assert!(fx.model.tokenizer().is_err());
}

#[test]
fn test_context_keeps_model_alive() {
    let mut fx = fixture(SimModelSpec::default());
    let context = fx.model.create_context(params(64)).unwrap();

    fx.model.release();
    assert_eq!(fx.stats.models_freed(), 0);
    assert!(fx.runtime.is_initialized());

    let tokens = context.tokenizer().encode("alive", true).unwrap();
    context.evaluate(&tokens).unwrap();

    drop(context);
    assert_eq!(fx.stats.contexts_freed(), 1);
    assert_eq!(fx.stats.models_freed(), 1);
    assert_eq!(fx.stats.teardown_calls(), 1);
    assert_eq!(fx.runtime.live_models(), 0);
}

#[test]
fn test_dropping_handle_frees_model() {
    let fx = fixture(SimModelSpec::default());
    let stats = fx.stats.clone();
    let runtime = fx.runtime.clone();

    drop(fx);
    assert_eq!(stats.models_freed(), 1);
    assert_eq!(stats.teardown_calls(), 1);
    assert!(!runtime.is_initialized());
}

#[test]
fn test_runtime_initializes_once_per_active_period() {
    let backend = backend(SimModelSpec::default());
    let stats = backend.stats();
    let runtime = Runtime::new(backend);
    assert!(!runtime.is_initialized());

    let first = runtime.load_model(MODEL, ModelParams::default()).unwrap();
    let second = runtime.load_model(MODEL, ModelParams::default()).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(stats.init_calls(), 1);
    assert_eq!(runtime.live_models(), 2);

    drop(first);
    assert_eq!(stats.teardown_calls(), 0);
    assert!(runtime.is_initialized());

    drop(second);
    assert_eq!(stats.teardown_calls(), 1);
    assert_eq!(runtime.live_models(), 0);

    let _third = runtime.load_model(MODEL, ModelParams::default()).unwrap();
    assert_eq!(stats.init_calls(), 2);
}

#[test]
fn test_many_contexts_share_one_model() {
    let fx = fixture(SimModelSpec::default());
    let contexts: Vec<_> = (0..4).map(|_| fx.model.create_context(params(32)).unwrap()).collect();

    assert_eq!(fx.stats.loads(), 1);
    assert_eq!(fx.stats.contexts_created(), 4);

    drop(contexts);
    assert_eq!(fx.stats.contexts_freed(), 4);
    assert_eq!(fx.stats.models_freed(), 0);
}

#[test]
fn test_system_info_and_description() {
    let fx = fixture(SimModelSpec {
        architecture: "mistral".to_string(),
        n_layers: 8,
        ..SimModelSpec::default()
    });

    assert!(fx.runtime.system_info().contains("SIM = 1"));
    let description = fx.model.describe().unwrap();
    assert!(description.contains("mistral"));
    assert!(description.contains("8-layer"));
}
