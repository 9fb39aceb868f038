mod common;

use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use common::{backend, fixture, fixture_with, params};
use llm_session::{EvalError, EvaluateError, GenerationOptions, SimModelSpec, Token};

#[test]
fn test_evaluations_on_one_context_are_serialized() {
    let fx = fixture_with(backend(SimModelSpec::default()).with_forward_delay(Duration::from_millis(10)));
    let context = fx.model.create_context(params(64)).unwrap();
    let barrier = Barrier::new(4);

    thread::scope(|s| {
        for worker in 0..4u32 {
            let context = &context;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for _ in 0..3 {
                    context.evaluate(&[Token(40 + worker)]).unwrap();
                }
            });
        }
    });

    assert_eq!(fx.stats.peak_in_flight(), 1);
    assert_eq!(fx.stats.forward_calls(), 12);
    assert_eq!(context.occupied(), 12);
}

#[test]
fn test_try_evaluate_reports_busy() {
    let fx = fixture_with(backend(SimModelSpec::default()).with_forward_delay(Duration::from_millis(300)));
    let context = fx.model.create_context(params(64)).unwrap();

    thread::scope(|s| {
        let slow = s.spawn(|| context.evaluate(&[Token(70)]));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(
            context.try_evaluate(&[Token(71)]),
            Err(EvaluateError::Eval(EvalError::Busy))
        );
        assert!(slow.join().unwrap().is_ok());
    });

    assert_eq!(context.occupied(), 1);
    assert!(context.try_evaluate(&[Token(71)]).is_ok());
    assert_eq!(context.occupied(), 2);
}

#[test]
fn test_contexts_run_independently() {
    let fx = fixture(SimModelSpec::default());
    let options = GenerationOptions::default().with_max_tokens(12);

    let expected: Vec<Vec<Token>> = ["first prompt", "second prompt"]
        .iter()
        .map(|prompt| {
            let context = fx.model.create_context(params(128)).unwrap();
            let tokens: Vec<Token> = context.generate(*prompt, options.clone()).unwrap().collect();
            tokens
        })
        .collect();

    let a = fx.model.create_context(params(128)).unwrap();
    let b = fx.model.create_context(params(128)).unwrap();
    let (got_a, got_b) = thread::scope(|s| {
        let ta = s.spawn(|| a.generate("first prompt", options.clone()).unwrap().collect::<Vec<Token>>());
        let tb = s.spawn(|| b.generate("second prompt", options.clone()).unwrap().collect::<Vec<Token>>());
        (ta.join().unwrap(), tb.join().unwrap())
    });

    assert_eq!(got_a, expected[0]);
    assert_eq!(got_b, expected[1]);
}

#[test]
fn test_parallel_contexts_overlap() {
    let fx = fixture_with(backend(SimModelSpec::default()).with_forward_delay(Duration::from_millis(100)));
    let a = fx.model.create_context(params(16)).unwrap();
    let b = fx.model.create_context(params(16)).unwrap();
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        for context in [&a, &b] {
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                context.evaluate(&[Token(50)]).unwrap();
            });
        }
    });

    assert_eq!(a.occupied(), 1);
    assert_eq!(b.occupied(), 1);
    assert_eq!(fx.stats.peak_in_flight(), 2);
}
