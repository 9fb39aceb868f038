use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::context::InferenceContext;
use crate::llm::backend::Backend;
use crate::llm::error::{CancelCause, CancelledError, EvalError, EvaluateError, Error, TokenizeError};
use crate::llm::tokenizer::{Sequence, Token};

/// Input to a generation: raw text (tokenized at start) or ready tokens.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    Tokens(Sequence),
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<Sequence> for Prompt {
    fn from(tokens: Sequence) -> Self {
        Prompt::Tokens(tokens)
    }
}

impl From<&[Token]> for Prompt {
    fn from(tokens: &[Token]) -> Self {
        Prompt::Tokens(tokens.to_vec())
    }
}

/// Knobs for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    /// Prefix a text prompt with BOS
    pub add_bos: bool,
    /// Stop after this many emitted tokens
    pub max_tokens: Option<usize>,
    /// Extra tokens that end generation the way EOS does
    pub stop_tokens: HashSet<Token>,
    /// Wall-clock budget measured from start, checked between steps
    pub timeout: Option<Duration>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            add_bos: true,
            max_tokens: None,
            stop_tokens: HashSet::new(),
            timeout: None,
        }
    }
}

impl GenerationOptions {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop_tokens(mut self, tokens: impl IntoIterator<Item = Token>) -> Self {
        self.stop_tokens.extend(tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_add_bos(mut self, add_bos: bool) -> Self {
        self.add_bos = add_bos;
        self
    }
}

/// Cooperative cancellation flag; clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Observed before the next evaluate is issued.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// EOS or a configured stop token was produced
    Eos,
    /// `max_tokens` tokens were emitted
    MaxLength,
    /// Caller cancellation or timeout; see [`GenerationState::cancel_cause`]
    Cancelled,
    /// Evaluation failed; see [`GenerationState::error`]
    Error,
}

/// Externally visible state of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Idle,
    Prefill,
    Decoding,
    Stopped(StopReason),
}

#[derive(Debug)]
enum Phase {
    Idle,
    Prefill(Sequence),
    Decoding(Token),
    Stopped(StopReason),
}

/// Tokens produced by a drained stream plus why it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub tokens: Sequence,
    pub reason: StopReason,
}

/// The generation state machine, independent of how the context is held.
///
/// Each call to [`step`](Self::step) issues at most one evaluate.
#[derive(Debug)]
pub struct GenerationState {
    phase: Phase,
    emitted: usize,
    max_tokens: Option<usize>,
    eos: Token,
    stop_tokens: HashSet<Token>,
    cancel: CancelToken,
    deadline: Option<Instant>,
    cancel_cause: Option<CancelCause>,
    error: Option<EvaluateError>,
}

impl GenerationState {
    /// Builds an idle state. `eos` is the vocabulary's end-of-sequence token.
    pub fn new(eos: Token, options: &GenerationOptions) -> Self {
        Self {
            phase: Phase::Idle,
            emitted: 0,
            max_tokens: options.max_tokens,
            eos,
            stop_tokens: options.stop_tokens.clone(),
            cancel: CancelToken::new(),
            deadline: None,
            cancel_cause: None,
            error: None,
        }
    }

    /// Shares an externally owned cancellation flag instead of a fresh one.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builds the state for `prompt` and moves it to Prefill.
    pub fn prepare<B: Backend>(
        context: &InferenceContext<B>,
        prompt: impl Into<Prompt>,
        options: &GenerationOptions,
    ) -> Result<Self, TokenizeError> {
        let tokenizer = context.tokenizer();
        let tokens = match prompt.into() {
            Prompt::Text(text) => tokenizer.encode(&text, options.add_bos)?,
            Prompt::Tokens(tokens) => tokens,
        };
        let mut state = Self::new(tokenizer.token_eos(), options);
        state.start(tokens, options.timeout);
        Ok(state)
    }

    /// Idle -> Prefill. Has no effect once started.
    pub fn start(&mut self, prompt: Sequence, timeout: Option<Duration>) {
        if !matches!(self.phase, Phase::Idle) {
            return;
        }
        self.deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        debug!(prompt_tokens = prompt.len(), max_tokens = ?self.max_tokens, "Starting generation");
        if self.max_tokens == Some(0) {
            self.finish(StopReason::MaxLength);
        } else {
            self.phase = Phase::Prefill(prompt);
        }
    }

    /// Advances by one token. `None` once the state has stopped.
    pub fn step<B: Backend>(&mut self, context: &InferenceContext<B>) -> Option<Token> {
        if matches!(self.phase, Phase::Stopped(_) | Phase::Idle) {
            return None;
        }

        if let Some(cause) = self.boundary_cancel() {
            self.cancel_cause = Some(cause);
            self.finish(StopReason::Cancelled);
            return None;
        }

        let batch = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Prefill(prompt) => prompt,
            Phase::Decoding(last) => vec![last],
            // Stopped and Idle were handled above.
            other => {
                self.phase = other;
                return None;
            }
        };

        let token = match context.evaluate(&batch) {
            Ok(evaluation) => match evaluation.greedy_token() {
                Some(token) => token,
                None => {
                    self.fail(EvalError::Backend("forward pass returned empty logits".to_string()).into());
                    return None;
                }
            },
            Err(e) => {
                self.fail(e);
                return None;
            }
        };

        if token == self.eos || self.stop_tokens.contains(&token) {
            debug!(%token, "Stop token produced");
            self.finish(StopReason::Eos);
            return None;
        }

        self.emitted += 1;
        if self.max_tokens.is_some_and(|max| self.emitted >= max) {
            self.finish(StopReason::MaxLength);
        } else {
            self.phase = Phase::Decoding(token);
        }
        Some(token)
    }

    fn boundary_cancel(&self) -> Option<CancelCause> {
        if self.cancel.is_cancelled() {
            return Some(CancelCause::Caller);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelCause::Timeout),
            _ => None,
        }
    }

    fn fail(&mut self, error: EvaluateError) {
        warn!(error = %error, emitted = self.emitted, "Generation failed");
        self.error = Some(error);
        self.finish(StopReason::Error);
    }

    fn finish(&mut self, reason: StopReason) {
        info!(?reason, emitted = self.emitted, cause = ?self.cancel_cause, "Generation stopped");
        self.phase = Phase::Stopped(reason);
    }

    pub fn phase(&self) -> GenerationPhase {
        match self.phase {
            Phase::Idle => GenerationPhase::Idle,
            Phase::Prefill(_) => GenerationPhase::Prefill,
            Phase::Decoding(_) => GenerationPhase::Decoding,
            Phase::Stopped(reason) => GenerationPhase::Stopped(reason),
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.phase {
            Phase::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_reason().is_some()
    }

    /// Tokens handed to the consumer so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel_cause(&self) -> Option<CancelCause> {
        self.cancel_cause
    }

    /// The evaluation error behind `StopReason::Error`.
    pub fn error(&self) -> Option<&EvaluateError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<EvaluateError> {
        self.error.take()
    }

    /// Maps the terminal state to a result: Eos/MaxLength succeed, the rest fail.
    pub(crate) fn outcome(&mut self) -> Result<StopReason, Error> {
        match self.stop_reason() {
            Some(StopReason::Cancelled) => Err(CancelledError {
                cause: self.cancel_cause.unwrap_or(CancelCause::Caller),
                emitted: self.emitted,
            }
            .into()),
            Some(StopReason::Error) => Err(self
                .take_error()
                .map(Error::from)
                .unwrap_or_else(|| EvalError::Backend("unknown evaluation failure".to_string()).into())),
            Some(reason) => Ok(reason),
            None => Err(EvalError::Backend("generation has not finished".to_string()).into()),
        }
    }
}

/// Lazy, finite, pull-based token sequence over a borrowed context.
///
/// Every `next()` performs at most one evaluate; nothing is computed ahead of the
/// consumer. Once stopped the stream stays stopped.
pub struct GenerationStream<'ctx, B: Backend> {
    context: &'ctx InferenceContext<B>,
    state: GenerationState,
}

impl<'ctx, B: Backend> GenerationStream<'ctx, B> {
    /// Tokenizes `prompt` (if it is text) and readies the prefill.
    pub fn start(
        context: &'ctx InferenceContext<B>,
        prompt: impl Into<Prompt>,
        options: GenerationOptions,
    ) -> Result<Self, TokenizeError> {
        let state = GenerationState::prepare(context, prompt, &options)?;
        Ok(Self { context, state })
    }

    /// Wraps an already prepared state.
    pub fn from_state(context: &'ctx InferenceContext<B>, state: GenerationState) -> Self {
        Self { context, state }
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn phase(&self) -> GenerationPhase {
        self.state.phase()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.stop_reason()
    }

    pub fn cancel_cause(&self) -> Option<CancelCause> {
        self.state.cancel_cause()
    }

    pub fn emitted(&self) -> usize {
        self.state.emitted()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.state.cancel_token()
    }

    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }

    pub fn error(&self) -> Option<&EvaluateError> {
        self.state.error()
    }

    pub fn take_error(&mut self) -> Option<EvaluateError> {
        self.state.take_error()
    }

    /// Drains the remaining tokens.
    ///
    /// # Errors
    ///
    /// `Error::Cancelled` if the stream was cancelled or timed out, or the evaluation
    /// error that stopped it.
    pub fn complete(mut self) -> Result<Completion, Error> {
        let tokens: Sequence = self.by_ref().collect();
        let reason = self.state.outcome()?;
        Ok(Completion { tokens, reason })
    }
}

impl<B: Backend> Iterator for GenerationStream<'_, B> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.state.step(self.context)
    }
}

impl<B: Backend> std::iter::FusedIterator for GenerationStream<'_, B> {}
