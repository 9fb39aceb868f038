use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::Stream;
use tracing::error;

use super::context::InferenceContext;
use super::generation::{CancelToken, GenerationOptions, GenerationState, Prompt, StopReason};
use crate::llm::backend::Backend;
use crate::llm::error::{CancelCause, EvalError, EvaluateError, TokenizeError};
use crate::llm::tokenizer::Token;

/// One item of a [`TokenStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(Token),
    /// Always the last item.
    Stopped {
        reason: StopReason,
        cause: Option<CancelCause>,
        error: Option<EvaluateError>,
    },
}

/// Async adapter over the generation state machine.
///
/// Each step is run on tokio's blocking pool and the next step is only scheduled when
/// the consumer polls again, so no work happens ahead of the consumer.
pub struct TokenStream {
    inner: Pin<Box<dyn Stream<Item = StreamEvent> + Send>>,
    cancel: CancelToken,
}

impl TokenStream {
    /// Tokenizes `prompt` and returns a stream that generates lazily on `context`.
    ///
    /// Must be polled from within a tokio runtime.
    pub fn start<B: Backend>(
        context: Arc<InferenceContext<B>>,
        prompt: impl Into<Prompt>,
        options: GenerationOptions,
    ) -> Result<Self, TokenizeError> {
        let state = GenerationState::prepare(&*context, prompt, &options)?;
        Ok(Self::from_state(context, state))
    }

    pub fn from_state<B: Backend>(context: Arc<InferenceContext<B>>, state: GenerationState) -> Self {
        let cancel = state.cancel_token();
        let inner = async_stream::stream! {
            let mut state = state;
            loop {
                let ctx = Arc::clone(&context);
                let step = tokio::task::spawn_blocking(move || {
                    let token = state.step(&*ctx);
                    (state, token)
                })
                .await;

                match step {
                    Ok((next, Some(token))) => {
                        state = next;
                        yield StreamEvent::Token(token);
                    }
                    Ok((mut next, None)) => {
                        yield StreamEvent::Stopped {
                            reason: next.stop_reason().unwrap_or(StopReason::Error),
                            cause: next.cancel_cause(),
                            error: next.take_error(),
                        };
                        break;
                    }
                    Err(join_error) => {
                        error!(error = %join_error, "Generation step did not complete");
                        yield StreamEvent::Stopped {
                            reason: StopReason::Error,
                            cause: None,
                            error: Some(EvalError::Backend(format!("generation step aborted: {}", join_error)).into()),
                        };
                        break;
                    }
                }
            }
        };

        Self {
            inner: Box::pin(inner),
            cancel,
        }
    }

    /// Shares the stream's cancellation flag.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for TokenStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
