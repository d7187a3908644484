use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{stream, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::InferenceError;
use crate::events::StreamEvent;
use crate::inference::{ChatTransport, ChunkStream, OpenAiTransport};
use crate::retry::{terminal_message, RetryDecision, RetryPolicy};
use crate::types::{ChatChunk, ChatCompletion, ChatRequest, Message, TokenUsage};

/// Builds the transport handle on first use.
pub type TransportFactory =
    Box<dyn Fn(&ProviderConfig) -> Result<Arc<dyn ChatTransport>, InferenceError> + Send + Sync>;

/// The streaming response pipeline.
///
/// Turns a chat request into a lazy sequence of [`StreamEvent`]s ending in
/// exactly one terminal event. Failures never escape as `Err`: rate limiting
/// is retried with exponential backoff, everything else becomes an
/// `Error` event.
pub struct LlmProvider {
    config: ProviderConfig,
    factory: TransportFactory,
    transport: Mutex<Option<Arc<dyn ChatTransport>>>,
}

impl LlmProvider {
    /// Pipeline backed by the OpenAI-compatible HTTP transport.
    pub fn new(config: ProviderConfig) -> Self {
        Self::with_factory(config, |config| {
            let transport: Arc<dyn ChatTransport> = Arc::new(OpenAiTransport::from_config(config)?);
            Ok(transport)
        })
    }

    pub fn with_factory(
        config: ProviderConfig,
        factory: impl Fn(&ProviderConfig) -> Result<Arc<dyn ChatTransport>, InferenceError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            config,
            factory: Box::new(factory),
            transport: Mutex::new(None),
        }
    }

    /// Pipeline that reuses an already-built transport.
    pub fn with_transport(config: ProviderConfig, transport: Arc<dyn ChatTransport>) -> Self {
        let provider = Self::with_factory(config, |_| {
            Err(InferenceError::Config("transport was closed".into()))
        });
        *provider.transport.lock().unwrap_or_else(PoisonError::into_inner) = Some(transport);
        provider
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn change_model(&mut self, model: impl Into<String>) {
        self.config.model = model.into();
        info!(model = %self.config.model, "model changed");
    }

    /// Whether a transport handle is currently held.
    pub fn is_open(&self) -> bool {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Return the shared transport, creating it on first use. The lock is
    /// held across creation so concurrent first callers build one handle.
    fn transport(&self) -> Result<Arc<dyn ChatTransport>, InferenceError> {
        let mut slot = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(transport) = slot.as_ref() {
            return Ok(Arc::clone(transport));
        }
        let transport = (self.factory)(&self.config)?;
        debug!(base_url = %self.config.base_url, "transport initialized");
        *slot = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// Release the transport handle. Safe to call repeatedly or before any
    /// request was made.
    pub async fn close(&self) {
        let handle = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(transport) = handle {
            transport.shutdown().await;
            debug!("transport closed");
        }
    }

    /// Send `messages` and stream back events. Nothing happens until the
    /// returned stream is polled.
    pub fn send_message(
        &self,
        messages: Vec<Message>,
        streaming: bool,
    ) -> impl Stream<Item = StreamEvent> + Send + '_ {
        let run = PipelineRun {
            provider: self,
            request: ChatRequest {
                model: self.config.model.clone(),
                messages,
                stream: streaming,
            },
            policy: RetryPolicy::new(self.config.max_retries, self.config.backoff_unit),
            transport: None,
            phase: Phase::Start,
        };
        stream::unfold(run, |mut run| async move {
            let event = run.next_event().await?;
            Some((event, run))
        })
    }
}

enum Phase {
    Start,
    Single,
    Connect {
        attempt: u32,
    },
    Backoff {
        attempt: u32,
        delay: Duration,
    },
    Streaming {
        attempt: u32,
        chunks: ChunkStream,
        acc: Accumulator,
        emitted: bool,
    },
    Done,
}

struct PipelineRun<'a> {
    provider: &'a LlmProvider,
    request: ChatRequest,
    policy: RetryPolicy,
    transport: Option<Arc<dyn ChatTransport>>,
    phase: Phase,
}

impl PipelineRun<'_> {
    /// Advance the state machine to the next visible event. Every branch that
    /// returns without setting `phase` leaves it at `Done`, so a terminal
    /// event is always the last one.
    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,

                Phase::Start => {
                    if self.request.messages.is_empty() {
                        return Some(StreamEvent::error("no messages to send"));
                    }
                    match self.provider.transport() {
                        Ok(transport) => self.transport = Some(transport),
                        Err(e) => {
                            warn!(error = %e, "failed to initialize transport");
                            return Some(StreamEvent::error(terminal_message(&e)));
                        }
                    }
                    info!(
                        model = %self.request.model,
                        messages = self.request.messages.len(),
                        stream = self.request.stream,
                        "sending message"
                    );
                    self.phase = if self.request.stream {
                        Phase::Connect { attempt: 0 }
                    } else {
                        Phase::Single
                    };
                }

                Phase::Single => {
                    let transport = self.transport.as_ref()?;
                    return Some(match transport.complete(&self.request).await {
                        Ok(completion) => single_shot_event(completion),
                        Err(e) => {
                            warn!(error = %e, "chat completion failed");
                            StreamEvent::error(terminal_message(&e))
                        }
                    });
                }

                Phase::Connect { attempt } => {
                    let transport = self.transport.as_ref()?;
                    match transport.stream(&self.request).await {
                        Ok(chunks) => {
                            debug!(attempt, "stream opened");
                            self.phase = Phase::Streaming {
                                attempt,
                                chunks,
                                acc: Accumulator::default(),
                                emitted: false,
                            };
                        }
                        Err(e) => {
                            if let Some(event) = self.retry_or_fail(attempt, e) {
                                return Some(event);
                            }
                        }
                    }
                }

                Phase::Backoff { attempt, delay } => {
                    tokio::time::sleep(delay).await;
                    self.phase = Phase::Connect { attempt };
                }

                Phase::Streaming {
                    attempt,
                    mut chunks,
                    mut acc,
                    emitted,
                } => match chunks.next().await {
                    Some(Ok(chunk)) => {
                        let delta = acc.absorb(chunk);
                        self.phase = Phase::Streaming {
                            attempt,
                            chunks,
                            acc,
                            emitted: emitted || delta.is_some(),
                        };
                        if delta.is_some() {
                            return delta;
                        }
                    }
                    Some(Err(e)) if emitted => {
                        warn!(error = %e, "stream failed after text was emitted");
                        return Some(StreamEvent::error(terminal_message(&e)));
                    }
                    Some(Err(e)) => {
                        if let Some(event) = self.retry_or_fail(attempt, e) {
                            return Some(event);
                        }
                    }
                    None => return Some(acc.complete()),
                },
            }
        }
    }

    /// Schedule a backoff and return `None`, or return the terminal error.
    fn retry_or_fail(&mut self, attempt: u32, err: InferenceError) -> Option<StreamEvent> {
        match self.policy.decide(attempt, &err) {
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                warn!(
                    attempt = next_attempt,
                    max_retries = self.policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "rate limit error encountered, retrying"
                );
                self.phase = Phase::Backoff {
                    attempt: next_attempt,
                    delay,
                };
                None
            }
            RetryDecision::Fail(message) => {
                if err.is_rate_limited() {
                    warn!(
                        max_retries = self.policy.max_retries,
                        "maximum retry attempts reached"
                    );
                } else {
                    warn!(error = %err, "chat completion failed");
                }
                Some(StreamEvent::error(message))
            }
        }
    }
}

/// Running usage and finish reason for one streaming attempt. Both are
/// last-wins: providers send cumulative usage snapshots.
#[derive(Debug, Default)]
struct Accumulator {
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
}

impl Accumulator {
    fn absorb(&mut self, chunk: ChatChunk) -> Option<StreamEvent> {
        if let Some(usage) = chunk.usage.as_ref() {
            self.usage = Some(usage.into());
        }
        let choice = chunk.choices.into_iter().next()?;
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }
        match choice.delta.content {
            Some(content) if !content.is_empty() => {
                Some(StreamEvent::text_delta(content, choice.delta.role))
            }
            _ => None,
        }
    }

    fn complete(self) -> StreamEvent {
        StreamEvent::MessageComplete {
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

fn single_shot_event(completion: ChatCompletion) -> StreamEvent {
    let usage = completion.usage.as_ref().map(TokenUsage::from);
    let choice = completion.choices.into_iter().next().unwrap_or_default();
    StreamEvent::TextDelta {
        content: choice.message.content.unwrap_or_default(),
        role: choice.message.role,
        finish_reason: choice.finish_reason,
        usage,
    }
}
