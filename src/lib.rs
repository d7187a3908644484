pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod inference;
pub mod provider;
pub mod retry;
pub mod tui;
pub mod types;

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

pub use config::{AgentConfig, ProviderConfig};
pub use error::{AgentError, ConfigError, InferenceError};
pub use events::{AgentEvent, StreamEvent};
pub use inference::{ChatTransport, ChunkStream, OpenAiTransport};
pub use provider::LlmProvider;
pub use retry::RetryPolicy;
pub use types::{ChatRequest, Message, Role, TokenUsage};

/// The agent. Wraps one pipeline and republishes its events under the
/// agent's name, framed by start/finish events.
pub struct Agent {
    provider: Option<LlmProvider>,
    config: AgentConfig,
    session_usage: Mutex<TokenUsage>,
}

impl Agent {
    pub fn new(provider: LlmProvider, config: AgentConfig) -> Self {
        Self {
            provider: Some(provider),
            config,
            session_usage: Mutex::new(TokenUsage::default()),
        }
    }

    /// Agent with the default name, configured from `.env` / environment.
    pub fn from_env() -> Result<Self, AgentError> {
        let config = ProviderConfig::from_env()?;
        Ok(Self::new(LlmProvider::new(config), AgentConfig::default()))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn provider(&self) -> Option<&LlmProvider> {
        self.provider.as_ref()
    }

    pub fn provider_mut(&mut self) -> Option<&mut LlmProvider> {
        self.provider.as_mut()
    }

    /// Token usage summed over every completed response of this agent.
    pub fn session_usage(&self) -> TokenUsage {
        *self
            .session_usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the pipeline and drop it. Later runs report `NotInitialized`.
    pub async fn close(&mut self) {
        if let Some(provider) = self.provider.take() {
            provider.close().await;
            info!(agent = %self.config.name, "agent closed");
        }
    }

    /// Run one message through the pipeline.
    ///
    /// Always yields `AgentStarted` first and `AgentFinished` last; pipeline
    /// failures show up as `AgentError` in between.
    pub fn run(&self, message: &str) -> impl Stream<Item = AgentEvent> + Send + '_ {
        let agent_name = self.config.name.clone();
        let mut pending = VecDeque::new();
        pending.push_back(AgentEvent::AgentStarted {
            agent_name: agent_name.clone(),
            message: message.to_string(),
        });

        let inner = match &self.provider {
            Some(provider) => Some(
                provider
                    .send_message(vec![Message::user(message)], true)
                    .boxed(),
            ),
            None => {
                let mut details = Map::new();
                details.insert("kind".into(), json!("not_initialized"));
                pending.push_back(AgentEvent::AgentError {
                    agent_name: agent_name.clone(),
                    message: AgentError::NotInitialized.to_string(),
                    details,
                });
                None
            }
        };

        info!(agent = %agent_name, "agent run");
        let run = AgentRun {
            agent_name,
            inner,
            pending,
            buffer: String::new(),
            finished: false,
            session_usage: &self.session_usage,
        };
        stream::unfold(run, |mut run| async move {
            let event = run.next_event().await?;
            Some((event, run))
        })
    }
}

struct AgentRun<'a> {
    agent_name: String,
    inner: Option<BoxStream<'a, StreamEvent>>,
    pending: VecDeque<AgentEvent>,
    buffer: String,
    finished: bool,
    session_usage: &'a Mutex<TokenUsage>,
}

impl AgentRun<'_> {
    async fn next_event(&mut self) -> Option<AgentEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            let next = match self.inner.as_mut() {
                Some(inner) => inner.next().await,
                None => None,
            };

            match next {
                Some(StreamEvent::TextDelta { content, .. }) => {
                    self.buffer.push_str(&content);
                    return Some(AgentEvent::TextDelta {
                        agent_name: self.agent_name.clone(),
                        content,
                    });
                }
                Some(StreamEvent::Error { message }) => {
                    return Some(AgentEvent::AgentError {
                        agent_name: self.agent_name.clone(),
                        message,
                        details: Map::<String, Value>::new(),
                    });
                }
                Some(StreamEvent::MessageComplete {
                    finish_reason,
                    usage,
                }) => {
                    debug!(?finish_reason, ?usage, "message complete");
                    if let Some(usage) = usage {
                        *self
                            .session_usage
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) += usage;
                    }
                }
                None => self.finish(),
            }
        }
    }

    fn finish(&mut self) {
        self.inner = None;
        self.finished = true;

        let response = if self.buffer.is_empty() {
            None
        } else {
            let content = std::mem::take(&mut self.buffer);
            self.pending.push_back(AgentEvent::TextComplete {
                agent_name: self.agent_name.clone(),
                content: content.clone(),
            });
            Some(content)
        };

        info!(agent = %self.agent_name, responded = response.is_some(), "agent finished");
        self.pending.push_back(AgentEvent::AgentFinished {
            agent_name: self.agent_name.clone(),
            response,
            usage: None,
        });
    }
}
