//! The interactive shell and single-shot runner.

use std::io::{self, BufRead};
use std::pin::pin;

use futures::StreamExt;
use tracing::debug;

use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::tui::Tui;
use crate::Agent;

/// One line of user input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Exit,
    Help,
    /// `/model` alone shows the current model, `/model <name>` switches.
    Model(Option<String>),
    Message(String),
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            Self::Empty
        } else if trimmed.eq_ignore_ascii_case("exit") {
            Self::Exit
        } else if trimmed == "/help" {
            Self::Help
        } else if trimmed == "/model" {
            Self::Model(None)
        } else if let Some(name) = trimmed.strip_prefix("/model ") {
            Self::Model(Some(name.trim().to_string()))
        } else {
            Self::Message(trimmed.to_string())
        }
    }
}

/// Drives an [`Agent`] and renders its events through a [`Tui`].
pub struct Shell {
    agent: Agent,
    tui: Tui,
}

impl Shell {
    pub fn new(agent: Agent, tui: Tui) -> Self {
        Self { agent, tui }
    }

    /// Send one message and render the turn. Returns the complete response
    /// text, if any was produced.
    pub async fn process_message(&mut self, message: &str) -> io::Result<Option<String>> {
        self.tui.begin_assistant()?;
        let mut final_response = None;

        let mut events = pin!(self.agent.run(message));
        while let Some(event) = events.next().await {
            match event {
                AgentEvent::AgentStarted {
                    agent_name,
                    message,
                } => {
                    self.tui.agent_started(&agent_name, &message)?;
                    self.tui.assistant_thinking("Thinking")?;
                }
                AgentEvent::TextDelta { content, .. } => {
                    self.tui.stream_assistant_delta(&content)?;
                }
                AgentEvent::TextComplete { content, .. } => {
                    self.tui.text_complete(&content);
                    final_response = Some(content);
                }
                AgentEvent::AgentFinished {
                    agent_name,
                    response,
                    ..
                } => {
                    self.tui.agent_finished(&agent_name, response.as_deref())?;
                }
                AgentEvent::AgentError {
                    message, details, ..
                } => {
                    debug!(?details, "agent error");
                    self.tui.agent_error(&message)?;
                }
            }
        }

        self.tui.end_assistant()?;
        Ok(final_response)
    }

    /// Run one message, then close the agent.
    pub async fn run_single(mut self, message: &str) -> io::Result<Option<String>> {
        let response = self.process_message(message).await;
        self.finish().await?;
        response
    }

    /// Read-eval loop over `input` until `exit` or end of input.
    pub async fn run_interactive(mut self, input: impl BufRead) -> io::Result<()> {
        let model = self
            .agent
            .provider()
            .map(|p| p.model().to_string())
            .unwrap_or_default();
        self.tui.show_welcome_message(self.agent.name(), &model)?;

        let mut lines = input.lines();
        let outcome = loop {
            if let Err(e) = self.tui.prompt() {
                break Err(e);
            }
            let line = match lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };
            let step = match Input::parse(&line) {
                Input::Empty => Ok(()),
                Input::Exit => {
                    let bye = self.tui.goodbye();
                    break bye;
                }
                Input::Help => self.tui.show_help(),
                Input::Model(name) => self.switch_model(name),
                Input::Message(text) => self.process_message(&text).await.map(|_| ()),
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        self.finish().await?;
        outcome
    }

    fn switch_model(&mut self, name: Option<String>) -> io::Result<()> {
        let Some(provider) = self.agent.provider_mut() else {
            return self.tui.warning(&AgentError::NotInitialized.to_string());
        };
        match name {
            Some(name) => {
                provider.change_model(name);
                let notice = format!("Model changed to {}", provider.model());
                self.tui.success(&notice)
            }
            None => {
                let notice = format!("Current model: {}", provider.model());
                self.tui.info(&notice)
            }
        }
    }

    /// Close the agent and report session token usage.
    async fn finish(&mut self) -> io::Result<()> {
        let usage = self.agent.session_usage();
        self.agent.close().await;
        self.tui.usage_summary(&usage)
    }
}
