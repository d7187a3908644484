use serde::Serialize;
use serde_json::{Map, Value};

use crate::types::TokenUsage;

/// Provider-level events produced by one `send_message` call.
///
/// `MessageComplete` and `Error` are terminal: nothing follows them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        content: String,
        role: Option<String>,
        /// Only populated by single-shot responses.
        finish_reason: Option<String>,
        /// Only populated by single-shot responses.
        usage: Option<TokenUsage>,
    },
    MessageComplete {
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn text_delta(content: impl Into<String>, role: Option<String>) -> Self {
        Self::TextDelta {
            content: content.into(),
            role,
            finish_reason: None,
            usage: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Events emitted during an agent run, for UI streaming.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStarted {
        agent_name: String,
        message: String,
    },
    TextDelta {
        agent_name: String,
        content: String,
    },
    TextComplete {
        agent_name: String,
        content: String,
    },
    AgentFinished {
        agent_name: String,
        response: Option<String>,
        usage: Option<TokenUsage>,
    },
    AgentError {
        agent_name: String,
        message: String,
        details: Map<String, Value>,
    },
}

impl AgentEvent {
    pub fn agent_name(&self) -> &str {
        match self {
            Self::AgentStarted { agent_name, .. }
            | Self::TextDelta { agent_name, .. }
            | Self::TextComplete { agent_name, .. }
            | Self::AgentFinished { agent_name, .. }
            | Self::AgentError { agent_name, .. } => agent_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_events_serialize_with_snake_case_tags() {
        let event = AgentEvent::AgentFinished {
            agent_name: "example_agent".into(),
            response: Some("done".into()),
            usage: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "agent_finished",
                "agent_name": "example_agent",
                "response": "done",
                "usage": null,
            })
        );
        assert_eq!(event.agent_name(), "example_agent");
    }

    #[test]
    fn stream_error_serializes_message() {
        let value = serde_json::to_value(StreamEvent::error("boom")).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "boom"}));
    }
}
