#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("LLM client is not initialized.")]
    NotInitialized,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Failures at the transport boundary. The pipeline classifies these into
/// retryable, connectivity and unexpected failures; none of them escape it.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("rate limited: {body}")]
    RateLimited { body: String },
    #[error("{0}")]
    Connection(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("client configuration error: {0}")]
    Config(String),
}

impl InferenceError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Classify a `reqwest` failure. Connect and timeout errors are
    /// connectivity problems, everything else is a plain request failure.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else if err.status().map(|s| s.as_u16()) == Some(429) {
            Self::RateLimited {
                body: err.to_string(),
            }
        } else {
            Self::Request(err.to_string())
        }
    }

    /// Classify a failure while reading a whole response body. A truncated
    /// or undecodable body is a parse failure; timeouts stay connectivity
    /// problems.
    pub fn from_body_read(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Connection(err.to_string())
        } else if err.is_body() || err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::from_reqwest(err)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load env file: {0}")]
    EnvFile(String),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
