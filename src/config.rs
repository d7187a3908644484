use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_MODEL: &str = "arcee-ai/trinity-large-preview:free";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_AGENT_NAME: &str = "example_agent";

pub const API_KEY_VAR: &str = "API_KEY";
pub const BASE_URL_VAR: &str = "BASE_URL";

/// Pipeline configuration. Fixed for the lifetime of an `LlmProvider`,
/// apart from the model which can be swapped between calls.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub model: String,
    /// Extra attempts after the first on rate limiting.
    pub max_retries: u32,
    pub api_key: Option<String>,
    pub base_url: String,
    /// Backoff before retry `n` (counted from 0) is `2^n` of these.
    pub backoff_unit: Duration,
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            api_key: None,
            base_url: DEFAULT_BASE_URL.into(),
            backoff_unit: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

impl ProviderConfig {
    /// Load `.env` from the working directory (or a parent) if there is one,
    /// then read the credential and endpoint from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded env file"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(ConfigError::EnvFile(e.to_string())),
        }
        Ok(Self::from_lookup(|key| std::env::var(key).ok()))
    }

    /// Read configuration from a specific env file, without touching the
    /// process environment.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let vars = dotenvy::from_path_iter(path.as_ref())
            .map_err(|e| ConfigError::EnvFile(e.to_string()))?
            .collect::<Result<Vec<(String, String)>, _>>()
            .map_err(|e| ConfigError::EnvFile(e.to_string()))?;
        Ok(Self::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.api_key = lookup(API_KEY_VAR).filter(|k| !k.trim().is_empty());
        if let Some(url) = lookup(BASE_URL_VAR).filter(|u| !u.trim().is_empty()) {
            config.base_url = url;
        }
        config
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "model",
                reason: "must not be empty".into(),
            });
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: BASE_URL_VAR,
                reason: format!("expected an http(s) URL, got '{}'", self.base_url),
            });
        }
        Ok(())
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT_NAME.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(config.api_key.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(AgentConfig::default().name, "example_agent");
    }

    #[test]
    fn env_file_supplies_key_and_base_url() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "API_KEY=sk-test").unwrap();
        writeln!(file, "BASE_URL=https://openrouter.ai/api/v1").unwrap();

        let config = ProviderConfig::from_env_file(file.path()).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "API_KEY=").unwrap();
        writeln!(file, "BASE_URL=").unwrap();

        let config = ProviderConfig::from_env_file(file.path()).unwrap();
        assert!(config.api_key.is_none());
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn missing_env_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProviderConfig::from_env_file(dir.path().join("nope.env")).unwrap_err();
        assert!(matches!(err, ConfigError::EnvFile(_)));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let config = ProviderConfig::default().with_base_url("localhost:8080");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "BASE_URL", .. })
        ));

        let config = ProviderConfig::default().with_model("  ");
        assert!(config.validate().is_err());
    }
}
