use std::time::Duration;

use clap::ValueEnum;
use serde::Serialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_URL: &str = "ws://localhost:8082/caton/chatbot";
pub const DEFAULT_GREETING_TIMEOUT: Duration = Duration::from_secs(10);
/// Inference on CPU routinely takes minutes.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// What the session does when a reply does not arrive in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseTimeoutPolicy {
    /// Report the timeout and return to `Ready`; the connection stays open.
    #[default]
    Lenient,
    /// Report the timeout, fail the session and close the connection.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub url: Url,
    pub greeting_timeout: Duration,
    pub response_timeout: Duration,
    pub response_timeout_policy: ResponseTimeoutPolicy,
}

impl SessionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            greeting_timeout: DEFAULT_GREETING_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            response_timeout_policy: ResponseTimeoutPolicy::default(),
        }
    }

    pub fn with_greeting_timeout(mut self, timeout: Duration) -> Self {
        self.greeting_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_response_timeout_policy(mut self, policy: ResponseTimeoutPolicy) -> Self {
        self.response_timeout_policy = policy;
        self
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),
}

/// Parses a chatbot endpoint, accepting only WebSocket schemes.
pub fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}
