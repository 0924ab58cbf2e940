use async_trait::async_trait;
use thiserror::Error;
use yume_core::{AiConfig, ChatEntry};

/// Sampling options passed with every completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            model: "deepseek-chat".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            top_p: 1.0,
        }
    }
}

impl From<&AiConfig> for CompletionParams {
    fn from(cfg: &AiConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
        }
    }
}

/// Failure of a single call to the completion service.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Network(_) => true,
            ProviderError::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            ProviderError::Other(msg) => {
                let msg = msg.to_ascii_lowercase();
                ["connection reset", "eof", "rate limit", "too many requests", "overload"]
                    .iter()
                    .any(|needle| msg.contains(needle))
            }
            ProviderError::Decode(_) | ProviderError::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_connect() || e.is_request() {
            ProviderError::Network(e.to_string())
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            ProviderError::Other(e.to_string())
        }
    }
}

/// A remote text-completion service.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the whole conversation and return the assistant's reply text.
    async fn complete(
        &self,
        conversation: &[ChatEntry],
        params: &CompletionParams,
    ) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Network("refused".into()).is_retryable());
        for status in [429, 500, 502, 503, 504] {
            assert!(ProviderError::Http { status, body: String::new() }.is_retryable());
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!ProviderError::Http { status, body: String::new() }.is_retryable());
        }
        assert!(ProviderError::Other("unexpected EOF".into()).is_retryable());
        assert!(ProviderError::Other("Connection reset by peer".into()).is_retryable());
        assert!(!ProviderError::Other("invalid api key".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
        assert!(!ProviderError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_params_from_config() {
        let cfg = AiConfig {
            model: "m".into(),
            max_tokens: 10,
            ..AiConfig::default()
        };
        let p = CompletionParams::from(&cfg);
        assert_eq!(p.model, "m");
        assert_eq!(p.max_tokens, 10);
    }
}
