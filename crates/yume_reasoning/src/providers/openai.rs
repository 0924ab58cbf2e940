use crate::api_types::{ChatRequest, ChatResponse};
use crate::llm::{CompletionParams, LlmClient, ProviderError};
use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use yume_core::{AiConfig, ChatEntry};

/// Target for request/response transcripts, routed to its own log file.
pub const AICHAT_TARGET: &str = "yume::aichat";

/// Client for any OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl OpenAiClient {
    /// The HTTP client timeout is a backstop; the policy engine enforces the
    /// per-attempt deadline.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let base = base_url.trim().trim_end_matches('/');
        let endpoint = if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        };
        Ok(Self {
            client: Client::builder()
                .timeout(timeout + Duration::from_secs(5))
                .build()
                .context("Failed to build HTTP client")?,
            api_key: api_key.to_string(),
            endpoint,
        })
    }

    pub fn from_config(cfg: &AiConfig) -> Result<Self> {
        Self::new(&cfg.base_url, &cfg.api_key, cfg.timeout())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        conversation: &[ChatEntry],
        params: &CompletionParams,
    ) -> Result<String, ProviderError> {
        if let Some(last) = conversation.last() {
            tracing::info!(target: AICHAT_TARGET, "[{:?}] {}", last.role, last.content);
        }

        let payload = ChatRequest {
            model: &params.model,
            messages: conversation,
            stream: false,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        };

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;

        let status = response.status();
        tracing::debug!("Completion endpoint answered {}", status);
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        if let Some(usage) = body.usage {
            tracing::debug!(
                "Completion used {} prompt + {} completion tokens",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }
        let text = body
            .first_text()
            .ok_or_else(|| ProviderError::Decode("response has no choices".to_string()))?
            .to_string();

        tracing::info!(target: AICHAT_TARGET, "[Assistant] {}", text);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalization() {
        let c = OpenAiClient::new("https://api.example.com/v1/", "k", Duration::from_secs(1)).unwrap();
        assert_eq!(c.endpoint(), "https://api.example.com/v1/chat/completions");

        let c = OpenAiClient::new(
            "https://api.example.com/chat/completions",
            "k",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(c.endpoint(), "https://api.example.com/chat/completions");
    }
}
