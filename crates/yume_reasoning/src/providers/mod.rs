pub mod mock;
pub mod openai;

pub use mock::MockProvider;
pub use openai::{OpenAiClient, AICHAT_TARGET};

use crate::llm::LlmClient;
use anyhow::Result;
use std::sync::Arc;
use yume_core::AiConfig;

/// Build the provider named by `ai.provider`.
pub fn from_config(cfg: &AiConfig) -> Result<Arc<dyn LlmClient>> {
    match cfg.provider.as_str() {
        "mock" => {
            tracing::warn!("Using the mock completion provider");
            Ok(Arc::new(MockProvider::new()))
        }
        "openai" | "deepseek" | "" => Ok(Arc::new(OpenAiClient::from_config(cfg)?)),
        other => {
            tracing::info!("Treating provider '{}' as OpenAI-compatible", other);
            Ok(Arc::new(OpenAiClient::from_config(cfg)?))
        }
    }
}
