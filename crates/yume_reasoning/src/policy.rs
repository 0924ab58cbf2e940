//! Completion Policy Engine.
//!
//! Every call to the completion service goes through here:
//! token → attempt under deadline → classify → back off → repeat.

use crate::llm::{CompletionParams, LlmClient, ProviderError};
use crate::rate_limit::RateLimiter;
use crate::retry::{Backoff, MAX_RETRIES};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use yume_core::{AiConfig, ChatEntry};

#[derive(Debug, Error)]
pub enum PolicyError {
    /// No rate-limit token within the per-call timeout. Local; not retried.
    #[error("timed out waiting for a rate limit token")]
    RateLimitTimeout,
    #[error("completion failed: {0}")]
    NonRetryable(#[source] ProviderError),
    #[error("completion failed after {attempts} attempt(s): {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    #[error("completion cancelled")]
    Cancelled,
}

/// Tunables, swapped as one unit on reload.
#[derive(Debug, Clone)]
pub struct PolicySettings {
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub attempt_timeout: Duration,
    /// Bound on waiting for a rate-limit token.
    pub acquire_timeout: Duration,
    pub backoff: Backoff,
    pub params: CompletionParams,
}

impl PolicySettings {
    pub fn from_config(cfg: &AiConfig) -> Self {
        Self {
            retry_count: cfg.retry_count.min(MAX_RETRIES),
            attempt_timeout: cfg.timeout(),
            acquire_timeout: cfg.timeout(),
            backoff: Backoff::default(),
            params: CompletionParams::from(cfg),
        }
    }
}

/// A successful completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub reply: String,
    /// Input conversation with the reply appended as an assistant entry.
    pub conversation: Vec<ChatEntry>,
}

pub struct CompletionPolicy {
    client: Arc<dyn LlmClient>,
    limiter: RateLimiter,
    settings: ArcSwap<PolicySettings>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl CompletionPolicy {
    /// Must be called inside a tokio runtime (the limiter spawns its refill
    /// task).
    pub fn new(client: Arc<dyn LlmClient>, settings: PolicySettings, rate_limit: u32) -> Self {
        Self {
            client,
            limiter: RateLimiter::new(rate_limit),
            settings: ArcSwap::from_pointee(settings),
            shutdown: None,
        }
    }

    pub fn from_config(client: Arc<dyn LlmClient>, cfg: &AiConfig) -> Self {
        Self::new(client, PolicySettings::from_config(cfg), cfg.rate_limit)
    }

    /// Stop starting new attempts once `shutdown` turns true. An attempt
    /// already in flight runs to its own deadline.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn settings(&self) -> Arc<PolicySettings> {
        self.settings.load_full()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Apply a reloaded configuration: new settings and a fresh bucket.
    pub fn reconfigure(&self, cfg: &AiConfig) {
        self.settings.store(Arc::new(PolicySettings::from_config(cfg)));
        self.limiter.reset(cfg.rate_limit);
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Complete `conversation` with the configured sampling options.
    pub async fn complete(&self, conversation: Vec<ChatEntry>) -> Result<Completion, PolicyError> {
        let params = self.settings.load().params.clone();
        self.complete_with(conversation, &params).await
    }

    pub async fn complete_with(
        &self,
        mut conversation: Vec<ChatEntry>,
        params: &CompletionParams,
    ) -> Result<Completion, PolicyError> {
        let reply = self.call(&conversation, params).await?;
        conversation.push(ChatEntry::assistant(reply.clone()));
        Ok(Completion {
            reply,
            conversation,
        })
    }

    /// One-shot prompt: `system` instructions plus a single user message.
    pub async fn ask(&self, system: &str, message: &str) -> Result<String, PolicyError> {
        let conversation = [ChatEntry::system(system), ChatEntry::user(message)];
        let params = self.settings.load().params.clone();
        self.call(&conversation, &params).await
    }

    async fn call(
        &self,
        conversation: &[ChatEntry],
        params: &CompletionParams,
    ) -> Result<String, PolicyError> {
        let settings = self.settings.load_full();
        let max_attempts = settings.retry_count.min(MAX_RETRIES) + 1;
        let mut attempt = 0;

        loop {
            if self.cancelled() {
                return Err(PolicyError::Cancelled);
            }
            attempt += 1;

            if self.limiter.acquire(settings.acquire_timeout).await.is_err() {
                tracing::warn!("No rate limit token within {:?}", settings.acquire_timeout);
                return Err(PolicyError::RateLimitTimeout);
            }

            let outcome = match tokio::time::timeout(
                settings.attempt_timeout,
                self.client.complete(conversation, params),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };

            let error = match outcome {
                Ok(text) => {
                    if attempt > 1 {
                        tracing::info!("Completion succeeded on attempt {}", attempt);
                    }
                    return Ok(text);
                }
                Err(ProviderError::Cancelled) => return Err(PolicyError::Cancelled),
                Err(e) if !e.is_retryable() => {
                    tracing::warn!("Completion failed, not retrying: {}", e);
                    return Err(PolicyError::NonRetryable(e));
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                tracing::error!("Completion failed after {} attempt(s): {}", attempt, error);
                return Err(PolicyError::ExhaustedRetries {
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = settings.backoff.delay(attempt, &mut rand::thread_rng());
            tracing::warn!(
                "Completion attempt {}/{} failed: {}; retrying in {:?}",
                attempt,
                max_attempts,
                error,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
