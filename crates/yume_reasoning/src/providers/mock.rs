//! Mock provider: replays scripted outcomes, for tests and offline runs.

use crate::llm::{CompletionParams, LlmClient, ProviderError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use yume_core::ChatEntry;

type Outcome = Result<String, ProviderError>;

/// Pops one scripted outcome per call. Once the script is empty every call
/// answers with the fallback text.
pub struct MockProvider {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Option<Box<dyn Fn() -> Outcome + Send + Sync>>,
    calls: AtomicUsize,
    delay: Duration,
    seen: Mutex<Vec<Vec<ChatEntry>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue outcomes in order.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        {
            let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
            script.extend(outcomes);
        }
        self
    }

    /// Outcome for every call past the end of the script.
    pub fn always(mut self, f: impl Fn() -> Outcome + Send + Sync + 'static) -> Self {
        self.fallback = Some(Box::new(f));
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Conversations received so far.
    pub fn seen(&self) -> Vec<Vec<ChatEntry>> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl LlmClient for MockProvider {
    async fn complete(
        &self,
        conversation: &[ChatEntry],
        params: &CompletionParams,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(conversation.to_vec());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match next {
            Some(outcome) => outcome,
            None => match &self.fallback {
                Some(f) => f(),
                None => Ok(format!("(Mock {} Response)", params.model)),
            },
        }
    }
}
