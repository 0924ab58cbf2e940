pub mod analysis;
pub mod api_types;
pub mod handlers;
pub mod llm;
pub mod policy;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod text;

pub use analysis::{Analyzer, Emotion, Intention};
pub use handlers::{Handler, HandlerChain, HandlerContext, HandlerKind};
pub use llm::{CompletionParams, LlmClient, ProviderError};
pub use policy::{Completion, CompletionPolicy, PolicyError, PolicySettings};
pub use rate_limit::RateLimiter;
pub use retry::Backoff;
pub use text::clean_think_tags;
