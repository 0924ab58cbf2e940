pub mod config;
pub mod persona;

pub use config::{
    AiConfig, ConfigHandle, LoggingConfig, MemoryConfig, OneBotConfig, PersonaConfig,
    SchedulerConfig, YumeConfig,
};
pub use persona::Character;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// QQ number of a remote party.
pub type UserId = i64;

/// Speaker of one conversation entry, serialized the way chat-completion
/// APIs expect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: Role,
    pub content: String,
}

impl ChatEntry {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The current conversational mode the bot is in with one user.
///
/// Closed set: every consumer matches on it exhaustively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngagementState {
    /// Default. Preset replies, emotion analysis and proactive pings all apply.
    #[default]
    Idle,
    /// A longing/loneliness probe was sent; waiting for the user to comfort.
    NeedComfort,
    /// An encouragement probe was sent; waiting for the user to encourage.
    NeedEncourage,
    /// Every inbound message is forwarded to the completion service.
    LongChat,
    /// The user brushed off a probe; waiting for an apology or a clearer signal.
    Perfunctory,
    /// The user said they are busy; proactive messages are held back.
    Busy,
}

impl EngagementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementState::Idle => "idle",
            EngagementState::NeedComfort => "need_comfort",
            EngagementState::NeedEncourage => "need_encourage",
            EngagementState::LongChat => "long_chat",
            EngagementState::Perfunctory => "perfunctory",
            EngagementState::Busy => "busy",
        }
    }
}

impl fmt::Display for EngagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound text channel to a remote user.
#[async_trait]
pub trait Expression: Send + Sync {
    async fn speak(&self, user_id: UserId, message: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let entry = ChatEntry::assistant("嗯");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"嗯"}"#);
    }

    #[test]
    fn test_default_state_is_idle() {
        assert_eq!(EngagementState::default(), EngagementState::Idle);
        assert_eq!(EngagementState::LongChat.to_string(), "long_chat");
    }
}
