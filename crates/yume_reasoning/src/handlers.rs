//! Inbound message handlers.
//!
//! Handlers are tried in a fixed order and the first one that accepts the
//! message produces the reply: preset phrases, then emotion analysis, then
//! long chat. A preset phrase therefore wins even in the middle of a long
//! chat.

use crate::analysis::{Analyzer, Emotion, Intention};
use crate::policy::CompletionPolicy;
use crate::text::clean_think_tags;
use yume_core::{ChatEntry, EngagementState, UserId};
use yume_memory::{EmotionalMemory, StateMachine};

/// Recorded when a preset reply marks the user busy. Only the status monitor
/// reads it.
pub const FLAG_REPLIED: &str = "replied";

/// Phrase that always ends a long chat.
pub const END_PHRASE: &str = "不聊了";

/// Reply when nothing better applies.
pub const FALLBACK_REPLY: &str = "?";

/// Everything a handler may touch while processing one message.
pub struct HandlerContext<'a> {
    pub user: UserId,
    pub state: &'a StateMachine,
    pub policy: &'a CompletionPolicy,
    pub memory: Option<&'a EmotionalMemory>,
    /// Persona system prompt used to seed a new long chat.
    pub system_prompt: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Preset,
    Emotion,
    LongChat,
}

/// Closed set of handlers, dispatched in list order.
#[derive(Debug, Clone)]
pub enum Handler {
    Preset(PresetHandler),
    Emotion(EmotionHandler),
    LongChat(LongChatHandler),
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Preset(_) => HandlerKind::Preset,
            Handler::Emotion(_) => HandlerKind::Emotion,
            Handler::LongChat(_) => HandlerKind::LongChat,
        }
    }

    pub fn can_handle(&self, message: &str, state: EngagementState) -> bool {
        match self {
            Handler::Preset(h) => h.can_handle(message),
            Handler::Emotion(_) => state != EngagementState::LongChat,
            Handler::LongChat(_) => state == EngagementState::LongChat,
        }
    }

    /// `None` means nothing should be sent for this turn.
    pub async fn handle(&self, ctx: &HandlerContext<'_>, message: &str) -> Option<String> {
        match self {
            Handler::Preset(h) => h.handle(ctx, message).await,
            Handler::Emotion(h) => h.handle(ctx, message).await,
            Handler::LongChat(h) => h.handle(ctx, message).await,
        }
    }
}

/// Ordered handler list.
#[derive(Debug, Clone)]
pub struct HandlerChain {
    handlers: Vec<Handler>,
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self {
            handlers: vec![
                Handler::Preset(PresetHandler::default()),
                Handler::Emotion(EmotionHandler),
                Handler::LongChat(LongChatHandler),
            ],
        }
    }
}

impl HandlerChain {
    pub fn kinds(&self) -> Vec<HandlerKind> {
        self.handlers.iter().map(Handler::kind).collect()
    }

    /// First handler that accepts the message for the user's current state.
    pub fn select(&self, message: &str, state: EngagementState) -> Option<&Handler> {
        self.handlers.iter().find(|h| h.can_handle(message, state))
    }

    pub async fn dispatch(&self, ctx: &HandlerContext<'_>, message: &str) -> Option<String> {
        let state = ctx.state.state(ctx.user).await;
        match self.select(message, state) {
            Some(handler) => {
                tracing::debug!("{:?} handler takes message in state {}", handler.kind(), state);
                handler.handle(ctx, message).await
            }
            None => Some(FALLBACK_REPLY.to_string()),
        }
    }
}

// ============================================================================
// Preset
// ============================================================================

#[derive(Debug, Clone)]
pub struct PresetHandler {
    responses: Vec<(&'static str, &'static str)>,
}

impl Default for PresetHandler {
    fn default() -> Self {
        Self {
            responses: vec![
                ("你好", "你好"),
                ("在干嘛", "在学习"),
                ("在忙呢", "好吧"),
                ("难过了", "别难过，开心点，加油！"),
                ("我想你了", "是嘛？嘿嘿"),
                ("能陪我聊聊吗", "好"),
            ],
        }
    }
}

impl PresetHandler {
    fn lookup(&self, message: &str) -> Option<&'static str> {
        let message = message.trim();
        self.responses
            .iter()
            .find(|(trigger, _)| *trigger == message)
            .map(|(_, reply)| *reply)
    }

    pub fn can_handle(&self, message: &str) -> bool {
        self.lookup(message).is_some()
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, message: &str) -> Option<String> {
        let reply = self.lookup(message)?;
        match message.trim() {
            "在忙呢" => {
                ctx.state.set_flag(ctx.user, FLAG_REPLIED, true).await;
                ctx.state.set_state(ctx.user, EngagementState::Busy).await;
            }
            "能陪我聊聊吗" => {
                ctx.state.clear_conversation(ctx.user).await;
                ctx.state.set_state(ctx.user, EngagementState::LongChat).await;
            }
            _ => {}
        }
        Some(reply.to_string())
    }
}

// ============================================================================
// Emotion
// ============================================================================

/// Classifies the message and reacts; resolves pending mood probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmotionHandler;

impl EmotionHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, message: &str) -> Option<String> {
        let analyzer = Analyzer::new(ctx.policy);
        let state = ctx.state.state(ctx.user).await;
        let emotion = analyzer.emotion(message).await;
        let intention = analyzer.intention(message).await;
        tracing::info!(
            "User {} [{}]: emotion={} intention={:?}",
            ctx.user,
            state,
            emotion,
            intention.map(|i| i.label())
        );

        use EngagementState::*;
        let reply = match state {
            NeedComfort | NeedEncourage if emotion == Emotion::Perfunctory => {
                ctx.state.set_state(ctx.user, Perfunctory).await;
                Some("哦，好吧".to_string())
            }
            NeedComfort if intention == Some(Intention::Comforting) => {
                ctx.state.set_state(ctx.user, Idle).await;
                Some("嘿嘿，有你真好".to_string())
            }
            NeedEncourage if intention == Some(Intention::Encouraging) => {
                ctx.state.set_state(ctx.user, Idle).await;
                Some("嗯！我会加油的".to_string())
            }
            Perfunctory if intention == Some(Intention::Apologizing) => {
                ctx.state.set_state(ctx.user, Idle).await;
                Some("没事啦".to_string())
            }
            Perfunctory => Some("哼".to_string()),
            Idle | NeedComfort | NeedEncourage | Busy | LongChat => {
                self.react(ctx, message, emotion, intention).await
            }
        };

        if let (Some(memory), Some(intention)) = (ctx.memory, intention) {
            memory
                .record(
                    ctx.user,
                    message,
                    reply.as_deref().unwrap_or(""),
                    emotion.label(),
                    intention.label(),
                )
                .await;
        }
        reply
    }

    async fn react(
        &self,
        ctx: &HandlerContext<'_>,
        message: &str,
        emotion: Emotion,
        intention: Option<Intention>,
    ) -> Option<String> {
        match emotion {
            Emotion::Happy => return Some("那很好了。".to_string()),
            Emotion::Angry => return Some("我做错什么了？".to_string()),
            Emotion::Philosophical => return Some("乐".to_string()),
            _ => {}
        }

        if intention.map_or(false, |i| i.wants_long_chat()) {
            let reply = converse(ctx, Vec::new(), message).await?;
            ctx.state.set_state(ctx.user, EngagementState::LongChat).await;
            return Some(reply);
        }

        if let Some(memory) = ctx.memory {
            if let Some(line) = memory.suggest_response(ctx.user, emotion.label()).await {
                return Some(line.to_string());
            }
        }
        Some(FALLBACK_REPLY.to_string())
    }
}

// ============================================================================
// Long chat
// ============================================================================

/// Forwards every message to the completion service as one running
/// conversation until the user signs off.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongChatHandler;

impl LongChatHandler {
    async fn handle(&self, ctx: &HandlerContext<'_>, message: &str) -> Option<String> {
        let ending = message.trim() == END_PHRASE
            || Analyzer::new(ctx.policy).wants_to_end(message).await;
        if ending {
            tracing::info!("User {} ended the long chat", ctx.user);
            ctx.state.clear_conversation(ctx.user).await;
            ctx.state.set_state(ctx.user, EngagementState::Idle).await;
            return Some("好吧".to_string());
        }

        let history = ctx.state.conversation(ctx.user).await;
        converse(ctx, history, message).await
    }
}

/// One completion turn. On success the stored conversation is replaced with
/// the extended one; on failure nothing changes.
async fn converse(
    ctx: &HandlerContext<'_>,
    mut conversation: Vec<ChatEntry>,
    message: &str,
) -> Option<String> {
    if conversation.is_empty() {
        let mut system = ctx.system_prompt.to_string();
        if let Some(memory) = ctx.memory {
            system.push_str("\n\n");
            system.push_str(&memory.emotional_context(ctx.user).await);
        }
        conversation.push(ChatEntry::system(system));
    }
    conversation.push(ChatEntry::user(message));

    match ctx.policy.complete(conversation).await {
        Ok(done) => {
            let reply = clean_think_tags(&done.reply);
            let mut updated = done.conversation;
            if let Some(last) = updated.last_mut() {
                last.content = reply.clone();
            }
            ctx.state.set_conversation(ctx.user, updated).await;
            Some(reply)
        }
        Err(e) => {
            tracing::error!("Long chat turn for user {} failed: {}", ctx.user, e);
            None
        }
    }
}
