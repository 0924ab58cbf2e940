//! Emotional memory: a per-user log of classified exchanges and the
//! conversation pattern derived from it.

use crate::snapshot::{KvStore, Snapshot, SnapshotWriter};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use yume_core::UserId;

pub const EMOTIONAL_KEY: &str = "emotional_memory";

/// Interactions kept per user.
const MAX_INTERACTIONS: usize = 100;

/// Window used to decide the conversation pattern.
const PATTERN_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub timestamp: DateTime<Utc>,
    pub user_msg: String,
    pub bot_reply: String,
    pub emotion: String,
    pub intention: String,
    /// What was being talked about just before this exchange.
    pub context: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Preferences {
    #[serde(default)]
    emotion_count: BTreeMap<String, u32>,
    #[serde(default)]
    intention_count: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserMemory {
    #[serde(default)]
    interactions: Vec<Interaction>,
    #[serde(default)]
    preferences: Preferences,
    last_seen: DateTime<Utc>,
}

impl UserMemory {
    fn new() -> Self {
        Self {
            interactions: Vec::new(),
            preferences: Preferences::default(),
            last_seen: Utc::now(),
        }
    }

    fn context_hint(&self) -> String {
        match self.interactions.last() {
            None => "初次对话".to_string(),
            Some(last) => {
                let head: String = last.user_msg.chars().take(20).collect();
                format!("上次聊到: {}", head)
            }
        }
    }

    fn recent_emotions(&self, count: usize) -> Vec<String> {
        let start = self.interactions.len().saturating_sub(count);
        self.interactions[start..]
            .iter()
            .filter(|i| !i.emotion.is_empty())
            .map(|i| i.emotion.clone())
            .collect()
    }

    fn dominant_emotion(&self) -> Option<&str> {
        let start = self.interactions.len().saturating_sub(PATTERN_WINDOW);
        // Newest first so ties go to the most recently seen emotion.
        let mut tally: Vec<(&str, usize)> = Vec::new();
        for interaction in self.interactions[start..].iter().rev() {
            let emotion = interaction.emotion.as_str();
            if emotion.is_empty() {
                continue;
            }
            match tally.iter_mut().find(|(e, _)| *e == emotion) {
                Some((_, n)) => *n += 1,
                None => tally.push((emotion, 1)),
            }
        }
        let mut best: Option<(&str, usize)> = None;
        for (emotion, n) in tally {
            if best.map_or(true, |(_, m)| n > m) {
                best = Some((emotion, n));
            }
        }
        best.map(|(e, _)| e)
    }
}

/// Coarse read of how a user has been feeling lately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationPattern {
    NewUser,
    NeedsCare,
    Upbeat,
    Volatile,
    Steady,
}

impl ConversationPattern {
    pub fn label(&self) -> &'static str {
        match self {
            ConversationPattern::NewUser => "新用户",
            ConversationPattern::NeedsCare => "需要关怀",
            ConversationPattern::Upbeat => "积极活跃",
            ConversationPattern::Volatile => "情绪波动",
            ConversationPattern::Steady => "平稳交流",
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            ConversationPattern::NeedsCare => {
                "用户当前情感状态：需要关怀和安慰，请用温暖、体贴的语气回复，多表达理解和支持。"
            }
            ConversationPattern::Upbeat => {
                "用户当前情感状态：积极活跃，请用轻松、愉快的语气回复，可以适当幽默和活泼。"
            }
            ConversationPattern::Volatile => {
                "用户当前情感状态：情绪不太稳定，请用平和、耐心的语气回复，避免过于激烈的表达。"
            }
            ConversationPattern::NewUser => {
                "用户情感状态：新用户，请用友善、欢迎的语气回复，帮助用户熟悉对话。"
            }
            ConversationPattern::Steady => "用户情感状态：平稳交流，请保持自然、友好的对话风格。",
        }
    }
}

impl fmt::Display for ConversationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

type Memories = HashMap<UserId, UserMemory>;

struct MemoriesSnapshot {
    inner: Arc<RwLock<Memories>>,
}

#[async_trait]
impl Snapshot for MemoriesSnapshot {
    async fn render(&self) -> Result<Vec<u8>> {
        let memories = self.inner.read().await;
        Ok(serde_json::to_vec_pretty(&*memories)?)
    }
}

pub struct EmotionalMemory {
    inner: Arc<RwLock<Memories>>,
    snapshots: Option<SnapshotWriter>,
}

impl Default for EmotionalMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl EmotionalMemory {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            snapshots: None,
        }
    }

    /// Load from `store` and keep persisting to it.
    pub async fn restore(store: Arc<dyn KvStore>) -> Self {
        let memories: Memories = match store.get(EMOTIONAL_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("Emotional memory snapshot is corrupt, starting empty: {}", e);
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!("Failed to load emotional memory: {:#}", e);
                HashMap::new()
            }
        };
        let inner = Arc::new(RwLock::new(memories));
        let writer = SnapshotWriter::spawn(
            EMOTIONAL_KEY,
            store,
            Arc::new(MemoriesSnapshot {
                inner: Arc::clone(&inner),
            }),
        );
        Self {
            inner,
            snapshots: Some(writer),
        }
    }

    /// Log one classified exchange. Skipped when either label is empty.
    pub async fn record(
        &self,
        user: UserId,
        user_msg: &str,
        bot_reply: &str,
        emotion: &str,
        intention: &str,
    ) {
        if emotion.is_empty() || intention.is_empty() {
            tracing::warn!(
                "Skipping interaction with empty labels: emotion={:?} intention={:?}",
                emotion,
                intention
            );
            return;
        }

        {
            let mut memories = self.inner.write().await;
            let memory = memories.entry(user).or_insert_with(UserMemory::new);
            let interaction = Interaction {
                timestamp: Utc::now(),
                user_msg: user_msg.to_string(),
                bot_reply: bot_reply.to_string(),
                emotion: emotion.to_string(),
                intention: intention.to_string(),
                context: memory.context_hint(),
            };
            memory.interactions.push(interaction);
            if memory.interactions.len() > MAX_INTERACTIONS {
                let excess = memory.interactions.len() - MAX_INTERACTIONS;
                memory.interactions.drain(..excess);
            }
            memory.last_seen = Utc::now();
            *memory
                .preferences
                .emotion_count
                .entry(emotion.to_string())
                .or_insert(0) += 1;
            *memory
                .preferences
                .intention_count
                .entry(intention.to_string())
                .or_insert(0) += 1;
        }

        if let Some(writer) = &self.snapshots {
            writer.request();
        }
    }

    pub async fn interactions(&self, user: UserId) -> Vec<Interaction> {
        let memories = self.inner.read().await;
        memories
            .get(&user)
            .map(|m| m.interactions.clone())
            .unwrap_or_default()
    }

    /// Emotions of the last `count` interactions, oldest first.
    pub async fn recent_emotions(&self, user: UserId, count: usize) -> Vec<String> {
        let memories = self.inner.read().await;
        memories
            .get(&user)
            .map(|m| m.recent_emotions(count))
            .unwrap_or_default()
    }

    pub async fn conversation_pattern(&self, user: UserId) -> ConversationPattern {
        let memories = self.inner.read().await;
        let Some(memory) = memories.get(&user) else {
            return ConversationPattern::NewUser;
        };
        if memory.interactions.is_empty() {
            return ConversationPattern::NewUser;
        }
        match memory.dominant_emotion() {
            Some("难过") => ConversationPattern::NeedsCare,
            Some("开心") => ConversationPattern::Upbeat,
            Some("生气") => ConversationPattern::Volatile,
            _ => ConversationPattern::Steady,
        }
    }

    /// Prompt block describing the user's recent mood, appended to the
    /// long-chat system prompt.
    pub async fn emotional_context(&self, user: UserId) -> String {
        let pattern = self.conversation_pattern(user).await;
        let recent = self.recent_emotions(user, 5).await;
        build_context(pattern, &recent)
    }

    /// Canned comfort line based on history, if one fits.
    pub async fn suggest_response(&self, user: UserId, emotion: &str) -> Option<&'static str> {
        let pattern = self.conversation_pattern(user).await;
        match pattern {
            ConversationPattern::NeedsCare if emotion == "难过" => Some("我一直都在这里陪着你"),
            ConversationPattern::NeedsCare => Some("看起来你心情好一些了"),
            ConversationPattern::Upbeat if emotion == "开心" => Some("哈哈，你的好心情也感染到我了"),
            ConversationPattern::Upbeat => Some("怎么了，遇到什么事了吗"),
            ConversationPattern::Volatile => Some("我们慢慢聊，不着急"),
            ConversationPattern::NewUser | ConversationPattern::Steady => {
                let recent = self.recent_emotions(user, 5).await;
                match recent.as_slice() {
                    [.., prev, last] if prev != last => Some("感觉你的心情有些变化"),
                    _ => None,
                }
            }
        }
    }

    pub async fn flush(&self) -> Result<()> {
        match &self.snapshots {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }
}

fn build_context(pattern: ConversationPattern, recent: &[String]) -> String {
    let mut context = String::from("【用户情感档案】\n");
    context.push_str(pattern.guidance());
    context.push('\n');

    if !recent.is_empty() {
        context.push_str("最近情感趋势：");
        context.push_str(&recent.join(" → "));
        context.push('\n');
        if let [.., prev, last] = recent {
            if prev != last {
                context.push_str(&format!(
                    "注意：用户情感刚刚从「{}」变为「{}」，请关注这个变化。\n",
                    prev, last
                ));
            }
        }
    }

    context.push_str("\n请根据以上情感档案调整你的回复风格和内容，让对话更贴近用户的情感需求。");
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: UserId = 42;

    #[tokio::test]
    async fn test_empty_labels_are_skipped() {
        let mem = EmotionalMemory::new();
        mem.record(USER, "hi", "hi", "", "想和对方聊天").await;
        mem.record(USER, "hi", "hi", "开心", "").await;
        assert!(mem.interactions(USER).await.is_empty());
        assert_eq!(mem.conversation_pattern(USER).await, ConversationPattern::NewUser);
    }

    #[tokio::test]
    async fn test_log_is_capped() {
        let mem = EmotionalMemory::new();
        for i in 0..(MAX_INTERACTIONS + 5) {
            mem.record(USER, &format!("m{}", i), "", "中性", "想和对方聊天")
                .await;
        }
        let log = mem.interactions(USER).await;
        assert_eq!(log.len(), MAX_INTERACTIONS);
        assert_eq!(log[0].user_msg, "m5");
    }

    #[tokio::test]
    async fn test_context_hint_truncates_by_chars() {
        let mem = EmotionalMemory::new();
        let long = "今天天气真好我们一起去公园散步吧然后再去吃饭看电影";
        mem.record(USER, long, "", "开心", "想和对方聊天").await;
        mem.record(USER, "嗯", "", "开心", "想和对方聊天").await;
        let log = mem.interactions(USER).await;
        assert_eq!(log[0].context, "初次对话");
        let expected: String = long.chars().take(20).collect();
        assert_eq!(log[1].context, format!("上次聊到: {}", expected));
    }

    #[tokio::test]
    async fn test_pattern_uses_recent_window() {
        let mem = EmotionalMemory::new();
        for _ in 0..20 {
            mem.record(USER, "", "", "开心", "想和对方聊天").await;
        }
        for _ in 0..6 {
            mem.record(USER, "", "", "难过", "想和对方倾诉").await;
        }
        assert_eq!(mem.conversation_pattern(USER).await, ConversationPattern::NeedsCare);
    }

    #[tokio::test]
    async fn test_pattern_tie_prefers_latest() {
        let mem = EmotionalMemory::new();
        mem.record(USER, "", "", "难过", "x").await;
        mem.record(USER, "", "", "生气", "x").await;
        assert_eq!(mem.conversation_pattern(USER).await, ConversationPattern::Volatile);
    }

    #[tokio::test]
    async fn test_context_reports_shift() {
        let mem = EmotionalMemory::new();
        mem.record(USER, "", "", "中性", "x").await;
        mem.record(USER, "", "", "开心", "x").await;
        let ctx = mem.emotional_context(USER).await;
        assert!(ctx.starts_with("【用户情感档案】\n"));
        assert!(ctx.contains("最近情感趋势：中性 → 开心"));
        assert!(ctx.contains("从「中性」变为「开心」"));
        // One each; 开心 is the latest, so the pattern reads upbeat.
        assert_eq!(
            mem.suggest_response(USER, "开心").await,
            Some("哈哈，你的好心情也感染到我了")
        );
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store: Arc<dyn KvStore> = Arc::new(crate::MemoryStore::new());
        let mem = EmotionalMemory::restore(Arc::clone(&store)).await;
        mem.record(USER, "你好", "你好", "开心", "想和对方聊天").await;
        mem.flush().await.unwrap();

        let again = EmotionalMemory::restore(store).await;
        assert_eq!(again.interactions(USER).await.len(), 1);
        assert_eq!(again.recent_emotions(USER, 5).await, vec!["开心"]);
    }

    #[tokio::test]
    async fn test_new_user_context() {
        let mem = EmotionalMemory::new();
        let ctx = mem.emotional_context(USER).await;
        assert!(ctx.contains("新用户"));
        assert!(!ctx.contains("最近情感趋势"));
    }
}
