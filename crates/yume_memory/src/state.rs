//! Conversation State Machine.
//!
//! One reader/writer lock guards engagement state, flags, counters and
//! conversation history for every user, so a reader never observes a state
//! change without the flags that went with it. Every mutation asks the
//! snapshot writer for a save and returns without waiting for it.

use crate::snapshot::{KvStore, Snapshot, SnapshotWriter};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use yume_core::{ChatEntry, EngagementState, UserId};

/// Snapshot key for the state registry.
pub const STATE_KEY: &str = "conversation_state";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    #[serde(default)]
    state: EngagementState,
    #[serde(default)]
    flags: HashMap<String, bool>,
    #[serde(default)]
    counters: HashMap<String, i64>,
    #[serde(default)]
    conversation: Vec<ChatEntry>,
    /// Monotonic, so never persisted. A restored user counts from start-up.
    #[serde(skip)]
    last_reply: Option<Instant>,
    #[serde(default = "Utc::now")]
    last_updated: DateTime<Utc>,
}

impl Default for UserRecord {
    fn default() -> Self {
        Self {
            state: EngagementState::Idle,
            flags: HashMap::new(),
            counters: HashMap::new(),
            conversation: Vec::new(),
            last_reply: None,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    users: HashMap<UserId, UserRecord>,
}

struct RegistrySnapshot {
    inner: Arc<RwLock<Registry>>,
}

#[async_trait]
impl Snapshot for RegistrySnapshot {
    async fn render(&self) -> Result<Vec<u8>> {
        let registry = self.inner.read().await;
        Ok(serde_json::to_vec_pretty(&*registry)?)
    }
}

/// Point-in-time view of one user, for the status monitor.
#[derive(Debug, Clone)]
pub struct UserStatus {
    pub state: EngagementState,
    pub flags: HashMap<String, bool>,
    pub counters: HashMap<String, i64>,
    pub conversation_len: usize,
    pub since_last_reply: Duration,
    pub last_updated: DateTime<Utc>,
}

/// Single source of truth for per-user engagement and history.
pub struct StateMachine {
    inner: Arc<RwLock<Registry>>,
    history_cap: usize,
    started: Instant,
    snapshots: Option<SnapshotWriter>,
}

impl StateMachine {
    /// In-memory only. Nothing is persisted.
    pub fn new(history_cap: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry::default())),
            history_cap: history_cap.max(1),
            started: Instant::now(),
            snapshots: None,
        }
    }

    /// Reload the last snapshot from `store` and persist to it from now on.
    ///
    /// A missing or unreadable snapshot is logged and the machine starts
    /// empty.
    pub async fn restore(store: Arc<dyn KvStore>, history_cap: usize) -> Self {
        let registry = match store.get(STATE_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Registry>(&bytes) {
                Ok(r) => {
                    tracing::info!("Restored conversation state for {} user(s)", r.users.len());
                    r
                }
                Err(e) => {
                    tracing::warn!("Conversation state snapshot is corrupt, starting empty: {}", e);
                    Registry::default()
                }
            },
            Ok(None) => Registry::default(),
            Err(e) => {
                tracing::warn!("Failed to load conversation state, starting empty: {:#}", e);
                Registry::default()
            }
        };

        let inner = Arc::new(RwLock::new(registry));
        let source = Arc::new(RegistrySnapshot {
            inner: Arc::clone(&inner),
        });
        let writer = SnapshotWriter::spawn(STATE_KEY, store, source);

        Self {
            inner,
            history_cap: history_cap.max(1),
            started: Instant::now(),
            snapshots: Some(writer),
        }
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    fn persist(&self) {
        if let Some(writer) = &self.snapshots {
            writer.request();
        }
    }

    /// Run `f` against the user's record under the write lock, then
    /// schedule a snapshot.
    async fn mutate<T>(&self, user: UserId, f: impl FnOnce(&mut UserRecord) -> T) -> T {
        let out = {
            let mut registry = self.inner.write().await;
            let record = registry.users.entry(user).or_default();
            let out = f(record);
            record.last_updated = Utc::now();
            out
        };
        self.persist();
        out
    }

    async fn read<T>(&self, user: UserId, f: impl FnOnce(Option<&UserRecord>) -> T) -> T {
        let registry = self.inner.read().await;
        f(registry.users.get(&user))
    }

    // ========================================================================
    // Engagement state
    // ========================================================================

    pub async fn state(&self, user: UserId) -> EngagementState {
        self.read(user, |r| r.map(|r| r.state).unwrap_or_default())
            .await
    }

    pub async fn set_state(&self, user: UserId, state: EngagementState) {
        let previous = self
            .mutate(user, |r| std::mem::replace(&mut r.state, state))
            .await;
        if previous != state {
            tracing::info!("User {} state {} -> {}", user, previous, state);
        }
    }

    /// Move to `next` only if the user is still in `expected`.
    pub async fn transition(
        &self,
        user: UserId,
        expected: EngagementState,
        next: EngagementState,
    ) -> bool {
        let moved = self
            .mutate(user, |r| {
                if r.state == expected {
                    r.state = next;
                    true
                } else {
                    false
                }
            })
            .await;
        if moved && expected != next {
            tracing::info!("User {} state {} -> {}", user, expected, next);
        }
        moved
    }

    // ========================================================================
    // Flags & counters
    // ========================================================================

    pub async fn flag(&self, user: UserId, name: &str) -> bool {
        self.read(user, |r| {
            r.and_then(|r| r.flags.get(name).copied())
                .unwrap_or(false)
        })
        .await
    }

    pub async fn set_flag(&self, user: UserId, name: &str, value: bool) {
        self.mutate(user, |r| {
            r.flags.insert(name.to_string(), value);
        })
        .await;
    }

    pub async fn clear_flag(&self, user: UserId, name: &str) {
        self.mutate(user, |r| {
            r.flags.remove(name);
        })
        .await;
    }

    pub async fn counter(&self, user: UserId, name: &str) -> i64 {
        self.read(user, |r| r.and_then(|r| r.counters.get(name).copied()).unwrap_or(0))
            .await
    }

    /// Returns the new value.
    pub async fn increment_counter(&self, user: UserId, name: &str) -> i64 {
        self.mutate(user, |r| {
            let slot = r.counters.entry(name.to_string()).or_insert(0);
            *slot += 1;
            *slot
        })
        .await
    }

    pub async fn reset_counter(&self, user: UserId, name: &str) {
        self.mutate(user, |r| {
            r.counters.insert(name.to_string(), 0);
        })
        .await;
    }

    pub async fn set_counter(&self, user: UserId, name: &str, value: i64) {
        self.mutate(user, |r| {
            r.counters.insert(name.to_string(), value);
        })
        .await;
    }

    // ========================================================================
    // Conversation history
    // ========================================================================

    /// Copy of the user's history. Safe to modify and hand back through
    /// [`StateMachine::set_conversation`].
    pub async fn conversation(&self, user: UserId) -> Vec<ChatEntry> {
        self.read(user, |r| r.map(|r| r.conversation.clone()).unwrap_or_default())
            .await
    }

    /// Replace the history wholesale. Not truncated.
    pub async fn set_conversation(&self, user: UserId, conversation: Vec<ChatEntry>) {
        self.mutate(user, |r| r.conversation = conversation).await;
    }

    /// Append one entry, evicting the oldest entries beyond the cap.
    pub async fn append(&self, user: UserId, entry: ChatEntry) {
        let cap = self.history_cap;
        self.mutate(user, |r| {
            r.conversation.push(entry);
            if r.conversation.len() > cap {
                let excess = r.conversation.len() - cap;
                r.conversation.drain(..excess);
            }
        })
        .await;
    }

    pub async fn clear_conversation(&self, user: UserId) {
        self.mutate(user, |r| r.conversation.clear()).await;
    }

    // ========================================================================
    // Reply bookkeeping
    // ========================================================================

    /// Record that the user just sent something.
    pub async fn touch_last_reply(&self, user: UserId) {
        let now = Instant::now();
        self.mutate(user, |r| r.last_reply = Some(now)).await;
    }

    /// Time since the user last spoke. Counts from start-up if never.
    pub async fn since_last_reply(&self, user: UserId) -> Duration {
        let started = self.started;
        self.read(user, |r| {
            r.and_then(|r| r.last_reply)
                .unwrap_or(started)
                .elapsed()
        })
        .await
    }

    pub async fn status(&self, user: UserId) -> UserStatus {
        let started = self.started;
        self.read(user, |r| match r {
            Some(r) => UserStatus {
                state: r.state,
                flags: r.flags.clone(),
                counters: r.counters.clone(),
                conversation_len: r.conversation.len(),
                since_last_reply: r.last_reply.unwrap_or(started).elapsed(),
                last_updated: r.last_updated,
            },
            None => UserStatus {
                state: EngagementState::Idle,
                flags: HashMap::new(),
                counters: HashMap::new(),
                conversation_len: 0,
                since_last_reply: started.elapsed(),
                last_updated: Utc::now(),
            },
        })
        .await
    }

    /// Drop everything known about the user.
    pub async fn reset(&self, user: UserId) {
        {
            let mut registry = self.inner.write().await;
            registry.users.remove(&user);
        }
        self.persist();
    }

    /// Write a snapshot now. Used at shutdown.
    pub async fn flush(&self) -> Result<()> {
        match &self.snapshots {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: UserId = 10001;

    #[tokio::test]
    async fn test_unknown_user_defaults() {
        let sm = StateMachine::new(100);
        assert_eq!(sm.state(USER).await, EngagementState::Idle);
        assert!(!sm.flag(USER, "replied").await);
        assert_eq!(sm.counter(USER, "pings").await, 0);
        assert!(sm.conversation(USER).await.is_empty());
    }

    #[tokio::test]
    async fn test_set_state_twice_leaves_rest_untouched() {
        let sm = StateMachine::new(100);
        sm.set_flag(USER, "replied", true).await;
        sm.set_counter(USER, "pings", 4).await;
        sm.append(USER, ChatEntry::user("在吗")).await;

        sm.set_state(USER, EngagementState::Busy).await;
        sm.set_state(USER, EngagementState::Busy).await;

        assert_eq!(sm.state(USER).await, EngagementState::Busy);
        assert!(sm.flag(USER, "replied").await);
        assert_eq!(sm.counter(USER, "pings").await, 4);
        assert_eq!(sm.conversation(USER).await, vec![ChatEntry::user("在吗")]);
    }

    #[tokio::test]
    async fn test_transition_only_from_expected() {
        let sm = StateMachine::new(10);
        sm.set_state(1, EngagementState::Busy).await;
        assert!(!sm.transition(1, EngagementState::LongChat, EngagementState::Idle).await);
        assert_eq!(sm.state(1).await, EngagementState::Busy);
        assert!(sm.transition(1, EngagementState::Busy, EngagementState::Idle).await);
        assert_eq!(sm.state(1).await, EngagementState::Idle);
    }

    #[tokio::test]
    async fn test_counters() {
        let sm = StateMachine::new(100);
        assert_eq!(sm.increment_counter(USER, "n").await, 1);
        assert_eq!(sm.increment_counter(USER, "n").await, 2);
        sm.reset_counter(USER, "n").await;
        assert_eq!(sm.counter(USER, "n").await, 0);
        sm.clear_flag(USER, "missing").await;
        assert!(!sm.flag(USER, "missing").await);
    }

    #[tokio::test]
    async fn test_history_cap_evicts_oldest() {
        let sm = StateMachine::new(3);
        for i in 0..5 {
            sm.append(USER, ChatEntry::user(i.to_string())).await;
        }
        let history: Vec<String> = sm
            .conversation(USER)
            .await
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(history, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_set_conversation_is_not_truncated() {
        let sm = StateMachine::new(2);
        let long: Vec<ChatEntry> = (0..5).map(|i| ChatEntry::user(i.to_string())).collect();
        sm.set_conversation(USER, long.clone()).await;
        assert_eq!(sm.conversation(USER).await, long);
    }

    #[tokio::test]
    async fn test_conversation_is_a_copy() {
        let sm = StateMachine::new(100);
        sm.append(USER, ChatEntry::user("a")).await;
        let mut copy = sm.conversation(USER).await;
        copy.push(ChatEntry::assistant("b"));
        assert_eq!(sm.conversation(USER).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_since_last_reply() {
        let sm = StateMachine::new(100);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(sm.since_last_reply(USER).await >= Duration::from_secs(30));

        sm.touch_last_reply(USER).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(sm.since_last_reply(USER).await, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_reset_forgets_user() {
        let sm = StateMachine::new(100);
        sm.set_state(USER, EngagementState::LongChat).await;
        sm.reset(USER).await;
        assert_eq!(sm.state(USER).await, EngagementState::Idle);
        assert_eq!(sm.status(USER).await.conversation_len, 0);
    }
}
