//! Adaptive scheduler for proactive messages.
//!
//! The silence between two proactive messages depends on the hour of day.
//! When it runs out the scheduler checks that the user is not in the middle
//! of a long chat or recently said they were busy, then picks a message
//! category by weight, nudged by the hour and by how long it has been since
//! the last proactive message.

use arc_swap::ArcSwap;
use chrono::{Local, Timelike};
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use yume_core::config::MessageWeights;
use yume_core::{EngagementState, Expression, SchedulerConfig, UserId};
use yume_memory::StateMachine;

/// Sent when the chosen category has nothing in it.
pub const FALLBACK_MESSAGE: &str = "在干嘛";

/// Without a proactive send for this long, greetings become more likely.
const QUIET_THRESHOLD: Duration = Duration::from_secs(2 * 60 * 60);

// ============================================================================
// Message pool
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Casual,
    Emotional,
    Question,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Casual, Category::Emotional, Category::Question];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Casual => "casual",
            Category::Emotional => "emotional",
            Category::Question => "question",
        }
    }

    fn weight(&self, weights: &MessageWeights) -> u32 {
        match self {
            Category::Casual => weights.casual,
            Category::Emotional => weights.emotional,
            Category::Question => weights.question,
        }
    }
}

/// Candidate texts per category. Never persisted.
#[derive(Debug, Clone)]
pub struct MessagePool {
    casual: Vec<String>,
    emotional: Vec<String>,
    question: Vec<String>,
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::empty()
            .with(
                Category::Casual,
                ["在干嘛呢", "最近怎么样", "今天过得好吗", "有什么新鲜事吗", "忙什么呢"],
            )
            .with(
                Category::Emotional,
                ["想你了", "有点想聊天", "鼓励我一下", "感觉有点无聊", "今天心情不错"],
            )
            .with(Category::Question, ["在吗", "睡了吗", "吃饭了吗", "休息了吗"])
    }
}

impl MessagePool {
    pub fn empty() -> Self {
        Self {
            casual: Vec::new(),
            emotional: Vec::new(),
            question: Vec::new(),
        }
    }

    /// Replace the texts of one category.
    pub fn with<I, S>(mut self, category: Category, messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let messages = messages.into_iter().map(Into::into).collect();
        match category {
            Category::Casual => self.casual = messages,
            Category::Emotional => self.emotional = messages,
            Category::Question => self.question = messages,
        }
        self
    }

    pub fn messages(&self, category: Category) -> &[String] {
        match category {
            Category::Casual => &self.casual,
            Category::Emotional => &self.emotional,
            Category::Question => &self.question,
        }
    }

    fn pick<R: Rng + ?Sized>(&self, category: Category, rng: &mut R) -> String {
        let pool = self.messages(category);
        if pool.is_empty() {
            return FALLBACK_MESSAGE.to_string();
        }
        pool[rng.gen_range(0..pool.len())].clone()
    }
}

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// A long conversation is going on.
    LongChat,
    /// The user said they were busy and the cooldown has not run out.
    RecentlyBusy,
    /// The state moved between the check and the send.
    StateChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Send,
    Suppressed(SuppressReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Sent(String),
    Suppressed(SuppressReason),
    /// The send failed; the error text is kept for logging.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HourBucket {
    Active,
    Sleep,
    Normal,
}

fn bucket(config: &SchedulerConfig, hour: u32) -> HourBucket {
    if config.active_hours.contains(&hour) {
        HourBucket::Active
    } else if config.sleep_hours.contains(&hour) {
        HourBucket::Sleep
    } else {
        HourBucket::Normal
    }
}

/// Base interval drawn from the hour's bucket, then jittered by
/// `random_factor` (clamped to `[0, 1]`) around that base.
fn interval_for<R: Rng + ?Sized>(config: &SchedulerConfig, hour: u32, rng: &mut R) -> Duration {
    const MINUTE: u64 = 60;
    let (low, high) = match bucket(config, hour) {
        HourBucket::Active => (30 * MINUTE, 60 * MINUTE),
        HourBucket::Sleep => (2 * 60 * MINUTE, 4 * 60 * MINUTE),
        HourBucket::Normal => {
            let base = config
                .base_interval_mins
                .clamp(1, SchedulerConfig::MAX_MINUTES)
                * MINUTE;
            (base, 2 * base)
        }
    };
    let base = rng.gen_range(low..high) as f64;
    let factor = config.random_factor.clamp(0.0, 1.0);
    let jittered = base + base * factor * (rng.gen::<f64>() - 0.5);
    Duration::from_secs_f64(jittered)
}

fn adjust_weights(
    mut weights: MessageWeights,
    hour: u32,
    since_last_sent: Duration,
) -> MessageWeights {
    // late evening and night
    if hour >= 20 || hour <= 2 {
        weights.emotional = weights.emotional.saturating_add(20);
        weights.casual = weights.casual.saturating_sub(10);
    }
    // morning
    if (7..=10).contains(&hour) {
        weights.question = weights.question.saturating_add(15);
        weights.casual = weights.casual.saturating_sub(10);
    }
    if since_last_sent > QUIET_THRESHOLD {
        weights.question = weights.question.saturating_add(10);
    }
    weights
}

/// Cumulative-sum draw. Falls back to casual when every weight is zero.
fn weighted_select<R: Rng + ?Sized>(weights: &MessageWeights, rng: &mut R) -> Category {
    let total: u64 = Category::ALL
        .iter()
        .map(|c| u64::from(c.weight(weights)))
        .sum();
    if total == 0 {
        return Category::Casual;
    }
    let draw = rng.gen_range(0..total);
    let mut cumulative = 0u64;
    for category in Category::ALL {
        cumulative += u64::from(category.weight(weights));
        if draw < cumulative {
            return category;
        }
    }
    Category::Casual
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct NaturalScheduler {
    config: ArcSwap<SchedulerConfig>,
    pool: MessagePool,
    state: Arc<StateMachine>,
    target: UserId,
    last_sent: Mutex<Instant>,
}

impl NaturalScheduler {
    pub fn new(config: SchedulerConfig, state: Arc<StateMachine>, target: UserId) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            pool: MessagePool::default(),
            state,
            target,
            last_sent: Mutex::new(Instant::now()),
        }
    }

    pub fn with_pool(mut self, pool: MessagePool) -> Self {
        self.pool = pool;
        self
    }

    pub fn target(&self) -> UserId {
        self.target
    }

    /// Swap in new settings. Takes effect from the next interval.
    pub fn reconfigure(&self, config: SchedulerConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn since_last_sent(&self) -> Duration {
        match self.last_sent.lock() {
            Ok(last) => last.elapsed(),
            Err(poisoned) => poisoned.into_inner().elapsed(),
        }
    }

    fn mark_sent(&self) {
        let now = Instant::now();
        match self.last_sent.lock() {
            Ok(mut last) => *last = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    // ========================================================================
    // Interval
    // ========================================================================

    pub fn interval_for_hour<R: Rng + ?Sized>(&self, hour: u32, rng: &mut R) -> Duration {
        interval_for(&self.config.load(), hour, rng)
    }

    /// Silence before the next proactive check, from the local hour.
    pub fn next_interval(&self) -> Duration {
        self.interval_for_hour(Local::now().hour(), &mut rand::thread_rng())
    }

    // ========================================================================
    // Suppression
    // ========================================================================

    /// Whether a proactive message may go out now.
    ///
    /// A `Busy` user whose cooldown has run out is moved back to `Idle`.
    pub async fn should_send(&self) -> SendDecision {
        match self.admit().await {
            Ok(_) => SendDecision::Send,
            Err(reason) => SendDecision::Suppressed(reason),
        }
    }

    /// Like [`should_send`](Self::should_send), but hands back the state the
    /// decision was made in.
    async fn admit(&self) -> Result<EngagementState, SuppressReason> {
        match self.state.state(self.target).await {
            EngagementState::LongChat => Err(SuppressReason::LongChat),
            EngagementState::Busy => {
                let cooldown = self.config.load().busy_cooldown();
                if self.state.since_last_reply(self.target).await < cooldown {
                    return Err(SuppressReason::RecentlyBusy);
                }
                let cleared = self
                    .state
                    .transition(self.target, EngagementState::Busy, EngagementState::Idle)
                    .await;
                if cleared {
                    Ok(EngagementState::Idle)
                } else {
                    Err(SuppressReason::StateChanged)
                }
            }
            other => Ok(other),
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn weights_for(&self, hour: u32, since_last_sent: Duration) -> MessageWeights {
        adjust_weights(self.config.load().weights, hour, since_last_sent)
    }

    /// Category and text for the given hour and quiet time.
    pub fn pick<R: Rng + ?Sized>(
        &self,
        hour: u32,
        since_last_sent: Duration,
        rng: &mut R,
    ) -> (Category, String) {
        let weights = self.weights_for(hour, since_last_sent);
        let category = weighted_select(&weights, rng);
        (category, self.pool.pick(category, rng))
    }

    /// State a proactive text moves the user into, if it is a probe.
    fn probe_state(&self, message: &str) -> Option<EngagementState> {
        let config = self.config.load();
        if config.mood_probes.iter().any(|p| p == message) {
            Some(EngagementState::NeedComfort)
        } else if config.encourage_probes.iter().any(|p| p == message) {
            Some(EngagementState::NeedEncourage)
        } else {
            None
        }
    }

    /// Choose the next proactive text, given the state `seen` when the send
    /// was admitted.
    ///
    /// A probe moves the user to `NeedComfort` or `NeedEncourage`. Returns
    /// `None` when the state is no longer `seen`, leaving it untouched.
    pub async fn select_message(&self, seen: EngagementState) -> Option<String> {
        let (category, message) = {
            let mut rng = rand::thread_rng();
            self.pick(Local::now().hour(), self.since_last_sent(), &mut rng)
        };
        tracing::debug!("Selected {} message: {}", category.as_str(), message);

        let unchanged = match self.probe_state(&message) {
            Some(next) => self.state.transition(self.target, seen, next).await,
            None => self.state.state(self.target).await == seen,
        };
        unchanged.then_some(message)
    }

    // ========================================================================
    // Loop
    // ========================================================================

    /// One firing: check suppression, pick, send. Never fails.
    pub async fn tick(&self, sink: &dyn Expression) -> TickOutcome {
        let selected = match self.admit().await {
            Ok(seen) => self.select_message(seen).await.ok_or(SuppressReason::StateChanged),
            Err(reason) => Err(reason),
        };
        let message = match selected {
            Ok(message) => message,
            Err(reason) => {
                tracing::info!("Proactive message suppressed: {:?}", reason);
                return TickOutcome::Suppressed(reason);
            }
        };
        self.mark_sent();
        match sink.speak(self.target, &message).await {
            Ok(()) => {
                tracing::info!("Proactive message sent: {}", message);
                TickOutcome::Sent(message)
            }
            Err(e) => {
                tracing::error!("Proactive message failed: {:#}", e);
                TickOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    /// Sleep, tick, repeat until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, sink: Arc<dyn Expression>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Natural scheduler started for {}", self.target);
        loop {
            let wait = self.next_interval();
            tracing::info!("Next proactive check in {} min", wait.as_secs() / 60);

            tokio::select! {
                biased;
                _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => break,
                _ = tokio::time::sleep(wait) => {
                    self.tick(sink.as_ref()).await;
                }
            }
        }
        tracing::info!("Natural scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    const TARGET: UserId = 10086;
    const MIN: u64 = 60;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Expression for Recorder {
        async fn speak(&self, _user_id: UserId, message: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("connection closed");
            }
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn scheduler(config: SchedulerConfig) -> (NaturalScheduler, Arc<StateMachine>) {
        let state = Arc::new(StateMachine::new(100));
        (NaturalScheduler::new(config, Arc::clone(&state), TARGET), state)
    }

    fn no_jitter() -> SchedulerConfig {
        SchedulerConfig {
            random_factor: 0.0,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_hour_buckets() {
        let config = SchedulerConfig::default();
        assert_eq!(bucket(&config, 9), HourBucket::Active);
        assert_eq!(bucket(&config, 3), HourBucket::Sleep);
        assert_eq!(bucket(&config, 12), HourBucket::Normal);
        assert_eq!(bucket(&config, 18), HourBucket::Normal);
    }

    #[test]
    fn test_interval_ranges_without_jitter() {
        let config = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let active = interval_for(&config, 10, &mut rng).as_secs();
            assert!((30 * MIN..60 * MIN).contains(&active), "{}", active);
            let sleep = interval_for(&config, 1, &mut rng).as_secs();
            assert!((120 * MIN..240 * MIN).contains(&sleep), "{}", sleep);
            let normal = interval_for(&config, 13, &mut rng).as_secs();
            assert!((45 * MIN..90 * MIN).contains(&normal), "{}", normal);
        }
    }

    #[test]
    fn test_active_hour_interval_with_default_jitter() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let mut rng = StdRng::seed_from_u64(21);
        for _ in 0..500 {
            let secs = scheduler.interval_for_hour(21, &mut rng).as_secs_f64();
            assert!(secs >= 22.5 * 60.0 && secs <= 75.0 * 60.0, "{}", secs);
        }
    }

    #[test]
    fn test_active_wins_over_sleep() {
        let config = SchedulerConfig {
            active_hours: vec![22],
            sleep_hours: vec![22, 23],
            ..no_jitter()
        };
        assert_eq!(bucket(&config, 22), HourBucket::Active);
    }

    #[test]
    fn test_weight_adjustments() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let short = Duration::from_secs(10 * MIN);
        let long = Duration::from_secs(3 * 60 * MIN);

        let afternoon = s.weights_for(14, short);
        assert_eq!((afternoon.casual, afternoon.emotional, afternoon.question), (60, 25, 15));

        let night = s.weights_for(22, short);
        assert_eq!((night.casual, night.emotional, night.question), (50, 45, 15));

        let morning = s.weights_for(8, long);
        assert_eq!((morning.casual, morning.emotional, morning.question), (50, 25, 40));
    }

    #[test]
    fn test_casual_never_underflows() {
        let weights = MessageWeights {
            casual: 5,
            emotional: 0,
            question: 0,
        };
        // Hour 1 is "night", so casual loses 10.
        assert_eq!(adjust_weights(weights, 1, Duration::ZERO).casual, 0);
    }

    #[test]
    fn test_zero_weights_fall_back_to_casual() {
        let weights = MessageWeights {
            casual: 0,
            emotional: 0,
            question: 0,
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(weighted_select(&weights, &mut rng), Category::Casual);
    }

    #[test]
    fn test_selection_follows_weights() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts: HashMap<Category, u32> = HashMap::new();
        let draws = 10_000;
        for _ in 0..draws {
            let (category, _) = s.pick(14, Duration::from_secs(MIN), &mut rng);
            *counts.entry(category).or_default() += 1;
        }
        let share = |c: Category| counts.get(&c).copied().unwrap_or(0) as f64 / draws as f64;
        assert!((share(Category::Casual) - 0.60).abs() < 0.03);
        assert!((share(Category::Emotional) - 0.25).abs() < 0.03);
        assert!((share(Category::Question) - 0.15).abs() < 0.03);
    }

    #[test]
    fn test_empty_pool_uses_fallback() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let s = s.with_pool(MessagePool::empty());
        let mut rng = StdRng::seed_from_u64(3);
        let (_, text) = s.pick(14, Duration::ZERO, &mut rng);
        assert_eq!(text, FALLBACK_MESSAGE);
    }

    #[test]
    fn test_picked_text_comes_from_category() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let (category, text) = s.pick(14, Duration::ZERO, &mut rng);
            assert!(s.pool.messages(category).contains(&text));
        }
    }

    #[tokio::test]
    async fn test_long_chat_always_suppressed() {
        let (s, state) = scheduler(SchedulerConfig::default());
        state.set_state(TARGET, EngagementState::LongChat).await;
        assert_eq!(
            s.should_send().await,
            SendDecision::Suppressed(SuppressReason::LongChat)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_busy_is_suppressed() {
        let (s, state) = scheduler(SchedulerConfig::default());
        state.set_state(TARGET, EngagementState::Busy).await;
        state.touch_last_reply(TARGET).await;
        tokio::time::advance(Duration::from_secs(10 * MIN)).await;

        assert_eq!(
            s.should_send().await,
            SendDecision::Suppressed(SuppressReason::RecentlyBusy)
        );
        assert_eq!(state.state(TARGET).await, EngagementState::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_clears_after_cooldown() {
        let (s, state) = scheduler(SchedulerConfig::default());
        state.set_state(TARGET, EngagementState::Busy).await;
        state.touch_last_reply(TARGET).await;
        tokio::time::advance(Duration::from_secs(61 * MIN)).await;

        assert_eq!(s.should_send().await, SendDecision::Send);
        assert_eq!(state.state(TARGET).await, EngagementState::Idle);
    }

    #[tokio::test]
    async fn test_other_states_may_send() {
        let (s, state) = scheduler(SchedulerConfig::default());
        for st in [
            EngagementState::Idle,
            EngagementState::NeedComfort,
            EngagementState::NeedEncourage,
            EngagementState::Perfunctory,
        ] {
            state.set_state(TARGET, st).await;
            assert_eq!(s.should_send().await, SendDecision::Send);
        }
    }

    #[tokio::test]
    async fn test_mood_probe_sets_need_comfort() {
        let pool = Category::ALL
            .iter()
            .fold(MessagePool::empty(), |p, c| p.with(*c, ["想你了"]));
        let (s, state) = scheduler(SchedulerConfig::default());
        let s = s.with_pool(pool);

        assert_eq!(
            s.select_message(EngagementState::Idle).await.as_deref(),
            Some("想你了")
        );
        assert_eq!(state.state(TARGET).await, EngagementState::NeedComfort);
    }

    #[tokio::test]
    async fn test_encourage_probe_sets_need_encourage() {
        let pool = Category::ALL
            .iter()
            .fold(MessagePool::empty(), |p, c| p.with(*c, ["鼓励我一下"]));
        let (s, state) = scheduler(SchedulerConfig::default());
        let s = s.with_pool(pool);
        let sink = Recorder::default();

        assert_eq!(s.tick(&sink).await, TickOutcome::Sent("鼓励我一下".to_string()));
        assert_eq!(state.state(TARGET).await, EngagementState::NeedEncourage);
    }

    #[tokio::test]
    async fn test_probe_does_not_clobber_long_chat_entered_after_check() {
        let pool = Category::ALL
            .iter()
            .fold(MessagePool::empty(), |p, c| p.with(*c, ["想你了"]));
        let (s, state) = scheduler(SchedulerConfig::default());
        let s = s.with_pool(pool);

        let seen = s.admit().await.unwrap();
        assert_eq!(seen, EngagementState::Idle);
        // The dispatcher starts a long chat before the message is chosen.
        state.set_state(TARGET, EngagementState::LongChat).await;

        assert_eq!(s.select_message(seen).await, None);
        assert_eq!(state.state(TARGET).await, EngagementState::LongChat);
    }

    #[tokio::test]
    async fn test_plain_message_dropped_when_state_moved() {
        let pool = Category::ALL
            .iter()
            .fold(MessagePool::empty(), |p, c| p.with(*c, ["吃饭了吗"]));
        let (s, state) = scheduler(SchedulerConfig::default());
        let s = s.with_pool(pool);

        let seen = s.admit().await.unwrap();
        state.set_state(TARGET, EngagementState::LongChat).await;
        assert_eq!(s.select_message(seen).await, None);
    }

    #[test]
    fn test_huge_weights_still_select() {
        let weights = MessageWeights {
            casual: u32::MAX,
            emotional: u32::MAX,
            question: 1,
        };
        let night = adjust_weights(weights, 22, Duration::from_secs(3 * 60 * MIN));
        assert_eq!(night.emotional, u32::MAX);

        let (s, _) = scheduler(SchedulerConfig {
            weights,
            ..SchedulerConfig::default()
        });
        let mut rng = StdRng::seed_from_u64(9);
        for hour in [1, 8, 14, 22] {
            let (_, text) = s.pick(hour, Duration::from_secs(3 * 60 * MIN), &mut rng);
            assert!(!text.is_empty());
        }
    }

    #[test]
    fn test_huge_base_interval_is_capped() {
        let config = SchedulerConfig {
            base_interval_mins: u64::MAX,
            ..no_jitter()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let cap = SchedulerConfig::MAX_MINUTES * MIN;
        let secs = interval_for(&config, 13, &mut rng).as_secs();
        assert!((cap..2 * cap).contains(&secs), "{}", secs);
    }

    #[tokio::test]
    async fn test_plain_message_keeps_state() {
        let pool = Category::ALL
            .iter()
            .fold(MessagePool::empty(), |p, c| p.with(*c, ["吃饭了吗"]));
        let (s, state) = scheduler(SchedulerConfig::default());
        let s = s.with_pool(pool);

        assert_eq!(
            s.select_message(EngagementState::Idle).await.as_deref(),
            Some("吃饭了吗")
        );
        assert_eq!(state.state(TARGET).await, EngagementState::Idle);
    }

    #[tokio::test]
    async fn test_tick_sends_and_records() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let sink = Recorder::default();

        match s.tick(&sink).await {
            TickOutcome::Sent(text) => assert_eq!(sink.sent.lock().unwrap().clone(), vec![text]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(s.since_last_sent() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_suppressed_tick_sends_nothing() {
        let (s, state) = scheduler(SchedulerConfig::default());
        state.set_state(TARGET, EngagementState::LongChat).await;
        let sink = Recorder::default();

        assert_eq!(
            s.tick(&sink).await,
            TickOutcome::Suppressed(SuppressReason::LongChat)
        );
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_tick_does_not_stop_the_next() {
        let (s, _) = scheduler(SchedulerConfig::default());
        let broken = Recorder {
            fail: true,
            ..Recorder::default()
        };
        assert!(matches!(s.tick(&broken).await, TickOutcome::Failed(_)));

        let working = Recorder::default();
        assert!(matches!(s.tick(&working).await, TickOutcome::Sent(_)));
    }

    #[tokio::test]
    async fn test_reconfigure_changes_cooldown() {
        let (s, state) = scheduler(SchedulerConfig::default());
        state.set_state(TARGET, EngagementState::Busy).await;
        state.touch_last_reply(TARGET).await;
        assert!(matches!(s.should_send().await, SendDecision::Suppressed(_)));

        s.reconfigure(SchedulerConfig {
            busy_cooldown_mins: 0,
            ..SchedulerConfig::default()
        });
        assert_eq!(s.should_send().await, SendDecision::Send);
    }
}
