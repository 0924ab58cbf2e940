use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct YumeConfig {
    pub onebot: OneBotConfig,
    pub ai: AiConfig,
    pub scheduler: SchedulerConfig,
    pub memory: MemoryConfig,
    pub persona: PersonaConfig,
    pub logging: LoggingConfig,
}

impl YumeConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied and AI settings normalized.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: YumeConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.ai.normalize();
        Ok(config)
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({:#}), using defaults", e);
                Self::from_env()
            }
        }
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.ai.normalize();
        cfg
    }

    /// Apply overrides from `lookup` (normally the process environment).
    ///
    /// Values that fail to parse leave the current value in place.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // OneBot
        if let Some(host) = get("HOSTADD") {
            self.onebot.ws_url = if host.contains("://") {
                host
            } else {
                format!("ws://{}/ws", host)
            };
        }
        if let Some(token) = get("Token") {
            self.onebot.access_token = Some(token);
        }
        if let Some(id) = get("TARGETID").and_then(|v| v.parse().ok()) {
            self.onebot.target_id = id;
        }

        // AI
        if let Some(v) = get("AI_PROVIDER") {
            self.ai.provider = v;
        }
        if let Some(v) = get("AI_BASEURL") {
            self.ai.base_url = v;
        }
        if let Some(v) = get("AI_KEY") {
            self.ai.api_key = v;
        }
        if let Some(v) = get("AI_MODEL") {
            self.ai.model = v;
        }
        if let Some(v) = get("AI_TEMPERATURE").and_then(|v| v.parse().ok()) {
            self.ai.temperature = v;
        }
        if let Some(v) = get("AI_TOP_P").and_then(|v| v.parse().ok()) {
            self.ai.top_p = v;
        }
        if let Some(v) = get("AI_MAX_TOKENS").and_then(|v| v.parse().ok()) {
            self.ai.max_tokens = v;
        }
        if let Some(v) = get("AI_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.ai.timeout_secs = v;
        }
        if let Some(v) = get("AI_RETRY_COUNT").and_then(|v| v.parse().ok()) {
            self.ai.retry_count = v;
        }
        if let Some(v) = get("AI_RATE_LIMIT").and_then(|v| v.parse().ok()) {
            self.ai.rate_limit = v;
        }

        // Scheduler
        if let Some(v) = get("ENABLE_NATURAL_SCHEDULER").and_then(|v| parse_bool(&v)) {
            self.scheduler.enabled = v;
        }
        if let Some(v) = get("BASE_INTERVAL").and_then(|v| v.parse().ok()) {
            self.scheduler.base_interval_mins = v;
        }
        if let Some(v) = get("RANDOM_FACTOR").and_then(|v| v.parse().ok()) {
            self.scheduler.random_factor = v;
        }
        if let Some(hours) = get("ACTIVE_HOURS").and_then(|v| parse_hours(&v)) {
            self.scheduler.active_hours = hours;
        }
        if let Some(hours) = get("SLEEP_HOURS").and_then(|v| parse_hours(&v)) {
            self.scheduler.sleep_hours = hours;
        }

        // Memory / persona
        if let Some(v) = get("ENABLE_EMOTIONAL_MEMORY").and_then(|v| parse_bool(&v)) {
            self.memory.emotional_memory = v;
        }
        if let Some(v) = get("CHARACTER") {
            self.persona.character = v;
        }
        if let Some(v) = get("AI_PROMPT") {
            self.persona.extra_prompt = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.ai.validate()?;
        if !(0.0..=1.0).contains(&self.scheduler.random_factor) {
            bail!("random_factor must be in [0,1]");
        }
        self.scheduler.validate()?;
        if self.memory.history_cap == 0 {
            bail!("history_cap must be > 0");
        }
        let overlap: Vec<u32> = self
            .scheduler
            .active_hours
            .iter()
            .filter(|h| self.scheduler.sleep_hours.contains(h))
            .copied()
            .collect();
        if !overlap.is_empty() {
            tracing::warn!(
                "Hours {:?} are both active and sleep hours; treating them as active",
                overlap
            );
        }
        Ok(())
    }
}

/// Go-style boolean parsing (`1`, `t`, `TRUE`, `false`, ...).
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parse a comma-separated hour list. Invalid entries are dropped; `None`
/// if nothing valid remains.
fn parse_hours(raw: &str) -> Option<Vec<u32>> {
    let hours: Vec<u32> = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .filter(|h| *h < 24)
        .collect();
    if hours.is_empty() {
        None
    } else {
        Some(hours)
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OneBotConfig {
    pub ws_url: String,
    pub access_token: Option<String>,
    /// The single remote user this bot talks to.
    pub target_id: i64,
}

impl Default for OneBotConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:3001/ws".to_string(),
            access_token: None,
            target_id: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// `openai` (any OpenAI-compatible endpoint) or `mock`.
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    /// Per-attempt timeout in seconds.
    pub timeout_secs: u64,
    /// Retries after the first attempt (hard-capped by the policy engine).
    pub retry_count: u32,
    /// Requests per minute.
    pub rate_limit: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: "https://api.deepseek.com/v1".to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            temperature: 0.7,
            top_p: 1.0,
            max_tokens: 2048,
            timeout_secs: 30,
            retry_count: 3,
            rate_limit: 20,
        }
    }
}

impl AiConfig {
    /// Replace out-of-range values with safe defaults.
    pub fn normalize(&mut self) {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self.model = self.model.trim().to_string();
        self.api_key = self.api_key.trim().to_string();
        if self.temperature < 0.0 {
            self.temperature = 1.0;
        }
        if self.max_tokens == 0 {
            self.max_tokens = 2000;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = 30;
        }
        if self.rate_limit == 0 {
            self.rate_limit = 20;
        }
        if self.top_p < 0.0 {
            self.top_p = 0.9;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider != "mock" && self.base_url.trim().is_empty() {
            bail!("ai.base_url is required");
        }
        if self.model.trim().is_empty() {
            bail!("ai.model is required");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!("ai.temperature must be in [0,2]");
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            bail!("ai.top_p must be in [0,1]");
        }
        if self.rate_limit == 0 {
            bail!("ai.rate_limit must be > 0");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Relative weights of the three proactive message categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessageWeights {
    pub casual: u32,
    pub emotional: u32,
    pub question: u32,
}

impl Default for MessageWeights {
    fn default() -> Self {
        Self {
            casual: 60,
            emotional: 25,
            question: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Lower bound of the "normal" bucket in minutes; the bucket spans
    /// `[base, 2 * base)`.
    pub base_interval_mins: u64,
    /// Fraction of symmetric jitter applied to every interval.
    pub random_factor: f64,
    pub active_hours: Vec<u32>,
    pub sleep_hours: Vec<u32>,
    /// How long a `Busy` state suppresses proactive messages.
    pub busy_cooldown_mins: u64,
    pub weights: MessageWeights,
    /// Proactive texts that put the user into `NeedComfort` when sent.
    pub mood_probes: Vec<String>,
    /// Proactive texts that put the user into `NeedEncourage` when sent.
    pub encourage_probes: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_interval_mins: 45,
            random_factor: 0.5,
            active_hours: vec![9, 10, 11, 14, 15, 16, 19, 20, 21],
            sleep_hours: vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 22, 23],
            busy_cooldown_mins: 60,
            weights: MessageWeights::default(),
            mood_probes: vec!["想你了".to_string(), "有点想聊天".to_string()],
            encourage_probes: vec!["鼓励我一下".to_string()],
        }
    }
}

impl SchedulerConfig {
    /// Upper bound for `base_interval_mins` and `busy_cooldown_mins` (one week).
    pub const MAX_MINUTES: u64 = 7 * 24 * 60;
    /// Upper bound for each category weight.
    pub const MAX_WEIGHT: u32 = 10_000;

    pub fn busy_cooldown(&self) -> Duration {
        Duration::from_secs(self.busy_cooldown_mins.saturating_mul(60))
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=Self::MAX_MINUTES).contains(&self.base_interval_mins) {
            bail!("base_interval_mins must be in [1,{}]", Self::MAX_MINUTES);
        }
        if self.busy_cooldown_mins > Self::MAX_MINUTES {
            bail!("busy_cooldown_mins must be <= {}", Self::MAX_MINUTES);
        }
        let w = &self.weights;
        if [w.casual, w.emotional, w.question]
            .iter()
            .any(|v| *v > Self::MAX_WEIGHT)
        {
            bail!("scheduler weights must each be <= {}", Self::MAX_WEIGHT);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub data_dir: PathBuf,
    /// Entries kept per user when appending to a conversation.
    pub history_cap: usize,
    pub emotional_memory: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("public/memory"),
            history_cap: 100,
            emotional_memory: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub dir: PathBuf,
    pub character: String,
    /// Appended after the character prompt.
    pub extra_prompt: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("config/character"),
            character: "default".to_string(),
            extra_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
        }
    }
}

// ============================================================================
// Live handle
// ============================================================================

/// Shared, hot-swappable view of the current configuration.
///
/// Readers never block; `reload` replaces the whole snapshot at once.
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: ArcSwap<YumeConfig>,
}

impl ConfigHandle {
    pub fn new(config: YumeConfig, path: Option<PathBuf>) -> Self {
        Self {
            path,
            current: ArcSwap::from_pointee(config),
        }
    }

    pub fn current(&self) -> Arc<YumeConfig> {
        self.current.load_full()
    }

    /// Re-read file and environment. On error the previous snapshot stays live.
    pub fn reload(&self) -> Result<Arc<YumeConfig>> {
        let config = match &self.path {
            Some(path) if path.exists() => YumeConfig::load(path)?,
            _ => YumeConfig::from_env(),
        };
        config.validate()?;
        let config = Arc::new(config);
        self.current.store(Arc::clone(&config));
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
