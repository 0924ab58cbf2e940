//! Wires the bot together: one websocket connection, the inbound read and
//! dispatch loops, the proactive scheduler and the status monitor.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use yume_core::{Character, ConfigHandle, Expression, UserId, YumeConfig};
use yume_expression::NaturalScheduler;
use yume_memory::{EmotionalMemory, JsonDirStore, KvStore, StateMachine};
use yume_onebot::{EventReader, Inbound, PrivateSender};
use yume_reasoning::{clean_think_tags, providers, CompletionPolicy, HandlerChain, HandlerContext};

/// Message from the target that shuts the bot down.
pub const EXIT_COMMAND: &str = "exit();";

const INBOX_CAPACITY: usize = 64;
const STATUS_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ============================================================================
// Inbound routing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Text from the target, to be answered.
    Forward(String),
    /// The target asked us to shut down.
    Exit,
    Ignore,
}

/// Only private messages from `target` reach the handlers.
pub fn route(inbound: &Inbound, target: UserId) -> Route {
    match inbound.private_message() {
        Some(msg) if msg.user_id == target => {
            let text = msg.raw_message.trim();
            if text == EXIT_COMMAND {
                Route::Exit
            } else if text.is_empty() {
                Route::Ignore
            } else {
                Route::Forward(text.to_string())
            }
        }
        Some(msg) => {
            tracing::debug!("Ignoring private message from {}", msg.user_id);
            Route::Ignore
        }
        None => {
            tracing::debug!("Ignoring frame: {:?}", inbound);
            Route::Ignore
        }
    }
}

async fn read_loop(
    mut reader: EventReader,
    target: UserId,
    inbox: mpsc::Sender<String>,
    shutdown: Arc<watch::Sender<bool>>,
) {
    let mut stop = shutdown.subscribe();
    loop {
        let inbound = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            inbound = reader.next() => inbound,
        };
        let Some(inbound) = inbound else {
            tracing::warn!("OneBot connection lost, shutting down");
            shutdown.send_replace(true);
            break;
        };
        match route(&inbound, target) {
            Route::Forward(text) => {
                tracing::info!("Received from {}: {}", target, text);
                if inbox.send(text).await.is_err() {
                    break;
                }
            }
            Route::Exit => {
                tracing::info!("Exit requested by {}", target);
                shutdown.send_replace(true);
                break;
            }
            Route::Ignore => {}
        }
    }
    tracing::debug!("Read loop stopped");
}

// ============================================================================
// Dispatch
// ============================================================================

/// Answers inbound messages from the target, one at a time.
pub struct Dispatcher {
    pub target: UserId,
    pub state: Arc<StateMachine>,
    pub policy: Arc<CompletionPolicy>,
    pub memory: Option<Arc<EmotionalMemory>>,
    pub system_prompt: String,
    pub chain: HandlerChain,
    pub sink: Arc<dyn Expression>,
}

impl Dispatcher {
    /// Handle one message and send the reply, if any. Returns what was sent.
    pub async fn handle(&self, message: &str) -> Option<String> {
        self.state.touch_last_reply(self.target).await;

        let ctx = HandlerContext {
            user: self.target,
            state: &self.state,
            policy: &self.policy,
            memory: self.memory.as_deref(),
            system_prompt: &self.system_prompt,
        };
        let reply = clean_think_tags(&self.chain.dispatch(&ctx, message).await?);
        if reply.trim().is_empty() {
            return None;
        }

        match self.sink.speak(self.target, &reply).await {
            Ok(()) => Some(reply),
            Err(e) => {
                tracing::error!("Failed to send reply: {:#}", e);
                None
            }
        }
    }

    pub async fn run(self, mut inbox: mpsc::Receiver<String>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                message = inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle(&message).await;
        }
        tracing::debug!("Dispatch loop stopped");
    }
}

// ============================================================================
// Status monitor
// ============================================================================

async fn status_loop(state: Arc<StateMachine>, target: UserId, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => break,
            _ = ticker.tick() => {
                let status = state.status(target).await;
                tracing::info!(
                    "Status of {}: state={}, flags={:?}, counters={:?}, history={}, idle={}s",
                    target,
                    status.state,
                    status.flags,
                    status.counters,
                    status.conversation_len,
                    status.since_last_reply.as_secs()
                );
            }
        }
    }
}

// ============================================================================
// Signals
// ============================================================================

fn reload(handle: &ConfigHandle, policy: &CompletionPolicy, scheduler: Option<&NaturalScheduler>) {
    match handle.reload() {
        Ok(config) => {
            policy.reconfigure(&config.ai);
            if let Some(scheduler) = scheduler {
                scheduler.reconfigure(config.scheduler.clone());
            }
            tracing::info!(
                "Configuration reloaded (model={}, rate_limit={}/min)",
                config.ai.model,
                config.ai.rate_limit
            );
        }
        Err(e) => tracing::error!("Config reload failed, keeping current settings: {:#}", e),
    }
}

/// Blocks until a stop signal or an internal shutdown request. SIGHUP
/// reloads the configuration and keeps waiting.
#[cfg(unix)]
async fn wait_for_stop(
    handle: &ConfigHandle,
    policy: &CompletionPolicy,
    scheduler: Option<&NaturalScheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut hup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => return Ok(()),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down...");
                return Ok(());
            }
            _ = term.recv() => {
                tracing::info!("Received SIGTERM, shutting down...");
                return Ok(());
            }
            _ = hup.recv() => reload(handle, policy, scheduler),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop(
    _handle: &ConfigHandle,
    _policy: &CompletionPolicy,
    _scheduler: Option<&NaturalScheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tokio::select! {
        _ = shutdown.wait_for(|stopped| *stopped) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C, shutting down..."),
    }
    Ok(())
}

// ============================================================================
// Entry
// ============================================================================

pub struct Options {
    pub scheduler: bool,
}

pub async fn run(handle: ConfigHandle, options: Options) -> Result<()> {
    let config: Arc<YumeConfig> = handle.current();
    let target = config.onebot.target_id;
    if target == 0 {
        tracing::warn!("onebot.target_id is not set; no messages will be answered");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // Memory
    tracing::info!("Loading memory from {}...", config.memory.data_dir.display());
    let store: Arc<dyn KvStore> = Arc::new(JsonDirStore::new(&config.memory.data_dir));
    let state = Arc::new(StateMachine::restore(Arc::clone(&store), config.memory.history_cap).await);
    let memory = if config.memory.emotional_memory {
        Some(Arc::new(EmotionalMemory::restore(Arc::clone(&store)).await))
    } else {
        None
    };

    // Persona
    let character = Character::load_or_default(&config.persona.dir, &config.persona.character).await;
    tracing::info!("Persona: {}", character.name);
    let system_prompt = character.system_prompt(&config.persona.extra_prompt);

    // Reasoning
    let client = providers::from_config(&config.ai)?;
    let policy = Arc::new(
        CompletionPolicy::from_config(client, &config.ai).with_shutdown(shutdown_rx.clone()),
    );
    tracing::info!(
        "Completion service {} ({}), {}/min",
        config.ai.model,
        config.ai.base_url,
        config.ai.rate_limit
    );

    // Connection
    let (outbound, reader) =
        yume_onebot::connect(&config.onebot.ws_url, config.onebot.access_token.as_deref()).await?;
    let sink: Arc<dyn Expression> = Arc::new(PrivateSender::new(Arc::clone(&outbound)));

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    tasks.push(tokio::spawn(read_loop(reader, target, inbox_tx, Arc::clone(&shutdown_tx))));

    let dispatcher = Dispatcher {
        target,
        state: Arc::clone(&state),
        policy: Arc::clone(&policy),
        memory: memory.clone(),
        system_prompt,
        chain: HandlerChain::default(),
        sink: Arc::clone(&sink),
    };
    tasks.push(tokio::spawn(dispatcher.run(inbox_rx, shutdown_rx.clone())));

    let scheduler = if options.scheduler && config.scheduler.enabled {
        let scheduler = Arc::new(NaturalScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&state),
            target,
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&scheduler).run(Arc::clone(&sink), shutdown_rx.clone()),
        ));
        Some(scheduler)
    } else {
        tracing::info!("Natural scheduler disabled");
        None
    };

    tasks.push(tokio::spawn(status_loop(
        Arc::clone(&state),
        target,
        shutdown_rx.clone(),
    )));

    tracing::info!("Yume is online, talking to {}", target);
    let waited = wait_for_stop(&handle, &policy, scheduler.as_deref(), shutdown_rx).await;

    // Shutdown
    shutdown_tx.send_replace(true);
    if let Err(e) = outbound.close().await {
        tracing::warn!("Failed to close the connection cleanly: {}", e);
    }
    for task in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            tracing::warn!("A task did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }
    if let Err(e) = state.flush().await {
        tracing::warn!("Failed to save conversation state: {:#}", e);
    }
    if let Some(memory) = &memory {
        if let Err(e) = memory.flush().await {
            tracing::warn!("Failed to save emotional memory: {:#}", e);
        }
    }
    tracing::info!("Goodbye");
    waited
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use yume_core::{AiConfig, EngagementState};
    use yume_reasoning::providers::MockProvider;
    use yume_reasoning::PolicySettings;

    const TARGET: UserId = 10086;

    fn private(user_id: UserId, text: &str) -> Inbound {
        let raw = format!(
            r#"{{"post_type":"message","message_type":"private","user_id":{},"raw_message":"{}"}}"#,
            user_id, text
        );
        Inbound::parse(&raw).unwrap()
    }

    #[test]
    fn test_route_forwards_target_messages() {
        assert_eq!(
            route(&private(TARGET, " 在吗 "), TARGET),
            Route::Forward("在吗".to_string())
        );
    }

    #[test]
    fn test_route_exit_command() {
        assert_eq!(route(&private(TARGET, "exit();"), TARGET), Route::Exit);
    }

    #[test]
    fn test_route_ignores_others() {
        assert_eq!(route(&private(1, "在吗"), TARGET), Route::Ignore);
        assert_eq!(route(&private(1, "exit();"), TARGET), Route::Ignore);
        let group = Inbound::parse(
            r#"{"post_type":"message","message_type":"group","user_id":10086,"group_id":2,"raw_message":"hi"}"#,
        )
        .unwrap();
        assert_eq!(route(&group, TARGET), Route::Ignore);
        let heartbeat = Inbound::parse(
            r#"{"post_type":"meta_event","meta_event_type":"heartbeat","time":1,"interval":5000}"#,
        )
        .unwrap();
        assert_eq!(route(&heartbeat, TARGET), Route::Ignore);
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Expression for Recorder {
        async fn speak(&self, _user_id: UserId, message: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn dispatcher(provider: MockProvider, sink: Arc<Recorder>) -> Dispatcher {
        let cfg = AiConfig {
            retry_count: 0,
            ..AiConfig::default()
        };
        let settings = PolicySettings::from_config(&cfg);
        Dispatcher {
            target: TARGET,
            state: Arc::new(StateMachine::new(100)),
            policy: Arc::new(CompletionPolicy::new(Arc::new(provider), settings, 60)),
            memory: None,
            system_prompt: "你是小梦".to_string(),
            chain: HandlerChain::default(),
            sink,
        }
    }

    #[tokio::test]
    async fn test_preset_reply_is_sent_and_state_updated() {
        let sink = Arc::new(Recorder::default());
        let d = dispatcher(MockProvider::new(), Arc::clone(&sink));

        assert_eq!(d.handle("在忙呢").await.as_deref(), Some("好吧"));
        assert_eq!(sink.sent.lock().unwrap().clone(), vec!["好吧".to_string()]);
        assert_eq!(d.state.state(TARGET).await, EngagementState::Busy);
        assert!(d.state.since_last_reply(TARGET).await < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_long_chat_reply_has_think_tags_removed() {
        let sink = Arc::new(Recorder::default());
        let provider = MockProvider::new()
            .with_script([Ok("想继续".to_string())])
            .always(|| Ok("<think>嗯</think>今天也很开心$你呢".to_string()));
        let d = dispatcher(provider, Arc::clone(&sink));
        d.state.set_state(TARGET, EngagementState::LongChat).await;

        let reply = d.handle("今天去看海了").await;
        assert_eq!(reply.as_deref(), Some("今天也很开心$你呢"));
        assert_eq!(d.state.state(TARGET).await, EngagementState::LongChat);
    }

    #[tokio::test]
    async fn test_inbox_is_drained_until_shutdown() {
        let sink = Arc::new(Recorder::default());
        let d = dispatcher(MockProvider::new(), Arc::clone(&sink));
        let (tx, rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(d.run(rx, stop_rx));
        tx.send("你好".to_string()).await.unwrap();
        tx.send("在干嘛".to_string()).await.unwrap();
        drop(tx);
        task.await.unwrap();
        drop(stop_tx);

        assert_eq!(
            sink.sent.lock().unwrap().clone(),
            vec!["你好".to_string(), "在学习".to_string()]
        );
    }
}
