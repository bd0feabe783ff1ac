//! Dialog orchestrator: runs one conversational turn at a time.
//!
//! A turn takes the turn lock, gathers summaries and recent context, calls the model
//! on its own task, and publishes `response_ready`. An `interrupt` received while the
//! model is thinking suppresses the publish. When the user has been quiet for
//! `idle_timeout`, the watchdog starts an auto-triggered turn.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::prompt::{PromptBuilder, PromptInput};
use crate::bus::{
    handler_fn, EventBus, EventPayload, Priority, ResponseReady, INTERRUPT, RESPONSE_READY,
    SPEECH_READY,
};
use crate::config::{DialogConfig, MemoryConfig};
use crate::error::CoreResult;
use crate::llm::{GenerationOptions, LanguageModel};
use crate::memory::{MemoryManager, UserInput};

const OWNER: &str = "DialogOrchestrator";

/// Tracks the last user interaction.
#[derive(Clone)]
pub struct IdleTracker {
    last_activity_ms: Arc<AtomicU64>,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self {
            last_activity_ms: Arc::new(AtomicU64::new(Self::now_ms())),
        }
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(Self::now_ms(), Ordering::Release);
    }

    pub fn idle_duration(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(Self::now_ms().saturating_sub(last))
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Which long-term summaries are injected into each prompt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummarySelection {
    pub limit: usize,
    pub min_importance: f32,
}

impl Default for SummarySelection {
    fn default() -> Self {
        Self {
            limit: 3,
            min_importance: 0.0,
        }
    }
}

impl From<&MemoryConfig> for SummarySelection {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            limit: config.summary_limit,
            min_importance: config.min_importance,
        }
    }
}

/// Holds `processing` high until dropped, including when the turn future is cancelled.
struct ProcessingFlag<'a>(&'a AtomicBool);

impl<'a> ProcessingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ProcessingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogState {
    Idle,
    Processing,
}

/// Result of one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// `response_ready` was published with this payload.
    Published(ResponseReady),
    /// An interrupt arrived while the model was running; nothing was published.
    Suppressed { response_id: String, latency_ms: u64 },
}

impl TurnOutcome {
    pub fn response_id(&self) -> &str {
        match self {
            TurnOutcome::Published(r) => &r.response_id,
            TurnOutcome::Suppressed { response_id, .. } => response_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogStatus {
    pub state: DialogState,
    pub model: String,
    pub idle_secs: u64,
    pub idle_timeout_secs: u64,
    pub auto_trigger_active: bool,
    pub turns_completed: u64,
    pub turns_suppressed: u64,
    pub turns_failed: u64,
    pub last_error: Option<String>,
}

pub struct DialogOrchestrator {
    bus: Arc<EventBus>,
    model: Arc<dyn LanguageModel>,
    memory: Arc<MemoryManager>,
    prompts: PromptBuilder,
    config: DialogConfig,
    summaries: SummarySelection,
    turn_lock: TokioMutex<()>,
    processing: AtomicBool,
    interrupted: AtomicBool,
    idle: IdleTracker,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    turns_completed: AtomicU64,
    turns_suppressed: AtomicU64,
    turns_failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl DialogOrchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        model: Arc<dyn LanguageModel>,
        memory: Arc<MemoryManager>,
        config: DialogConfig,
        summaries: SummarySelection,
    ) -> Arc<Self> {
        Arc::new(Self {
            prompts: PromptBuilder::new(config.system_prompt.clone(), config.history_limit),
            bus,
            model,
            memory,
            config,
            summaries,
            turn_lock: TokioMutex::new(()),
            processing: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            idle: IdleTracker::new(),
            watchdog: Mutex::new(None),
            turns_completed: AtomicU64::new(0),
            turns_suppressed: AtomicU64::new(0),
            turns_failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    /// Subscribe to `speech_ready` (NORMAL) and `interrupt` (HIGH).
    pub fn register(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.bus.subscribe(
            SPEECH_READY,
            handler_fn(move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Some(payload) = event.speech_ready() {
                        this.process_user_message(UserInput::from(payload)).await?;
                    }
                    Ok(())
                }
            }),
            Priority::Normal,
            OWNER,
        );

        let this = Arc::clone(self);
        self.bus.subscribe(
            INTERRUPT,
            handler_fn(move |event| {
                let this = Arc::clone(&this);
                async move {
                    let reason = event.interrupt().map(|i| i.reason.clone()).unwrap_or_default();
                    this.interrupt(&reason);
                    Ok(())
                }
            }),
            Priority::High,
            OWNER,
        );
        info!(target: "chino::dialog", model = %self.model.name(), "dialog orchestrator subscribed");
    }

    /// Flag the in-flight turn (if any) so its reply is not published.
    pub fn interrupt(&self, reason: &str) {
        if self.processing.load(Ordering::Acquire) {
            self.interrupted.store(true, Ordering::Release);
            info!(target: "chino::dialog", reason, "⛔ interrupt: in-flight reply will be dropped");
        } else {
            debug!(target: "chino::dialog", reason, "interrupt while idle");
        }
    }

    /// Store the user turn, then answer it. The synchronous path for API callers;
    /// bus-driven input relies on the memory manager's own subscription instead.
    ///
    /// The turn is stored only once the turn lock is held, so a queued message lands
    /// in the buffer after the reply it waited for.
    pub async fn respond_to(&self, input: UserInput) -> CoreResult<TurnOutcome> {
        self.idle.touch();
        let _turn = self.turn_lock.lock().await;
        self.memory.save_user_turn(input.clone()).await?;
        self.run_locked(PromptInput::User(input.text), Some(input.input_id), false)
            .await
    }

    pub async fn process_user_message(&self, input: UserInput) -> CoreResult<TurnOutcome> {
        self.idle.touch();
        let _turn = self.turn_lock.lock().await;
        self.run_locked(PromptInput::User(input.text), Some(input.input_id), false)
            .await
    }

    pub async fn auto_trigger(&self) -> CoreResult<TurnOutcome> {
        let _turn = self.turn_lock.lock().await;
        self.run_locked(PromptInput::AutoTrigger, None, true).await
    }

    /// Auto-trigger only if the user is still idle for `idle_timeout` once the turn
    /// lock is held. `None` means a user turn got in first.
    pub async fn auto_trigger_if_idle(&self, idle_timeout: Duration) -> CoreResult<Option<TurnOutcome>> {
        let _turn = self.turn_lock.lock().await;
        let idle = self.idle.idle_duration();
        if idle < idle_timeout {
            debug!(target: "chino::dialog", idle_ms = idle.as_millis() as u64, "user active again, auto-trigger skipped");
            return Ok(None);
        }
        info!(target: "chino::dialog", idle_secs = idle.as_secs(), "⏰ user idle, auto-triggering");
        self.run_locked(PromptInput::AutoTrigger, None, true).await.map(Some)
    }

    /// Run one turn. The caller holds `turn_lock`.
    async fn run_locked(
        &self,
        input: PromptInput,
        answering: Option<String>,
        auto_triggered: bool,
    ) -> CoreResult<TurnOutcome> {
        let processing = ProcessingFlag::raise(&self.processing);
        self.interrupted.store(false, Ordering::Release);

        let result = self.execute_turn(input, answering, auto_triggered).await;

        drop(processing);
        self.idle.touch();
        match &result {
            Ok(TurnOutcome::Published(_)) => {
                self.turns_completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(TurnOutcome::Suppressed { .. }) => {
                self.turns_suppressed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.turns_failed.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                error!(target: "chino::dialog", error = %e, auto_triggered, "turn failed");
            }
        }
        result
    }

    async fn execute_turn(
        &self,
        input: PromptInput,
        answering: Option<String>,
        auto_triggered: bool,
    ) -> CoreResult<TurnOutcome> {
        let summaries = self
            .memory
            .recent_summaries(self.summaries.limit, self.summaries.min_importance)
            .await;
        let history = match self.memory.conversation_context(answering).await {
            Ok(history) => history,
            Err(e) => {
                warn!(target: "chino::dialog", error = %e, "context unavailable, continuing without history");
                Vec::new()
            }
        };
        let messages = self.prompts.build(&history, &summaries, &input);
        let response_id = uuid::Uuid::new_v4().to_string();

        debug!(
            target: "chino::dialog",
            response_id = %response_id,
            messages = messages.len(),
            summaries = summaries.len(),
            auto_triggered,
            "calling model"
        );

        let model = Arc::clone(&self.model);
        let started = Instant::now();
        let sentences = tokio::spawn(async move {
            model
                .generate_sentences(&messages, &GenerationOptions::default())
                .await
        })
        .await??;
        let latency_ms = started.elapsed().as_millis() as u64;

        if self.interrupted.swap(false, Ordering::AcqRel) {
            info!(target: "chino::dialog", response_id = %response_id, latency_ms, "reply suppressed by interrupt");
            return Ok(TurnOutcome::Suppressed { response_id, latency_ms });
        }

        let payload = ResponseReady {
            sentences,
            response_id,
            latency_ms,
            auto_triggered,
        };
        info!(
            target: "chino::dialog",
            response_id = %payload.response_id,
            sentences = payload.sentences.len(),
            latency_ms,
            auto_triggered,
            "🗣️ reply ready"
        );
        self.bus
            .publish(RESPONSE_READY, EventPayload::ResponseReady(payload.clone()))
            .await;
        Ok(TurnOutcome::Published(payload))
    }

    /// Start the idle watchdog. A second call while it runs is a no-op.
    pub fn start_watchdog(self: &Arc<Self>) {
        if !self.config.auto_trigger_enabled {
            info!(target: "chino::dialog", "auto-trigger disabled");
            return;
        }
        let mut slot = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let this = Arc::clone(self);
        let period = self.config.watchdog_interval();
        let idle_timeout = self.config.idle_timeout();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if this.processing.load(Ordering::Acquire) || this.idle.idle_duration() < idle_timeout {
                    continue;
                }
                if let Err(e) = this.auto_trigger_if_idle(idle_timeout).await {
                    warn!(target: "chino::dialog", error = %e, "auto-trigger failed");
                }
            }
        }));
        info!(target: "chino::dialog", ?period, ?idle_timeout, "idle watchdog started");
    }

    pub fn stop_watchdog(&self) {
        if let Some(handle) = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            info!(target: "chino::dialog", "idle watchdog stopped");
        }
    }

    pub fn watchdog_active(&self) -> bool {
        self.watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn state(&self) -> DialogState {
        if self.processing.load(Ordering::Acquire) {
            DialogState::Processing
        } else {
            DialogState::Idle
        }
    }

    pub fn idle(&self) -> &IdleTracker {
        &self.idle
    }

    /// Clear the short-term conversation and reset idle time.
    pub async fn clear_conversation(&self) -> CoreResult<()> {
        self.memory.clear().await?;
        self.idle.touch();
        Ok(())
    }

    pub fn status(&self) -> DialogStatus {
        DialogStatus {
            state: self.state(),
            model: self.model.name().to_string(),
            idle_secs: self.idle.idle_duration().as_secs(),
            idle_timeout_secs: self.config.idle_timeout_secs,
            auto_trigger_active: self.watchdog_active(),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_suppressed: self.turns_suppressed.load(Ordering::Relaxed),
            turns_failed: self.turns_failed.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
