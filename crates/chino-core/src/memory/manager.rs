//! Memory manager: persists conversation turns from bus events and compresses the
//! short-term buffer into long-term summaries.
//!
//! Compression runs on its own task under its own lock. A check that finds another
//! compression in progress is skipped; the next threshold crossing retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

use super::long_term::{NewSummary, Summary, SummaryStore};
use super::short_term::{ShortTermMemory, StoredTurn};
use super::summarizer::Summarizer;
use super::turn::{estimate_turn_tokens, AssistantSentence, ContextMessage, Turn, UserInput};
use crate::bus::{
    handler_fn, EventBus, EventPayload, MemoryFull, Priority, ResponseReady, MEMORY_FULL,
    RESPONSE_READY, SPEECH_READY,
};
use crate::config::CompressionPolicy;
use crate::error::CoreResult;

const OWNER: &str = "MemoryManager";

/// What a compression check did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompressionOutcome {
    /// Below the trigger.
    BelowThreshold,
    /// Another compression held the lock.
    Busy,
    /// No long-term store or summarizer is configured.
    Disabled,
    Compressed {
        summary_id: i64,
        turns: usize,
        removed: usize,
        importance: f32,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub session_id: String,
    pub short_term_turns: usize,
    pub short_term_capacity: usize,
    pub estimated_tokens: usize,
    pub long_term_summaries: usize,
    pub average_importance: f32,
    pub compressions: u64,
    pub failed_compressions: u64,
}

pub struct MemoryManager {
    bus: Arc<EventBus>,
    short_term: Arc<ShortTermMemory>,
    long_term: Option<Arc<dyn SummaryStore>>,
    summarizer: Option<Arc<Summarizer>>,
    policy: CompressionPolicy,
    compress_lock: TokioMutex<()>,
    compressions: AtomicU64,
    failed_compressions: AtomicU64,
}

impl MemoryManager {
    pub fn new(
        bus: Arc<EventBus>,
        short_term: Arc<ShortTermMemory>,
        long_term: Option<Arc<dyn SummaryStore>>,
        summarizer: Option<Arc<Summarizer>>,
        policy: CompressionPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            short_term,
            long_term,
            summarizer,
            policy,
            compress_lock: TokioMutex::new(()),
            compressions: AtomicU64::new(0),
            failed_compressions: AtomicU64::new(0),
        })
    }

    /// Subscribe to `speech_ready` and `response_ready`.
    pub fn register(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.bus.subscribe(
            SPEECH_READY,
            handler_fn(move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Some(payload) = event.speech_ready() {
                        this.save_user_turn(UserInput::from(payload)).await?;
                    }
                    Ok(())
                }
            }),
            Priority::Normal,
            OWNER,
        );

        let this = Arc::clone(self);
        self.bus.subscribe(
            RESPONSE_READY,
            handler_fn(move |event| {
                let this = Arc::clone(&this);
                async move {
                    if let Some(payload) = event.response_ready() {
                        this.save_response(payload.clone()).await?;
                        this.spawn_compression_check();
                    }
                    Ok(())
                }
            }),
            Priority::Normal,
            OWNER,
        );
        info!(target: "chino::memory", "memory manager subscribed");
    }

    pub async fn save_user_turn(&self, input: UserInput) -> CoreResult<Turn> {
        let short_term = Arc::clone(&self.short_term);
        tokio::task::spawn_blocking(move || short_term.add_user(&input, false)).await?
    }

    /// Store every sentence of a reply as an assistant turn. Returns how many were stored.
    pub async fn save_response(&self, response: ResponseReady) -> CoreResult<usize> {
        let short_term = Arc::clone(&self.short_term);
        tokio::task::spawn_blocking(move || -> CoreResult<usize> {
            let last = response.sentences.len().saturating_sub(1);
            for (idx, sentence) in response.sentences.iter().enumerate() {
                short_term.add_assistant(AssistantSentence {
                    response_id: &response.response_id,
                    stream_index: idx,
                    is_completed: idx == last,
                    sentence,
                    lang: "en",
                    latency_ms: if idx == 0 { response.latency_ms } else { 0 },
                })?;
            }
            Ok(response.sentences.len())
        })
        .await?
    }

    fn spawn_compression_check(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.check_and_compress().await {
                error!(target: "chino::memory", error = %e, "compression failed; buffer left intact");
            }
        });
    }

    fn over_threshold(&self, turns: &[Turn]) -> bool {
        match self.policy {
            CompressionPolicy::TurnCount(n) => turns.len() >= n,
            CompressionPolicy::TokenBudget(budget) => estimate_turn_tokens(turns) >= budget,
        }
    }

    fn threshold(&self) -> usize {
        match self.policy {
            CompressionPolicy::TurnCount(n) | CompressionPolicy::TokenBudget(n) => n,
        }
    }

    /// Compress the buffer if it crossed the trigger.
    ///
    /// On failure nothing is removed from the short-term buffer.
    pub async fn check_and_compress(&self) -> CoreResult<CompressionOutcome> {
        let (Some(store), Some(summarizer)) = (&self.long_term, &self.summarizer) else {
            return Ok(CompressionOutcome::Disabled);
        };
        let Ok(_guard) = self.compress_lock.try_lock() else {
            debug!(target: "chino::memory", "compression already running");
            return Ok(CompressionOutcome::Busy);
        };

        let short_term = Arc::clone(&self.short_term);
        let batch = tokio::task::spawn_blocking(move || short_term.snapshot()).await??;
        let turns: Vec<Turn> = batch.iter().map(|s| s.turn.clone()).collect();
        if turns.is_empty() || !self.over_threshold(&turns) {
            return Ok(CompressionOutcome::BelowThreshold);
        }

        let token_count = estimate_turn_tokens(&turns);
        info!(target: "chino::memory", turns = turns.len(), token_count, "compressing short-term memory");

        let result = self.compress_batch(store, summarizer, batch, turns, token_count).await;
        if result.is_err() {
            self.failed_compressions.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn compress_batch(
        &self,
        store: &Arc<dyn SummaryStore>,
        summarizer: &Arc<Summarizer>,
        batch: Vec<StoredTurn>,
        turns: Vec<Turn>,
        token_count: usize,
    ) -> CoreResult<CompressionOutcome> {
        let summary = summarizer.summarize(&turns).await?;
        let importance = summarizer.importance(&turns, &summary);
        let turn_count = turns.len();

        let new_summary = NewSummary {
            session_id: self.short_term.session_id(),
            summary,
            turns,
            token_count,
            importance,
            metadata: serde_json::json!({
                "compressed_at": chrono::Utc::now().to_rfc3339(),
                "message_count": turn_count,
            }),
        };
        let store = Arc::clone(store);
        let summary_id = tokio::task::spawn_blocking(move || store.add(new_summary)).await??;

        let short_term = Arc::clone(&self.short_term);
        let removed =
            tokio::task::spawn_blocking(move || short_term.remove_compressed(&batch)).await??;

        self.compressions.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "chino::memory",
            summary_id,
            turns = turn_count,
            removed,
            importance,
            "💾 compressed conversation into long-term memory"
        );

        self.bus
            .publish(
                MEMORY_FULL,
                EventPayload::MemoryFull(MemoryFull {
                    turn_count,
                    token_count,
                    threshold: self.threshold(),
                }),
            )
            .await;

        Ok(CompressionOutcome::Compressed {
            summary_id,
            turns: turn_count,
            removed,
            importance,
        })
    }

    /// Buffered turns as prompt context, minus the user turn stored from `answering`.
    pub async fn conversation_context(&self, answering: Option<String>) -> CoreResult<Vec<ContextMessage>> {
        let short_term = Arc::clone(&self.short_term);
        let turns = tokio::task::spawn_blocking(move || short_term.recent(None)).await??;
        Ok(turns
            .iter()
            .filter(|t| answering.is_none() || t.input_id() != answering.as_deref())
            .map(Turn::to_context)
            .collect())
    }

    /// Most recent summaries, newest first. A store failure yields an empty list.
    pub async fn recent_summaries(&self, limit: usize, min_importance: f32) -> Vec<Summary> {
        let Some(store) = self.long_term.clone() else {
            return Vec::new();
        };
        match tokio::task::spawn_blocking(move || store.recent(limit, min_importance)).await {
            Ok(Ok(summaries)) => summaries,
            Ok(Err(e)) => {
                warn!(target: "chino::memory", error = %e, "failed to read summaries");
                Vec::new()
            }
            Err(e) => {
                warn!(target: "chino::memory", error = %e, "summary read task failed");
                Vec::new()
            }
        }
    }

    pub async fn recent_turns(&self, count: Option<usize>) -> CoreResult<Vec<Turn>> {
        let short_term = Arc::clone(&self.short_term);
        tokio::task::spawn_blocking(move || short_term.recent(count)).await?
    }

    pub async fn clear(&self) -> CoreResult<()> {
        let short_term = Arc::clone(&self.short_term);
        tokio::task::spawn_blocking(move || short_term.clear()).await?
    }

    pub fn short_term(&self) -> &Arc<ShortTermMemory> {
        &self.short_term
    }

    pub fn long_term(&self) -> Option<&Arc<dyn SummaryStore>> {
        self.long_term.as_ref()
    }

    pub fn policy(&self) -> CompressionPolicy {
        self.policy
    }

    pub async fn stats(&self) -> CoreResult<MemoryStats> {
        let short_term = Arc::clone(&self.short_term);
        let long_term = self.long_term.clone();
        let (turns, (long_term_summaries, average_importance)) =
            tokio::task::spawn_blocking(move || -> CoreResult<_> {
                let turns = short_term.recent(None)?;
                let summaries = match long_term {
                    Some(store) => {
                        let s = store.stats()?;
                        (s.count, s.average_importance)
                    }
                    None => (0, 0.0),
                };
                Ok((turns, summaries))
            })
            .await??;
        Ok(MemoryStats {
            session_id: self.short_term.session_id(),
            short_term_turns: turns.len(),
            short_term_capacity: self.short_term.capacity(),
            estimated_tokens: estimate_turn_tokens(&turns),
            long_term_summaries,
            average_importance,
            compressions: self.compressions.load(Ordering::Relaxed),
            failed_compressions: self.failed_compressions.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SpeechReady;
    use crate::llm::{ReplySentence, ScriptedModel, ScriptedReply};
    use crate::memory::long_term::InMemorySummaryStore;
    use crate::memory::store::InMemoryListStore;

    fn manager(policy: CompressionPolicy, model: ScriptedModel) -> (Arc<EventBus>, Arc<MemoryManager>) {
        let bus = Arc::new(EventBus::new());
        let short_term = Arc::new(ShortTermMemory::new(
            Arc::new(InMemoryListStore::new()),
            "test:conversation",
            100,
        ));
        let manager = MemoryManager::new(
            Arc::clone(&bus),
            short_term,
            Some(Arc::new(InMemorySummaryStore::new())),
            Some(Arc::new(Summarizer::new(Arc::new(model)))),
            policy,
        );
        (bus, manager)
    }

    #[tokio::test]
    async fn saves_turns_from_bus_events() {
        let (bus, manager) = manager(CompressionPolicy::TurnCount(50), ScriptedModel::echo());
        manager.register();

        bus.publish(SPEECH_READY, EventPayload::SpeechReady(SpeechReady::new("hello")))
            .await;
        bus.publish(
            RESPONSE_READY,
            EventPayload::ResponseReady(ResponseReady {
                sentences: vec![ReplySentence::plain("Hi!"), ReplySentence::plain("How are you?")],
                response_id: "r1".into(),
                latency_ms: 120,
                auto_triggered: false,
            }),
        )
        .await;

        let turns = manager.recent_turns(None).await.unwrap();
        assert_eq!(turns.len(), 3);
        match (&turns[1], &turns[2]) {
            (Turn::Assistant(first), Turn::Assistant(second)) => {
                assert_eq!(first.stream_index, 0);
                assert_eq!(first.latency_ms, 120);
                assert!(!first.is_completed);
                assert_eq!(second.stream_index, 1);
                assert_eq!(second.latency_ms, 0);
                assert!(second.is_completed);
            }
            other => panic!("unexpected turns {other:?}"),
        }
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let (_bus, manager) = manager(CompressionPolicy::TurnCount(5), ScriptedModel::echo());
        manager.save_user_turn(UserInput::text("one")).await.unwrap();
        assert_eq!(
            manager.check_and_compress().await.unwrap(),
            CompressionOutcome::BelowThreshold
        );
    }

    #[tokio::test]
    async fn token_budget_policy_triggers_on_long_text() {
        let model = ScriptedModel::new(vec![ScriptedReply::Text("A long monologue.".into())]);
        let (_bus, manager) = manager(CompressionPolicy::TokenBudget(10), model);
        manager
            .save_user_turn(UserInput::text("x".repeat(80)))
            .await
            .unwrap();
        let outcome = manager.check_and_compress().await.unwrap();
        assert!(matches!(outcome, CompressionOutcome::Compressed { turns: 1, removed: 1, .. }));
        assert_eq!(manager.stats().await.unwrap().long_term_summaries, 1);
    }

    #[tokio::test]
    async fn context_leaves_out_the_turn_being_answered() {
        let (_bus, manager) = manager(CompressionPolicy::TurnCount(50), ScriptedModel::echo());
        let first = UserInput::text("first question");
        let second = UserInput::text("second question");
        let answering = second.input_id.clone();
        manager.save_user_turn(first).await.unwrap();
        manager.save_user_turn(second).await.unwrap();
        manager
            .save_response(ResponseReady {
                sentences: vec![ReplySentence::plain("You said: first question")],
                response_id: "r1".into(),
                latency_ms: 5,
                auto_triggered: false,
            })
            .await
            .unwrap();

        let context: Vec<String> = manager
            .conversation_context(Some(answering))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(context, vec!["first question", "You said: first question"]);
        assert_eq!(manager.conversation_context(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn disabled_without_long_term_store() {
        let bus = Arc::new(EventBus::new());
        let short_term = Arc::new(ShortTermMemory::new(Arc::new(InMemoryListStore::new()), "t", 10));
        let manager = MemoryManager::new(bus, short_term, None, None, CompressionPolicy::TurnCount(1));
        manager.save_user_turn(UserInput::text("a")).await.unwrap();
        assert_eq!(manager.check_and_compress().await.unwrap(), CompressionOutcome::Disabled);
        assert!(manager.recent_summaries(3, 0.0).await.is_empty());
    }
}
