//! Session-scoped, capacity-bounded conversation buffer.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::store::ShortTermStore;
use super::turn::{AssistantSentence, AssistantTurn, Turn, UserInput, UserTurn};
use crate::error::CoreResult;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A raw stored entry next to its decoded turn. Compression trims by the raw form.
#[derive(Debug, Clone)]
pub struct StoredTurn {
    pub raw: String,
    pub turn: Turn,
}

pub struct ShortTermMemory {
    store: Arc<dyn ShortTermStore>,
    key_prefix: String,
    capacity: usize,
    session_id: RwLock<Option<String>>,
    last_timestamp_ms: AtomicI64,
    // serializes append vs. prefix removal so a trim never races an eviction
    write_lock: Mutex<()>,
}

impl ShortTermMemory {
    pub fn new(store: Arc<dyn ShortTermStore>, key_prefix: impl Into<String>, capacity: usize) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            capacity: capacity.max(1),
            session_id: RwLock::new(None),
            last_timestamp_ms: AtomicI64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current session id, starting one if none is active.
    pub fn session_id(&self) -> String {
        if let Some(id) = self
            .session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return id.clone();
        }
        let mut slot = self.session_id.write().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert_with(Self::fresh_session_id).clone()
    }

    /// Begin a new session. The previous session's buffer stays in the store.
    pub fn start_new_session(&self) -> String {
        let id = Self::fresh_session_id();
        *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        info!(target: "chino::memory", session = %id, "started session");
        id
    }

    /// Continue an earlier session, e.g. after a restart on a persistent store.
    pub fn resume_session(&self, id: impl Into<String>) {
        let id = id.into();
        info!(target: "chino::memory", session = %id, "resumed session");
        *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    pub fn flush(&self) -> CoreResult<()> {
        self.store.flush()
    }

    fn fresh_session_id() -> String {
        format!("session_{}", now_ms() / 1000)
    }

    fn key(&self) -> String {
        format!("{}:{}", self.key_prefix, self.session_id())
    }

    // never goes backwards within a session, even if the wall clock does
    fn next_timestamp(&self) -> i64 {
        let now = now_ms();
        let prev = self.last_timestamp_ms.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }

    fn push(&self, turn: &Turn) -> CoreResult<usize> {
        let raw = serde_json::to_string(turn)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.append_bounded(&self.key(), raw, self.capacity)
    }

    pub fn add_user(&self, input: &UserInput, interrupt: bool) -> CoreResult<Turn> {
        let turn = Turn::User(UserTurn {
            session_id: self.session_id(),
            message: input.text.clone(),
            emotion: input.emotion.clone(),
            lang: input.lang.clone(),
            source: input.source.clone(),
            interrupt,
            timestamp_ms: self.next_timestamp(),
            input_id: input.input_id.clone(),
        });
        let len = self.push(&turn)?;
        debug!(target: "chino::memory", len, "stored user turn");
        Ok(turn)
    }

    pub fn add_assistant(&self, entry: AssistantSentence<'_>) -> CoreResult<Turn> {
        let s = entry.sentence;
        let turn = Turn::Assistant(AssistantTurn {
            session_id: self.session_id(),
            response_id: entry.response_id.to_string(),
            stream_index: entry.stream_index,
            is_completed: entry.is_completed,
            text_spoken: s.text_spoken.clone(),
            text_display: s.text_display.clone(),
            lang: entry.lang.to_string(),
            emotion: s.emotion.clone(),
            action: s.action.clone(),
            intensity: s.intensity,
            latency_ms: entry.latency_ms,
            timestamp_ms: self.next_timestamp(),
        });
        let len = self.push(&turn)?;
        debug!(target: "chino::memory", len, index = entry.stream_index, "stored assistant turn");
        Ok(turn)
    }

    pub fn snapshot(&self) -> CoreResult<Vec<StoredTurn>> {
        let raw = self.store.range(&self.key(), 0, -1)?;
        let mut out = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str::<Turn>(&entry) {
                Ok(turn) => out.push(StoredTurn { raw: entry, turn }),
                Err(e) => warn!(target: "chino::memory", error = %e, "skipping undecodable turn"),
            }
        }
        Ok(out)
    }

    /// The last `count` turns (all when `None`), oldest first.
    pub fn recent(&self, count: Option<usize>) -> CoreResult<Vec<Turn>> {
        let turns: Vec<Turn> = self.snapshot()?.into_iter().map(|s| s.turn).collect();
        Ok(match count {
            Some(n) if n < turns.len() => turns[turns.len() - n..].to_vec(),
            _ => turns,
        })
    }

    pub fn len(&self) -> CoreResult<usize> {
        self.store.len(&self.key())
    }

    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop the buffer and start a fresh session.
    pub fn clear(&self) -> CoreResult<()> {
        {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.store.delete(&self.key())?;
        }
        *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!(target: "chino::memory", "short-term buffer cleared");
        Ok(())
    }

    /// Remove exactly the turns of `batch` that are still at the front of the buffer.
    ///
    /// Turns appended after the snapshot are kept. Batch turns already evicted by the
    /// capacity bound are simply gone. Returns the number removed.
    pub fn remove_compressed(&self, batch: &[StoredTurn]) -> CoreResult<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let key = self.key();
        let current = self.store.range(&key, 0, -1)?;

        // the surviving part of the batch is a suffix of it sitting at the front of `current`
        let mut remove = 0;
        for k in (1..=batch.len().min(current.len())).rev() {
            let tail = &batch[batch.len() - k..];
            if tail.iter().zip(&current[..k]).all(|(b, c)| b.raw == *c) {
                remove = k;
                break;
            }
        }
        if remove > 0 {
            self.store.trim(&key, remove as i64, -1)?;
        }
        Ok(remove)
    }
}
