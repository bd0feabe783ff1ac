//! Event names and typed payloads carried on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::ReplySentence;

/// A final transcript segment is available (voice pipeline or text input).
pub const SPEECH_READY: &str = "speech_ready";
/// The dialog orchestrator produced a reply.
pub const RESPONSE_READY: &str = "response_ready";
/// The user started speaking over the assistant.
pub const INTERRUPT: &str = "interrupt";
/// The memory manager compressed the short-term buffer.
pub const MEMORY_FULL: &str = "memory_full";
/// The process is shutting down.
pub const SYSTEM_SHUTDOWN: &str = "system_shutdown";

/// Subscribing to this name receives every event.
pub const WILDCARD: &str = "*";

/// Payload schema version stamped on every event.
pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechReady {
    pub text: String,
    pub lang: String,
    /// `mic`, `text`, `api`, ...
    pub source: String,
    pub emotion: String,
    /// Identifies this utterance in the short-term buffer.
    #[serde(default = "new_input_id")]
    pub input_id: String,
}

/// A fresh id for an utterance entering the dialog.
pub fn new_input_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl SpeechReady {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            lang: "en".to_string(),
            source: "mic".to_string(),
            emotion: "normal".to_string(),
            input_id: new_input_id(),
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = emotion.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseReady {
    pub sentences: Vec<ReplySentence>,
    pub response_id: String,
    pub latency_ms: u64,
    pub auto_triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub reason: String,
    pub source: String,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self {
            reason: "user_speaking".to_string(),
            source: "vad".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFull {
    /// Turns folded into the new summary.
    pub turn_count: usize,
    pub token_count: usize,
    pub threshold: usize,
}

/// Closed set of payloads. `Custom` carries anything else as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    SpeechReady(SpeechReady),
    ResponseReady(ResponseReady),
    Interrupt(Interrupt),
    MemoryFull(MemoryFull),
    Shutdown,
    Custom(serde_json::Value),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SpeechReady(_) => "speech_ready",
            EventPayload::ResponseReady(_) => "response_ready",
            EventPayload::Interrupt(_) => "interrupt",
            EventPayload::MemoryFull(_) => "memory_full",
            EventPayload::Shutdown => "shutdown",
            EventPayload::Custom(_) => "custom",
        }
    }
}

/// An immutable published event. Shared between handlers as `Arc<Event>`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: String,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            name: name.into(),
            version: EVENT_VERSION,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn speech_ready(&self) -> Option<&SpeechReady> {
        match &self.payload {
            EventPayload::SpeechReady(p) => Some(p),
            _ => None,
        }
    }

    pub fn response_ready(&self) -> Option<&ResponseReady> {
        match &self.payload {
            EventPayload::ResponseReady(p) => Some(p),
            _ => None,
        }
    }

    pub fn interrupt(&self) -> Option<&Interrupt> {
        match &self.payload {
            EventPayload::Interrupt(p) => Some(p),
            _ => None,
        }
    }

    pub fn memory_full(&self) -> Option<&MemoryFull> {
        match &self.payload {
            EventPayload::MemoryFull(p) => Some(p),
            _ => None,
        }
    }
}

/// One line of bus history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub payload_kind: String,
}
