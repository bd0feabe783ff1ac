//! Conversation turns as stored in the short-term buffer.

use serde::{Deserialize, Serialize};

use crate::bus::{new_input_id, SpeechReady};
use crate::llm::ReplySentence;

/// Text entering the dialog, from the voice pipeline or an API caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    pub text: String,
    #[serde(default = "default_emotion")]
    pub emotion: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "new_input_id")]
    pub input_id: String,
}

fn default_emotion() -> String {
    "normal".to_string()
}

fn default_lang() -> String {
    "en".to_string()
}

fn default_source() -> String {
    "text".to_string()
}

impl UserInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            emotion: default_emotion(),
            lang: default_lang(),
            source: default_source(),
            input_id: new_input_id(),
        }
    }
}

impl From<&SpeechReady> for UserInput {
    fn from(p: &SpeechReady) -> Self {
        Self {
            text: p.text.clone(),
            emotion: p.emotion.clone(),
            lang: p.lang.clone(),
            source: p.source.clone(),
            input_id: p.input_id.clone(),
        }
    }
}

impl From<UserInput> for SpeechReady {
    fn from(input: UserInput) -> Self {
        SpeechReady {
            text: input.text,
            lang: input.lang,
            source: input.source,
            emotion: input.emotion,
            input_id: input.input_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTurn {
    pub session_id: String,
    pub message: String,
    pub emotion: String,
    pub lang: String,
    pub source: String,
    /// The user spoke over the assistant.
    pub interrupt: bool,
    pub timestamp_ms: i64,
    /// The `UserInput` this turn was stored from. Empty for turns written before ids existed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input_id: String,
}

/// One sentence of an assistant reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub session_id: String,
    pub response_id: String,
    pub stream_index: usize,
    /// Set on the last sentence of the reply.
    pub is_completed: bool,
    pub text_spoken: String,
    pub text_display: String,
    pub lang: String,
    pub emotion: String,
    pub action: String,
    pub intensity: f32,
    /// Model latency; only the first sentence of a reply carries it.
    pub latency_ms: u64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User(UserTurn),
    Assistant(AssistantTurn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    User,
    Assistant,
}

/// Minimal view of a turn for prompt building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
    pub emotion: String,
}

impl Turn {
    pub fn role(&self) -> ContextRole {
        match self {
            Turn::User(_) => ContextRole::User,
            Turn::Assistant(_) => ContextRole::Assistant,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Turn::User(u) => &u.message,
            Turn::Assistant(a) => &a.text_display,
        }
    }

    pub fn emotion(&self) -> &str {
        match self {
            Turn::User(u) => &u.emotion,
            Turn::Assistant(a) => &a.emotion,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Turn::User(u) => u.timestamp_ms,
            Turn::Assistant(a) => a.timestamp_ms,
        }
    }

    /// The input a user turn was stored from.
    pub fn input_id(&self) -> Option<&str> {
        match self {
            Turn::User(u) if !u.input_id.is_empty() => Some(&u.input_id),
            _ => None,
        }
    }

    pub fn to_context(&self) -> ContextMessage {
        ContextMessage {
            role: self.role(),
            content: self.content().to_string(),
            emotion: self.emotion().to_string(),
        }
    }
}

/// Fields of an assistant turn that come from the reply, not the session.
#[derive(Debug, Clone)]
pub struct AssistantSentence<'a> {
    pub response_id: &'a str,
    pub stream_index: usize,
    pub is_completed: bool,
    pub sentence: &'a ReplySentence,
    pub lang: &'a str,
    pub latency_ms: u64,
}

/// Rough token estimate: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn estimate_turn_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(|t| estimate_tokens(t.content())).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_json_is_role_tagged() {
        let turn = Turn::User(UserTurn {
            session_id: "session_1".into(),
            message: "hello".into(),
            emotion: "happy".into(),
            lang: "en".into(),
            source: "mic".into(),
            interrupt: false,
            timestamp_ms: 10,
            input_id: "in-1".into(),
        });
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "user");
        let back: Turn = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);
        assert_eq!(back.to_context().content, "hello");
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }
}
