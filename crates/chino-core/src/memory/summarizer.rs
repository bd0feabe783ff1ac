//! Folds a batch of turns into one short summary and scores its importance.

use std::sync::Arc;

use tracing::{debug, warn};

use super::turn::Turn;
use crate::error::CoreResult;
use crate::llm::{GenerationOptions, LanguageModel, PromptMessage};

const DEFAULT_SYSTEM_PROMPT: &str = "You compress conversations between a user and a voice assistant. \
Write two or three plain sentences capturing the facts, preferences, feelings and open threads the \
assistant should remember. No lists, no preamble.";

const SUMMARY_TEMPERATURE: f32 = 0.3;
const SUMMARY_MAX_TOKENS: u32 = 200;

const BASELINE: f32 = 0.5;
const EMOTION_WEIGHT: f32 = 0.10;
const MARKER_WEIGHT: f32 = 0.15;
const LONG_BATCH_WEIGHT: f32 = 0.10;
const LONG_BATCH_TURNS: usize = 10;

const EMOTION_KEYWORDS: &[&str] = &[
    "happy", "sad", "angry", "worried", "excited", "vui", "buồn", "giận", "hạnh phúc", "lo lắng",
];

const MARKER_KEYWORDS: &[&str] = &[
    "important", "remember", "love", "hate", "thank", "quan trọng", "nhớ", "yêu", "ghét", "cảm ơn",
];

pub struct Summarizer {
    model: Arc<dyn LanguageModel>,
    system_prompt: String,
}

impl Summarizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Summarize `turns`. A model failure is returned to the caller; an empty
    /// completion falls back to a count-based summary.
    pub async fn summarize(&self, turns: &[Turn]) -> CoreResult<String> {
        let messages = vec![
            PromptMessage::system(self.system_prompt.clone()),
            PromptMessage::user(format!(
                "Summarize this conversation:\n\n{}",
                format_transcript(turns)
            )),
        ];
        let options = GenerationOptions {
            temperature: Some(SUMMARY_TEMPERATURE),
            max_tokens: Some(SUMMARY_MAX_TOKENS),
            ..GenerationOptions::default()
        };

        let summary = self.model.complete(&messages, &options).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            warn!(target: "chino::memory", "empty summary from model, using fallback");
            return Ok(fallback_summary(turns));
        }
        debug!(target: "chino::memory", chars = summary.len(), "summary generated");
        Ok(summary.to_string())
    }

    /// Score in `[0, 1]`: a baseline, raised by emotional and "remember this" markers
    /// in the summary and by long batches.
    pub fn importance(&self, turns: &[Turn], summary: &str) -> f32 {
        score_importance(turns.len(), summary)
    }
}

pub fn score_importance(turn_count: usize, summary: &str) -> f32 {
    let text = summary.to_lowercase();
    let mut score = BASELINE;
    score += EMOTION_WEIGHT * EMOTION_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as f32;
    score += MARKER_WEIGHT * MARKER_KEYWORDS.iter().filter(|k| text.contains(*k)).count() as f32;
    if turn_count >= LONG_BATCH_TURNS {
        score += LONG_BATCH_WEIGHT;
    }
    score.clamp(0.0, 1.0)
}

/// One line per turn: `User [emotion]: text` / `Assistant [emotion]: text`.
pub fn format_transcript(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| match t {
            Turn::User(u) => format!("User [{}]: {}", u.emotion, u.message),
            Turn::Assistant(a) => format!("Assistant [{}]: {}", a.emotion, a.text_display),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn fallback_summary(turns: &[Turn]) -> String {
    let users = turns.iter().filter(|t| matches!(t, Turn::User(_))).count();
    let assistants = turns.len() - users;
    format!("Conversation with {users} user messages and {assistants} assistant responses.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedModel, ScriptedReply};
    use crate::memory::turn::{AssistantTurn, UserTurn};

    fn user(text: &str, emotion: &str) -> Turn {
        Turn::User(UserTurn {
            session_id: "s".into(),
            message: text.into(),
            emotion: emotion.into(),
            lang: "en".into(),
            source: "text".into(),
            interrupt: false,
            timestamp_ms: 0,
            input_id: String::new(),
        })
    }

    fn assistant(text: &str) -> Turn {
        Turn::Assistant(AssistantTurn {
            session_id: "s".into(),
            response_id: "r".into(),
            stream_index: 0,
            is_completed: true,
            text_spoken: text.into(),
            text_display: text.into(),
            lang: "en".into(),
            emotion: "happy".into(),
            action: "none".into(),
            intensity: 0.5,
            latency_ms: 0,
            timestamp_ms: 0,
        })
    }

    #[test]
    fn transcript_format() {
        let turns = vec![user("hi", "normal"), assistant("hello!")];
        assert_eq!(format_transcript(&turns), "User [normal]: hi\nAssistant [happy]: hello!");
        assert_eq!(
            fallback_summary(&turns),
            "Conversation with 1 user messages and 1 assistant responses."
        );
    }

    #[test]
    fn importance_scoring() {
        assert_eq!(score_importance(2, "They talked about the weather."), 0.5);
        assert!((score_importance(2, "The user was sad.") - 0.6).abs() < 1e-6);
        assert!((score_importance(2, "Remember: user is happy.") - 0.75).abs() < 1e-6);
        assert!((score_importance(12, "Nothing notable.") - 0.6).abs() < 1e-6);
        assert_eq!(
            score_importance(12, "happy sad angry worried excited; remember, important, love, thank"),
            1.0
        );
    }

    #[tokio::test]
    async fn summarize_uses_model_output() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::Text(
            "  The user said hi.  ".into(),
        )]));
        let summarizer = Summarizer::new(model.clone());
        let summary = summarizer.summarize(&[user("hi", "normal")]).await.unwrap();
        assert_eq!(summary, "The user said hi.");

        let prompt = &model.prompts()[0];
        assert!(prompt[1].content.starts_with("Summarize this conversation:\n\nUser [normal]: hi"));
    }

    #[tokio::test]
    async fn empty_completion_falls_back() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::Text("   ".into())]));
        let summary = Summarizer::new(model)
            .summarize(&[user("a", "normal"), assistant("b")])
            .await
            .unwrap();
        assert_eq!(summary, "Conversation with 1 user messages and 1 assistant responses.");
    }

    #[tokio::test]
    async fn model_failure_propagates() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::Fail("down".into())]));
        assert!(Summarizer::new(model).summarize(&[user("a", "normal")]).await.is_err());
    }
}
