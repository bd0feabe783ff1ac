//! Prompt assembly for dialog turns.

use crate::llm::PromptMessage;
use crate::memory::{ContextMessage, ContextRole, Summary};

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are Chino, a calm, polite and slightly shy voice companion.
Answer in short spoken sentences. Output one JSON object per line and nothing else:
{"user_emo": "<emotion you read from the user>", "text_spoken": "<text for speech>", "text_display": "<text for the screen>", "emo": "<your emotion>", "act": "<gesture or none>", "intensity": <0.0-1.0>}
Use 1 to 4 lines per reply."#;

pub const AUTO_TRIGGER_INSTRUCTION: &str =
    "[Auto-trigger: User has been quiet. Initiate conversation naturally.]";

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// What the new turn is answering.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptInput {
    User(String),
    AutoTrigger,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    history_limit: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(None, DEFAULT_HISTORY_LIMIT)
    }
}

impl PromptBuilder {
    pub fn new(system_prompt: Option<String>, history_limit: usize) -> Self {
        Self {
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            history_limit,
        }
    }

    /// System prompt, then summaries (if any), then the last `history_limit` turns,
    /// then the new message or the auto-trigger instruction. `history` must not
    /// already contain the message being answered.
    pub fn build(
        &self,
        history: &[ContextMessage],
        summaries: &[Summary],
        input: &PromptInput,
    ) -> Vec<PromptMessage> {
        let mut messages = vec![PromptMessage::system(self.system_prompt.clone())];

        if !summaries.is_empty() {
            let lines: Vec<String> = summaries.iter().map(|s| format!("- {}", s.summary)).collect();
            messages.push(PromptMessage::system(format!(
                "Recent conversation summaries:\n{}",
                lines.join("\n")
            )));
        }

        let skip = history.len().saturating_sub(self.history_limit);
        for turn in &history[skip..] {
            messages.push(match turn.role {
                ContextRole::User => PromptMessage::user(format!(
                    "[User emotion: {}] {}",
                    turn.emotion, turn.content
                )),
                ContextRole::Assistant => PromptMessage::assistant(turn.content.clone()),
            });
        }

        messages.push(match input {
            PromptInput::User(text) => PromptMessage::user(text.clone()),
            PromptInput::AutoTrigger => PromptMessage::user(AUTO_TRIGGER_INSTRUCTION),
        });
        messages
    }
}
