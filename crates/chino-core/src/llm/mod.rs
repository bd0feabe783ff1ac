//! Language-model collaborators.
//!
//! The dialog orchestrator and the summarizer only see [`LanguageModel`]. Which
//! concrete backend sits behind it is decided once, at startup, by [`LlmBackend::from_config`].

mod openai;
mod scripted;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{LlmConfig, LlmMode};
use crate::error::{CoreError, CoreResult};

pub use openai::ChatCompletionClient;
pub use scripted::{ScriptedModel, ScriptedReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Per-call sampling overrides. `None` falls back to the backend's configured value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One sentence of a structured reply, as emitted on a single NDJSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplySentence {
    /// Emotion the model read from the user. Optional on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_emo: Option<String>,
    pub text_spoken: String,
    pub text_display: String,
    #[serde(rename = "emo")]
    pub emotion: String,
    #[serde(rename = "act")]
    pub action: String,
    pub intensity: f32,
}

impl ReplySentence {
    /// A plain sentence with neutral delivery.
    pub fn plain(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            user_emo: None,
            text_display: text.clone(),
            text_spoken: text,
            emotion: "normal".to_string(),
            action: "none".to_string(),
            intensity: 0.5,
        }
    }
}

/// Streamed text fragments.
pub type FragmentStream = BoxStream<'static, CoreResult<String>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// One full completion.
    async fn complete(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
    ) -> CoreResult<String>;

    /// Completion as incremental fragments. Default: a single fragment.
    async fn stream(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
    ) -> CoreResult<FragmentStream> {
        let text = self.complete(messages, options).await?;
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }

    /// Completion parsed into reply sentences.
    async fn generate_sentences(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
    ) -> CoreResult<Vec<ReplySentence>> {
        let raw = self.complete(messages, options).await?;
        Ok(parse_sentence_lines(&raw))
    }
}

/// Parse line-delimited JSON sentences. Code fences, blank lines and any line that
/// is not a complete sentence object are skipped.
pub fn parse_sentence_lines(raw: &str) -> Vec<ReplySentence> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("```") {
            continue;
        }
        match serde_json::from_str::<ReplySentence>(line) {
            Ok(sentence) => out.push(sentence),
            Err(e) => debug!(target: "chino::llm", error = %e, line, "skipping reply line"),
        }
    }
    if out.is_empty() && !raw.trim().is_empty() {
        warn!(target: "chino::llm", "model reply contained no parseable sentences");
    }
    out
}

/// The closed set of model backends.
pub enum LlmBackend {
    Mock(ScriptedModel),
    Local(ChatCompletionClient),
    OpenRouter(ChatCompletionClient),
}

impl LlmBackend {
    /// Build the backend for `mode`. OpenRouter without an API key is a configuration error.
    pub fn from_config(mode: LlmMode, config: &LlmConfig) -> CoreResult<Self> {
        Self::from_config_with(mode, config, |key| std::env::var(key).ok())
    }

    /// `from_config` reading environment fallbacks through `lookup`.
    pub fn from_config_with<F>(mode: LlmMode, config: &LlmConfig, lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        match mode {
            LlmMode::Mock => Ok(LlmBackend::Mock(ScriptedModel::echo())),
            LlmMode::Local => Ok(LlmBackend::Local(ChatCompletionClient::local(config)?)),
            LlmMode::OpenRouter => {
                let key = config.resolved_api_key_with(lookup).ok_or_else(|| {
                    CoreError::Config(
                        "openrouter mode requires llm.api_key or OPENROUTER_API_KEY".into(),
                    )
                })?;
                Ok(LlmBackend::OpenRouter(ChatCompletionClient::openrouter(config, key)?))
            }
        }
    }

    pub fn mode(&self) -> LlmMode {
        match self {
            LlmBackend::Mock(_) => LlmMode::Mock,
            LlmBackend::Local(_) => LlmMode::Local,
            LlmBackend::OpenRouter(_) => LlmMode::OpenRouter,
        }
    }

    fn inner(&self) -> &dyn LanguageModel {
        match self {
            LlmBackend::Mock(m) => m as &dyn LanguageModel,
            LlmBackend::Local(c) | LlmBackend::OpenRouter(c) => c as &dyn LanguageModel,
        }
    }
}

#[async_trait]
impl LanguageModel for LlmBackend {
    fn name(&self) -> &str {
        self.inner().name()
    }

    async fn complete(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
    ) -> CoreResult<String> {
        self.inner().complete(messages, options).await
    }

    async fn stream(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
    ) -> CoreResult<FragmentStream> {
        self.inner().stream(messages, options).await
    }

    async fn generate_sentences(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
    ) -> CoreResult<Vec<ReplySentence>> {
        self.inner().generate_sentences(messages, options).await
    }
}
