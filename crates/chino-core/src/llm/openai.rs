//! OpenAI-compatible chat completions over HTTP.
//!
//! Serves both the hosted OpenRouter endpoint and local servers that speak the same
//! protocol (llama.cpp server, vLLM, Ollama's `/v1`). Streaming reads SSE `data:` lines
//! until `[DONE]`.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FragmentStream, GenerationOptions, LanguageModel, PromptMessage};
use crate::config::LlmConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(SseLine::Fragment)
            .unwrap_or(SseLine::Skip),
        Err(_) => SseLine::Skip,
    }
}

/// Chat-completions client. Construct with [`ChatCompletionClient::openrouter`] or
/// [`ChatCompletionClient::local`].
pub struct ChatCompletionClient {
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    extra_headers: Vec<(&'static str, String)>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl ChatCompletionClient {
    pub fn openrouter(config: &LlmConfig, api_key: String) -> CoreResult<Self> {
        Ok(Self {
            name: format!("openrouter:{}", config.model),
            base_url: config.openrouter_base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: Some(api_key),
            extra_headers: vec![
                ("HTTP-Referer", config.referer.clone()),
                ("X-Title", config.app_title.clone()),
            ],
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            client: Self::http_client(config)?,
        })
    }

    pub fn local(config: &LlmConfig) -> CoreResult<Self> {
        Ok(Self {
            name: format!("local:{}", config.local_model),
            base_url: config.local_base_url.trim_end_matches('/').to_string(),
            model: config.local_model.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            extra_headers: Vec::new(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            client: Self::http_client(config)?,
        })
    }

    fn http_client(config: &LlmConfig) -> CoreResult<reqwest::Client> {
        Ok(reqwest::Client::builder().timeout(config.timeout()).build()?)
    }

    async fn send(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
        stream: bool,
    ) -> CoreResult<reqwest::Response> {
        let body = ChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: options.temperature.unwrap_or(self.temperature),
            top_p: options.top_p.unwrap_or(self.top_p),
            max_tokens: options.max_tokens.unwrap_or(self.max_tokens),
            stream,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        for (name, value) in &self.extra_headers {
            request = request.header(*name, value);
        }

        debug!(target: "chino::llm", model = %self.model, messages = messages.len(), stream, "chat request");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::LanguageModel(format!(
                "{} returned {}: {}",
                self.name, status, text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
    ) -> CoreResult<String> {
        let response: ChatResponse = self.send(messages, options, false).await?.json().await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CoreError::LanguageModel(format!("{} returned no choices", self.name)))
    }

    async fn stream(
        &self,
        messages: &[PromptMessage],
        options: &GenerationOptions,
    ) -> CoreResult<FragmentStream> {
        let bytes = Box::pin(self.send(messages, options, true).await?.bytes_stream());

        struct State<S> {
            bytes: S,
            buffer: Vec<u8>,
            pending: VecDeque<String>,
            done: bool,
        }

        let state = State {
            bytes,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let fragments = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(fragment) = st.pending.pop_front() {
                    return Some((Ok(fragment), st));
                }
                if st.done {
                    return None;
                }
                match st.bytes.next().await {
                    Some(Ok(chunk)) => {
                        st.buffer.extend_from_slice(&chunk);
                        while let Some(pos) = st.buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = st.buffer.drain(..=pos).collect();
                            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                                SseLine::Fragment(text) => st.pending.push_back(text),
                                SseLine::Done => {
                                    st.done = true;
                                    break;
                                }
                                SseLine::Skip => {}
                            }
                        }
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(CoreError::from(e)), st));
                    }
                    None => {
                        if let SseLine::Fragment(text) =
                            parse_sse_line(&String::from_utf8_lossy(&st.buffer))
                        {
                            st.pending.push_back(text);
                        }
                        st.buffer.clear();
                        st.done = true;
                    }
                }
            }
        });

        Ok(Box::pin(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            SseLine::Fragment("Hel".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#), SseLine::Skip);
        assert_eq!(parse_sse_line("data: {broken"), SseLine::Skip);
    }

    #[test]
    fn openrouter_client_carries_attribution_headers() {
        let cfg = LlmConfig::default();
        let client = ChatCompletionClient::openrouter(&cfg, "sk-test".into()).unwrap();
        assert_eq!(client.name(), "openrouter:meta-llama/llama-3.3-70b-instruct");
        let names: Vec<_> = client.extra_headers.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["HTTP-Referer", "X-Title"]);
    }

    #[test]
    fn local_client_ignores_blank_key() {
        let cfg = LlmConfig {
            api_key: Some("".into()),
            local_base_url: "http://127.0.0.1:8080/v1/".into(),
            ..LlmConfig::default()
        };
        let client = ChatCompletionClient::local(&cfg).unwrap();
        assert!(client.api_key.is_none());
        assert_eq!(client.base_url, "http://127.0.0.1:8080/v1");
    }
}
