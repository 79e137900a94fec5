//! Direct LLM stage: streaming chat completions over SSE.
//!
//! The model name selects the provider: `claude-*`/`anthropic-*` route
//! to Anthropic, `gpt-*`/`o1-*` to OpenAI. When the routed provider has
//! no key configured, the stage falls back to the other provider with a
//! sensible default model; with neither key it fails immediately.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-haiku-20240307";

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

const TOKEN_CHANNEL_CAPACITY: usize = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("no LLM API key configured")]
    NoProvider,
    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("LLM API error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// One entry of the dialogue buffer sent with each request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    Anthropic,
    OpenAi,
}

/// Pick the provider and effective model for a requested model name.
fn resolve_provider(
    model: &str,
    has_anthropic: bool,
    has_openai: bool,
) -> Result<(Provider, String), LlmError> {
    let wants_anthropic = model.starts_with("claude") || model.starts_with("anthropic");
    let wants_openai = model.starts_with("gpt") || model.starts_with("o1");

    if wants_anthropic {
        if has_anthropic {
            return Ok((Provider::Anthropic, model.to_string()));
        }
        if has_openai {
            return Ok((Provider::OpenAi, OPENAI_DEFAULT_MODEL.to_string()));
        }
        return Err(LlmError::NoProvider);
    }

    if wants_openai {
        if has_openai {
            return Ok((Provider::OpenAi, model.to_string()));
        }
        if has_anthropic {
            return Ok((Provider::Anthropic, ANTHROPIC_DEFAULT_MODEL.to_string()));
        }
        return Err(LlmError::NoProvider);
    }

    if has_anthropic {
        return Ok((Provider::Anthropic, ANTHROPIC_DEFAULT_MODEL.to_string()));
    }
    if has_openai {
        return Ok((Provider::OpenAi, OPENAI_DEFAULT_MODEL.to_string()));
    }
    Err(LlmError::NoProvider)
}

fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicDelta {
    #[serde(default, rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicEvent {
    #[serde(default, rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: AnthropicDelta,
}

/// Extract the text delta from one Anthropic SSE data payload.
fn parse_anthropic_data(data: &str) -> Option<String> {
    let event: AnthropicEvent = serde_json::from_str(data).ok()?;
    if event.event_type == "content_block_delta"
        && event.delta.delta_type == "text_delta"
        && !event.delta.text.is_empty()
    {
        Some(event.delta.text)
    } else {
        None
    }
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiEvent {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

/// Extract the content delta from one OpenAI SSE data payload.
fn parse_openai_data(data: &str) -> Option<String> {
    let event: OpenAiEvent = serde_json::from_str(data).ok()?;
    event
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty())
}

/// Direct LLM client holding provider credentials and a shared HTTP
/// client. Read-only after startup.
pub struct LlmClient {
    http: reqwest::Client,
    anthropic_key: String,
    openai_key: String,
}

impl LlmClient {
    pub fn new(anthropic_key: String, openai_key: String) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            anthropic_key,
            openai_key,
        }
    }

    /// Open a streaming completion for the current dialogue. Returns a
    /// channel of incremental text deltas; the channel closes at the end
    /// of the reply.
    pub async fn stream(
        &self,
        cancel: CancellationToken,
        system_prompt: &str,
        dialogue: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<String>, LlmError> {
        let (provider, model) = resolve_provider(
            model,
            !self.anthropic_key.is_empty(),
            !self.openai_key.is_empty(),
        )?;

        tracing::debug!(model = %model, provider = ?provider, "Opening LLM stream");

        match provider {
            Provider::Anthropic => {
                self.stream_anthropic(cancel, system_prompt, dialogue, &model, temperature, max_tokens)
                    .await
            }
            Provider::OpenAi => {
                self.stream_openai(cancel, system_prompt, dialogue, &model, temperature, max_tokens)
                    .await
            }
        }
    }

    async fn stream_anthropic(
        &self,
        cancel: CancellationToken,
        system_prompt: &str,
        dialogue: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<String>, LlmError> {
        let mut payload = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "system": system_prompt,
            "messages": dialogue,
            "stream": true,
        });
        if temperature > 0.0 {
            payload["temperature"] = serde_json::json!(temperature);
        }

        let response = self
            .http
            .post(ANTHROPIC_URL)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.anthropic_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %message, "Anthropic API error");
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse(cancel, response, tx, parse_anthropic_data));
        Ok(rx)
    }

    async fn stream_openai(
        &self,
        cancel: CancellationToken,
        system_prompt: &str,
        dialogue: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<String>, LlmError> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        }];
        messages.extend_from_slice(dialogue);

        let mut payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "max_tokens": max_tokens,
        });
        if temperature > 0.0 {
            payload["temperature"] = serde_json::json!(temperature);
        }

        let response = self
            .http
            .post(OPENAI_URL)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.openai_key))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %message, "OpenAI API error");
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse(cancel, response, tx, parse_openai_data));
        Ok(rx)
    }
}

/// Read an SSE response body line by line, forwarding parsed text deltas
/// until `[DONE]`, end of stream, or cancellation.
async fn pump_sse(
    cancel: CancellationToken,
    response: reqwest::Response,
    tx: mpsc::Sender<String>,
    parse: fn(&str) -> Option<String>,
) {
    let mut stream = response.bytes_stream();
    let mut buf = String::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    buf.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buf.find('\n') {
                        let line: String = buf.drain(..=pos).collect();
                        let line = line.trim();
                        let Some(data) = sse_data(line) else { continue };
                        if data == "[DONE]" {
                            return;
                        }
                        if let Some(text) = parse(data) {
                            if tx.send(text).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "LLM stream read ended");
                    return;
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_routes_by_model_prefix() {
        let (provider, model) = resolve_provider("claude-sonnet-4", true, true).unwrap();
        assert_eq!(provider, Provider::Anthropic);
        assert_eq!(model, "claude-sonnet-4");

        let (provider, model) = resolve_provider("gpt-4o-mini", true, true).unwrap();
        assert_eq!(provider, Provider::OpenAi);
        assert_eq!(model, "gpt-4o-mini");

        let (provider, _) = resolve_provider("o1-mini", true, true).unwrap();
        assert_eq!(provider, Provider::OpenAi);
    }

    #[test]
    fn resolve_falls_back_when_routed_key_missing() {
        let (provider, model) = resolve_provider("claude-sonnet-4", false, true).unwrap();
        assert_eq!(provider, Provider::OpenAi);
        assert_eq!(model, OPENAI_DEFAULT_MODEL);

        let (provider, model) = resolve_provider("gpt-4o", true, false).unwrap();
        assert_eq!(provider, Provider::Anthropic);
        assert_eq!(model, ANTHROPIC_DEFAULT_MODEL);
    }

    #[test]
    fn resolve_unknown_model_prefers_anthropic() {
        let (provider, model) = resolve_provider("mistral-large", true, true).unwrap();
        assert_eq!(provider, Provider::Anthropic);
        assert_eq!(model, ANTHROPIC_DEFAULT_MODEL);

        let (provider, model) = resolve_provider("mistral-large", false, true).unwrap();
        assert_eq!(provider, Provider::OpenAi);
        assert_eq!(model, OPENAI_DEFAULT_MODEL);
    }

    #[test]
    fn resolve_without_keys_fails() {
        assert!(matches!(
            resolve_provider("gpt-4o", false, false),
            Err(LlmError::NoProvider)
        ));
    }

    #[test]
    fn sse_data_strips_prefix() {
        assert_eq!(sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(sse_data("event: ping"), None);
        assert_eq!(sse_data(""), None);
    }

    #[test]
    fn anthropic_text_delta_parsed() {
        let data = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(parse_anthropic_data(data), Some("Hi".to_string()));
    }

    #[test]
    fn anthropic_non_text_events_skipped() {
        let cases = [
            r#"{"type":"message_start","message":{}}"#,
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":""}}"#,
            "not json",
        ];
        for data in cases {
            assert_eq!(parse_anthropic_data(data), None, "for {data}");
        }
    }

    #[test]
    fn openai_content_delta_parsed() {
        let data = r#"{"choices":[{"delta":{"content":"How"},"finish_reason":null}]}"#;
        assert_eq!(parse_openai_data(data), Some("How".to_string()));
    }

    #[test]
    fn openai_empty_and_missing_deltas_skipped() {
        let cases = [
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[{"delta":{"content":""}}]}"#,
            r#"{"choices":[]}"#,
            "not json",
        ];
        for data in cases {
            assert_eq!(parse_openai_data(data), None, "for {data}");
        }
    }

    #[test]
    fn chat_message_constructors() {
        let user = ChatMessage::user("hello there");
        assert_eq!(user.role, "user");
        assert_eq!(user.content, "hello there");

        let assistant = ChatMessage::assistant("Hi!");
        assert_eq!(assistant.role, "assistant");
    }

    #[tokio::test]
    async fn stream_without_keys_fails() {
        let client = LlmClient::new(String::new(), String::new());
        let result = client
            .stream(
                CancellationToken::new(),
                "system",
                &[ChatMessage::user("hi")],
                "gpt-4o-mini",
                0.7,
                256,
            )
            .await;
        assert!(matches!(result, Err(LlmError::NoProvider)));
    }
}
