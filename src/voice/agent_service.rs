//! Client for the external tool-using agent microservice.
//!
//! The service keeps a server-side agent session keyed by our session id;
//! each user turn is posted as a message and the reply streams back as
//! SSE. Failure to create a session must never fail the voice session;
//! the orchestrator falls back to the direct LLM path.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TOKEN_CHANNEL_CAPACITY: usize = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ToolAgentError {
    #[error("tool-agent service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("tool-agent service error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// Configuration posted when creating a server-side agent session.
#[derive(Debug, Clone, Serialize)]
pub struct ToolAgentConfig {
    pub session_id: String,
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAgentResponse {
    pub session_id: String,
    #[serde(default)]
    pub status: String,
}

/// HTTP client for the tool-agent microservice.
pub struct ToolAgentClient {
    http: reqwest::Client,
    base_url: String,
}

impl ToolAgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Probe service availability.
    pub async fn health(&self) -> Result<(), ToolAgentError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolAgentError::Api {
                status: status.as_u16(),
                message: "unhealthy".to_string(),
            });
        }
        Ok(())
    }

    /// Create an agent session on the service.
    pub async fn create_agent(
        &self,
        config: &ToolAgentConfig,
    ) -> Result<CreateAgentResponse, ToolAgentError> {
        let response = self
            .http
            .post(format!("{}/agents/create", self.base_url))
            .json(config)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %message, "Failed to create tool agent");
            return Err(ToolAgentError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let result: CreateAgentResponse = response.json().await?;
        tracing::info!(session_id = %result.session_id, "Tool agent session created");
        Ok(result)
    }

    /// Post one user message and stream the reply as text chunks.
    pub async fn stream(
        &self,
        cancel: CancellationToken,
        session_id: &str,
        message: &str,
    ) -> Result<mpsc::Receiver<String>, ToolAgentError> {
        let body = serde_json::json!({
            "session_id": session_id,
            "message": message,
        });

        let response = self
            .http
            .post(format!("{}/agents/stream", self.base_url))
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ToolAgentError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(async move {
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
                                let Some(data) = line.strip_prefix("data: ") else {
                                    continue;
                                };
                                if data == "[DONE]" {
                                    return;
                                }
                                if data.starts_with("[ERROR]") {
                                    tracing::warn!(error = data, "Tool agent stream error");
                                    return;
                                }
                                if tx.send(data.to_string()).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "Tool agent stream read ended");
                            return;
                        }
                        None => return,
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Delete the server-side agent session. Best effort at session close.
    pub async fn delete_agent(&self, session_id: &str) -> Result<(), ToolAgentError> {
        let response = self
            .http
            .delete(format!("{}/agents/{}", self.base_url, session_id))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolAgentError::Api {
                status: status.as_u16(),
                message: "delete failed".to_string(),
            });
        }
        tracing::debug!(session_id = session_id, "Tool agent session deleted");
        Ok(())
    }
}
