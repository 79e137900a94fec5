//! Domain records shared by the gateway, the voice pipeline, and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration of a voice agent, immutable for the lifetime of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: Uuid,
    pub name: String,
    /// Industry slug, used to resolve tool capabilities
    /// (e.g. `customer-support`, `sales`).
    pub industry: String,
    pub is_active: bool,

    /// System prompt sent to the LLM on every turn.
    pub system_prompt: String,
    /// Greeting delivered in the `ready` event.
    pub greeting: String,

    /// LLM model name; the prefix selects the provider.
    pub llm_model: String,
    /// Sampling temperature, 0.0..=2.0.
    pub temperature: f64,
    /// Maximum output tokens per reply.
    pub max_tokens: u32,

    /// TTS voice id.
    pub voice_id: String,
    /// Speaking speed multiplier.
    pub voice_speed: f64,

    /// How eagerly the agent yields to the user, 0.0..=1.0.
    pub interruption_sensitivity: f64,
    /// Silence before the agent considers a turn finished, in ms.
    pub silence_timeout_ms: u64,
}

impl AgentConfig {
    /// An agent with sensible defaults, used for development seeding
    /// and tests.
    pub fn demo() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "Demo Agent".to_string(),
            industry: "customer-support".to_string(),
            is_active: true,
            system_prompt: "You are a friendly, concise voice assistant. \
                            Keep answers short enough to speak aloud."
                .to_string(),
            greeting: "Hello! How can I help you today?".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            voice_id: String::new(),
            voice_speed: 1.0,
            interruption_sensitivity: 0.5,
            silence_timeout_ms: 5000,
        }
    }
}

/// Speaker role of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn from_str_role(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Overall sentiment label assigned to a finished conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    pub fn from_str_label(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }
}

/// A persisted voice conversation. Created when a session is accepted,
/// finalized exactly once when it closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Opaque per-connection identifier, unique across conversations.
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: i64,
    pub summary: Option<String>,
    pub sentiment: Option<Sentiment>,
}

/// A single utterance within a conversation. Append-only; ordered by
/// `start_ms` ascending, ties broken by insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    /// Offset from session start, in milliseconds.
    pub start_ms: i64,
    pub end_ms: i64,
    /// STT confidence for user messages.
    pub confidence: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        assert_eq!(Role::from_str_role("user"), Some(Role::User));
        assert_eq!(Role::from_str_role("assistant"), Some(Role::Assistant));
        assert_eq!(Role::from_str_role("system"), None);
        assert_eq!(Role::User.as_str(), "user");
    }

    #[test]
    fn sentiment_round_trip() {
        for s in [Sentiment::Positive, Sentiment::Neutral, Sentiment::Negative] {
            assert_eq!(Sentiment::from_str_label(s.as_str()), Some(s));
        }
        assert_eq!(Sentiment::from_str_label("mixed"), None);
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn demo_agent_is_active_with_defaults() {
        let agent = AgentConfig::demo();
        assert!(agent.is_active);
        assert_eq!(agent.max_tokens, 1024);
        assert!((agent.temperature - 0.7).abs() < f64::EPSILON);
        assert!(!agent.greeting.is_empty());
    }
}
