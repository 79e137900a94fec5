//! Pipeline factory: builds per-session provider adapters from global
//! credentials and holds the conversation writer capability.

use std::sync::Arc;

use axum::extract::ws::WebSocket;

use crate::config::Config;
use crate::models::{AgentConfig, Conversation};
use crate::store::ConversationWriter;
use crate::voice::agent_service::ToolAgentClient;
use crate::voice::llm::LlmClient;
use crate::voice::session;
use crate::voice::stt::SttClient;
use crate::voice::tts::TtsClient;

/// Orchestrates the STT → LLM → TTS flow for every accepted session.
/// Constructed once at startup; adapters are session-scoped but share
/// the credentials and HTTP clients held here.
pub struct VoicePipeline {
    pub(crate) stt: SttClient,
    pub(crate) tts: TtsClient,
    pub(crate) llm: Arc<LlmClient>,
    pub(crate) tool_agent: Option<Arc<ToolAgentClient>>,
    writer: Arc<dyn ConversationWriter>,
}

impl VoicePipeline {
    pub fn new(config: &Config, writer: Arc<dyn ConversationWriter>) -> Self {
        let tool_agent = if config.tool_agent_enabled {
            tracing::info!(url = %config.tool_agent_url, "Tool-agent service enabled");
            Some(Arc::new(ToolAgentClient::new(config.tool_agent_url.clone())))
        } else {
            tracing::info!("Using direct LLM API calls (tool agent disabled)");
            None
        };

        Self {
            stt: SttClient::new(config.assemblyai_key.clone()),
            tts: TtsClient::new(config.cartesia_key.clone(), config.cartesia_voice.clone()),
            llm: Arc::new(LlmClient::new(
                config.anthropic_key.clone(),
                config.openai_key.clone(),
            )),
            tool_agent,
            writer,
        }
    }

    /// The conversation writer capability this pipeline persists through.
    pub fn writer(&self) -> Arc<dyn ConversationWriter> {
        Arc::clone(&self.writer)
    }

    /// Run a voice session over an upgraded client socket until it ends.
    pub async fn handle_session(
        &self,
        socket: WebSocket,
        agent: AgentConfig,
        conversation: Conversation,
    ) {
        session::run(self, socket, agent, conversation).await;
    }
}

/// Tool capabilities granted per industry. Unknown industries get time
/// lookup only.
pub fn tools_for_industry(slug: &str) -> Vec<String> {
    let tools: &[&str] = match slug {
        "customer-support" => &[
            "get_current_time",
            "check_order_status",
            "create_support_ticket",
        ],
        "sales" => &[
            "get_current_time",
            "check_product_availability",
            "get_pricing",
            "schedule_demo",
        ],
        "healthcare" => &[
            "get_current_time",
            "check_appointment_availability",
            "book_appointment",
        ],
        "restaurant" => &[
            "get_current_time",
            "check_reservation_availability",
            "make_reservation",
            "get_menu_info",
        ],
        _ => &["get_current_time"],
    };
    tools.iter().map(|t| t.to_string()).collect()
}
