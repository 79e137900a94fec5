//! Axum HTTP gateway: health route, conversation read endpoints, and the
//! WebSocket upgrade that starts a voice session.
//!
//! The gateway stays thin. It resolves the agent through the directory
//! capability, creates the conversation record, and hands the upgraded
//! socket to the pipeline; everything conversational happens there.

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::store::{AgentDirectory, SqliteStore};
use crate::voice::VoicePipeline;

/// Maximum request body size (64KB); voice audio goes over the
/// WebSocket, so REST bodies stay small.
pub const MAX_BODY_SIZE: usize = 65_536;
/// REST request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<VoicePipeline>,
    pub store: Arc<SqliteStore>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/voice/{agent_id}", get(voice_ws))
        .route("/api/conversations/{session_id}", get(get_conversation))
        .route(
            "/api/conversations/{session_id}/messages",
            get(list_messages),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// GET /ws/voice/{agent_id}: upgrade to a voice session.
///
/// The agent must exist and be active. A conversation record is created
/// before the upgrade so even an immediately-dropped socket leaves an
/// auditable row.
async fn voice_ws(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let agent_id = match Uuid::parse_str(&agent_id) {
        Ok(id) => id,
        Err(_) => {
            tracing::warn!(agent_id = %agent_id, "Invalid agent id format");
            return (StatusCode::BAD_REQUEST, "Invalid agent id").into_response();
        }
    };

    let agent = match state.store.get_agent(agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            tracing::warn!(agent_id = %agent_id, "Agent not found");
            return (StatusCode::NOT_FOUND, "Agent not found").into_response();
        }
        Err(e) => {
            tracing::error!(agent_id = %agent_id, error = %e, "Agent lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Agent lookup failed").into_response();
        }
    };

    if !agent.is_active {
        tracing::warn!(agent_id = %agent_id, agent_name = %agent.name, "Connection to inactive agent rejected");
        return (StatusCode::FORBIDDEN, "Agent is not active").into_response();
    }

    let session_id = Uuid::new_v4().to_string();
    let conversation = match state.pipeline.writer().create(agent_id, &session_id).await {
        Ok(conversation) => conversation,
        Err(e) => {
            tracing::error!(
                session_id = %session_id,
                agent_id = %agent_id,
                error = %e,
                "Failed to create conversation"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create conversation",
            )
                .into_response();
        }
    };

    tracing::info!(
        session_id = %session_id,
        agent_id = %agent_id,
        agent_name = %agent.name,
        conversation_id = %conversation.id,
        "Voice session started"
    );

    let pipeline = Arc::clone(&state.pipeline);
    ws.on_upgrade(move |socket| async move {
        pipeline.handle_session(socket, agent, conversation).await;
    })
}

/// GET /api/conversations/{session_id}
async fn get_conversation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.get_conversation(&session_id) {
        Ok(Some(conversation)) => Json(conversation).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Conversation not found").into_response(),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Conversation lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Lookup failed").into_response()
        }
    }
}

/// GET /api/conversations/{session_id}/messages
async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let conversation = match state.store.get_conversation(&session_id) {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return (StatusCode::NOT_FOUND, "Conversation not found").into_response(),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Conversation lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Lookup failed").into_response();
        }
    };

    match state.store.list_messages(conversation.id) {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Message listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Lookup failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::AgentConfig;
    use crate::store::ConversationWriter;

    fn test_state() -> AppState {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = Config {
            port: 0,
            env: "development".to_string(),
            db_path: String::new(),
            assemblyai_key: String::new(),
            cartesia_key: String::new(),
            cartesia_voice: String::new(),
            anthropic_key: String::new(),
            openai_key: String::new(),
            tool_agent_url: String::new(),
            tool_agent_enabled: false,
        };
        let pipeline = Arc::new(VoicePipeline::new(
            &config,
            Arc::clone(&store) as Arc<dyn ConversationWriter>,
        ));
        AppState { pipeline, store }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn router_builds() {
        let _router = router(test_state());
    }

    #[tokio::test]
    async fn conversation_endpoint_finds_created_records() {
        let state = test_state();
        let agent = AgentConfig::demo();
        state.store.put_agent(&agent).unwrap();
        state
            .pipeline
            .writer()
            .create(agent.id, "sess-http")
            .await
            .unwrap();

        let found = state.store.get_conversation("sess-http").unwrap();
        assert!(found.is_some());
        assert!(state.store.get_conversation("sess-nope").unwrap().is_none());
    }
}
