//! Per-connection session orchestrator.
//!
//! Wires the client WebSocket to the STT → LLM → TTS pipeline:
//!
//! ```text
//! client ─► ingress ─► audio_in ─► STT ─► stt_out ─► LLM ─► llm_out ─► TTS ─► pcm ─► egress ─► client
//! ```
//!
//! The session runs as a set of tasks:
//! 1. **STT relay**: transcripts → client events, user messages, LLM input.
//! 2. **LLM stage**: one turn per final transcript (direct or tool-agent).
//! 3. **Egress audio**: PCM chunks → base64 `tts_chunk` events.
//! 4. **Ingress reader** (inline): client frames → audio_in + control.
//!
//! All channels are bounded; tasks share only the cancellation token and
//! the egress [`EventEmitter`]. Teardown: cancel → close audio_in → join
//! stages (bounded) → finalize the conversation → `session_end`.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsFrame, WebSocket};
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{AgentConfig, Conversation, Role, Sentiment};
use crate::store::ConversationWriter;
use crate::voice::agent_service::{ToolAgentClient, ToolAgentConfig};
use crate::voice::events::{EventEmitter, EventSink, EventType};
use crate::voice::llm::{ChatMessage, LlmClient};
use crate::voice::pipeline::{tools_for_industry, VoicePipeline};
use crate::voice::stt::TranscriptEvent;

const AUDIO_CHANNEL_CAPACITY: usize = 100;
const STT_CHANNEL_CAPACITY: usize = 10;
const LLM_CHANNEL_CAPACITY: usize = 100;
/// How long teardown waits for stage tasks to quiesce.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Event transport over the client WebSocket sender half.
struct WsEventSink {
    sink: SplitSink<WebSocket, WsFrame>,
}

#[async_trait]
impl EventSink for WsEventSink {
    async fn send_frame(&mut self, frame: String) -> anyhow::Result<()> {
        self.sink
            .send(WsFrame::Text(frame.into()))
            .await
            .map_err(|e| anyhow::anyhow!("client socket send failed: {e}"))
    }
}

/// Run one voice session to completion. Returns when the socket closes,
/// a fatal stage error occurs, or the client requests the end, and always
/// after the conversation is finalized and `session_end` is emitted.
pub(crate) async fn run(
    pipeline: &VoicePipeline,
    socket: WebSocket,
    agent: AgentConfig,
    conversation: Conversation,
) {
    let session_id = conversation.session_id.clone();
    let agent = Arc::new(agent);
    let started_at = Instant::now();
    let cancel = CancellationToken::new();
    let writer = pipeline.writer();

    let (ws_sender, mut ws_receiver) = socket.split();
    let emitter = Arc::new(EventEmitter::new(Box::new(WsEventSink { sink: ws_sender })));

    // Tool-agent mode is best effort: failure degrades to direct LLM.
    let tool_session = init_tool_session(pipeline, &agent, &session_id).await;
    let using_tool_agent = tool_session.is_some();

    emitter
        .emit(
            EventType::Ready,
            Some(json!({
                "session_id": session_id,
                "agent_name": agent.name,
                "greeting": agent.greeting,
                "tool_agent": using_tool_agent,
            })),
        )
        .await;

    let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_CAPACITY);
    let (stt_tx, stt_rx) = mpsc::channel::<TranscriptEvent>(STT_CHANNEL_CAPACITY);
    let (llm_tx, llm_rx) = mpsc::channel::<String>(LLM_CHANNEL_CAPACITY);

    let transcript_rx = match pipeline.stt.stream(cancel.child_token(), audio_rx).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "STT stream initialization failed");
            emitter
                .emit(
                    EventType::Error,
                    Some(json!({"message": "STT initialization failed"})),
                )
                .await;
            finalize(writer.as_ref(), &conversation, &emitter).await;
            return;
        }
    };

    let (pcm_rx, dropped_chunks) = match pipeline
        .tts
        .stream(cancel.child_token(), llm_rx, &agent.voice_id)
        .await
    {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "TTS stream initialization failed");
            emitter
                .emit(
                    EventType::Error,
                    Some(json!({"message": "TTS initialization failed"})),
                )
                .await;
            finalize(writer.as_ref(), &conversation, &emitter).await;
            return;
        }
    };

    tracing::debug!(session_id = %session_id, tool_agent = using_tool_agent, "Pipeline stages starting");

    let mut stages = Vec::new();

    stages.push(tokio::spawn(pump_transcripts(
        transcript_rx,
        stt_tx,
        Arc::clone(&emitter),
        Arc::clone(&writer),
        conversation.id,
        started_at,
    )));

    match (tool_session.clone(), pipeline.tool_agent.clone()) {
        (Some(tool_session_id), Some(tool_client)) => {
            stages.push(tokio::spawn(run_tool_agent_stage(
                tool_client,
                tool_session_id,
                stt_rx,
                llm_tx,
                Arc::clone(&emitter),
                Arc::clone(&writer),
                conversation.id,
                started_at,
                cancel.clone(),
            )));
        }
        _ => {
            stages.push(tokio::spawn(run_direct_llm_stage(
                Arc::clone(&pipeline.llm),
                Arc::clone(&agent),
                stt_rx,
                llm_tx,
                Arc::clone(&emitter),
                Arc::clone(&writer),
                conversation.id,
                started_at,
                cancel.clone(),
            )));
        }
    }

    stages.push(tokio::spawn(pump_audio(pcm_rx, Arc::clone(&emitter))));

    // Ingress runs inline; returning from it begins teardown.
    read_client_frames(&mut ws_receiver, audio_tx, &cancel, &session_id).await;

    cancel.cancel();
    if timeout(SHUTDOWN_GRACE, async {
        for stage in stages {
            let _ = stage.await;
        }
    })
    .await
    .is_err()
    {
        tracing::warn!(session_id = %session_id, "Stage tasks did not quiesce before deadline");
    }

    let dropped = dropped_chunks.load(std::sync::atomic::Ordering::Relaxed);
    if dropped > 0 {
        tracing::warn!(session_id = %session_id, dropped = dropped, "Audio chunks dropped under backpressure");
    }

    if let (Some(tool_client), Some(tool_session_id)) = (&pipeline.tool_agent, &tool_session) {
        if let Err(e) = tool_client.delete_agent(tool_session_id).await {
            tracing::debug!(session_id = %session_id, error = %e, "Failed to clean up tool agent session");
        }
    }

    finalize(writer.as_ref(), &conversation, &emitter).await;
    tracing::info!(session_id = %session_id, "Voice session ended");
}

/// Try to create a server-side tool-agent session. `None` means direct
/// LLM mode; this never fails the voice session.
async fn init_tool_session(
    pipeline: &VoicePipeline,
    agent: &AgentConfig,
    session_id: &str,
) -> Option<String> {
    let tool_client = pipeline.tool_agent.as_ref()?;

    let config = ToolAgentConfig {
        session_id: session_id.to_string(),
        system_prompt: agent.system_prompt.clone(),
        greeting: Some(agent.greeting.clone()).filter(|g| !g.is_empty()),
        model: agent.llm_model.clone(),
        temperature: agent.temperature,
        max_tokens: agent.max_tokens,
        tools: tools_for_industry(&agent.industry),
    };

    match tool_client.create_agent(&config).await {
        Ok(created) => Some(created.session_id),
        Err(e) => {
            tracing::warn!(
                session_id = session_id,
                error = %e,
                "Tool agent init failed, falling back to direct LLM"
            );
            None
        }
    }
}

/// Finalize the conversation record and emit `session_end`. Runs on
/// every exit path; the store makes the end call idempotent.
async fn finalize(
    writer: &dyn ConversationWriter,
    conversation: &Conversation,
    emitter: &EventEmitter,
) {
    if let Err(e) = writer
        .end(conversation.id, "Conversation ended", Sentiment::Neutral)
        .await
    {
        tracing::error!(conversation_id = %conversation.id, error = %e, "Failed to finalize conversation");
    }
    emitter.emit(EventType::SessionEnd, None).await;
}

/// Ingress reader: binary frames are audio, text frames are control
/// messages. Returning closes `audio_tx`, which terminates the STT leg.
async fn read_client_frames(
    ws_receiver: &mut SplitStream<WebSocket>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    cancel: &CancellationToken,
    session_id: &str,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = ws_receiver.next() => match frame {
                Some(Ok(WsFrame::Binary(data))) => {
                    if audio_tx.send(data.to_vec()).await.is_err() {
                        return;
                    }
                }
                Some(Ok(WsFrame::Text(text))) => {
                    if is_end_control(text.as_str()) {
                        tracing::info!(session_id = session_id, "Client requested session end");
                        return;
                    }
                }
                Some(Ok(WsFrame::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(session_id = session_id, error = %e, "Client socket read error");
                    return;
                }
            }
        }
    }
}

/// Recognized control messages: `{"type":"end"}`. Everything else is
/// ignored.
fn is_end_control(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "end"))
        .unwrap_or(false)
}

/// STT relay: partials go to the client only; finals are persisted and
/// committed into the LLM leg.
async fn pump_transcripts(
    mut transcript_rx: mpsc::Receiver<TranscriptEvent>,
    stt_tx: mpsc::Sender<TranscriptEvent>,
    emitter: Arc<EventEmitter>,
    writer: Arc<dyn ConversationWriter>,
    conversation_id: Uuid,
    started_at: Instant,
) {
    while let Some(transcript) = transcript_rx.recv().await {
        if transcript.is_partial {
            emitter
                .emit(EventType::SttChunk, Some(json!({"text": transcript.text})))
                .await;
            continue;
        }

        tracing::debug!(text = %transcript.text, "Final transcript");
        emitter
            .emit(EventType::SttOutput, Some(json!({"text": transcript.text})))
            .await;

        let elapsed = started_at.elapsed().as_millis() as i64;
        if let Err(e) = writer
            .add_message(
                conversation_id,
                Role::User,
                &transcript.text,
                elapsed,
                elapsed,
                Some(transcript.confidence),
            )
            .await
        {
            tracing::error!(error = %e, "Failed to persist user message");
        }

        if stt_tx.send(transcript).await.is_err() {
            return;
        }
    }
}

/// Direct-LLM stage: one streaming completion per final transcript. The
/// dialogue buffer is owned by this task alone.
#[allow(clippy::too_many_arguments)]
async fn run_direct_llm_stage(
    llm: Arc<LlmClient>,
    agent: Arc<AgentConfig>,
    mut stt_rx: mpsc::Receiver<TranscriptEvent>,
    llm_tx: mpsc::Sender<String>,
    emitter: Arc<EventEmitter>,
    writer: Arc<dyn ConversationWriter>,
    conversation_id: Uuid,
    started_at: Instant,
    cancel: CancellationToken,
) {
    let mut dialogue: Vec<ChatMessage> = Vec::new();

    while let Some(transcript) = stt_rx.recv().await {
        if cancel.is_cancelled() {
            return;
        }

        dialogue.push(ChatMessage::user(transcript.text.clone()));

        let token_rx = match llm
            .stream(
                cancel.child_token(),
                &agent.system_prompt,
                &dialogue,
                &agent.llm_model,
                agent.temperature,
                agent.max_tokens,
            )
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(error = %e, "LLM stream error");
                emitter
                    .emit(EventType::Error, Some(json!({"message": "LLM error"})))
                    .await;
                continue;
            }
        };

        let reply = pump_reply(token_rx, &llm_tx, &emitter).await;
        tracing::debug!(response_length = reply.len(), "LLM response complete");
        emitter.emit(EventType::AgentEnd, None).await;

        if reply.is_empty() {
            continue;
        }

        let elapsed = started_at.elapsed().as_millis() as i64;
        if let Err(e) = writer
            .add_message(conversation_id, Role::Assistant, &reply, elapsed, elapsed, None)
            .await
        {
            tracing::error!(error = %e, "Failed to persist assistant message");
        }
        dialogue.push(ChatMessage::assistant(reply));
    }
}

/// Tool-agent stage: identical contract to the direct stage, but each
/// turn is posted to the external agent session keyed by session id.
#[allow(clippy::too_many_arguments)]
async fn run_tool_agent_stage(
    tool_client: Arc<ToolAgentClient>,
    tool_session_id: String,
    mut stt_rx: mpsc::Receiver<TranscriptEvent>,
    llm_tx: mpsc::Sender<String>,
    emitter: Arc<EventEmitter>,
    writer: Arc<dyn ConversationWriter>,
    conversation_id: Uuid,
    started_at: Instant,
    cancel: CancellationToken,
) {
    while let Some(transcript) = stt_rx.recv().await {
        if cancel.is_cancelled() {
            return;
        }

        let token_rx = match tool_client
            .stream(cancel.child_token(), &tool_session_id, &transcript.text)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(error = %e, "Tool agent stream error");
                emitter
                    .emit(
                        EventType::Error,
                        Some(json!({"message": "agent service error"})),
                    )
                    .await;
                continue;
            }
        };

        let reply = pump_reply(token_rx, &llm_tx, &emitter).await;
        tracing::debug!(response_length = reply.len(), "Tool agent response complete");
        emitter.emit(EventType::AgentEnd, None).await;

        if reply.is_empty() {
            continue;
        }

        let elapsed = started_at.elapsed().as_millis() as i64;
        if let Err(e) = writer
            .add_message(conversation_id, Role::Assistant, &reply, elapsed, elapsed, None)
            .await
        {
            tracing::error!(error = %e, "Failed to persist assistant message");
        }
    }
}

/// Relay one reply's token stream: every delta becomes an `agent_chunk`
/// event and an entry on the TTS leg. Returns the assembled reply.
async fn pump_reply(
    mut token_rx: mpsc::Receiver<String>,
    llm_tx: &mpsc::Sender<String>,
    emitter: &EventEmitter,
) -> String {
    let mut reply = String::new();
    while let Some(chunk) = token_rx.recv().await {
        reply.push_str(&chunk);
        emitter
            .emit(EventType::AgentChunk, Some(json!({"text": &chunk})))
            .await;
        if llm_tx.send(chunk).await.is_err() {
            break;
        }
    }
    reply
}

/// Egress audio: every PCM chunk becomes a base64 `tts_chunk` event,
/// serialized with all other events through the emitter.
async fn pump_audio(mut pcm_rx: mpsc::Receiver<Vec<u8>>, emitter: Arc<EventEmitter>) {
    while let Some(chunk) = pcm_rx.recv().await {
        let audio = base64::engine::general_purpose::STANDARD.encode(&chunk);
        emitter
            .emit(EventType::TtsChunk, Some(json!({"audio": audio})))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::voice::events::test_sink::{decode, CaptureSink};
    use crate::voice::pipeline::VoicePipeline;
    use crate::Config;

    fn capture_emitter() -> (Arc<EventEmitter>, Arc<parking_lot::Mutex<Vec<String>>>) {
        let (sink, frames) = CaptureSink::new();
        (Arc::new(EventEmitter::new(Box::new(sink))), frames)
    }

    async fn test_store() -> (Arc<SqliteStore>, Conversation, AgentConfig) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let agent = AgentConfig::demo();
        store.put_agent(&agent).unwrap();
        let conversation = store.create(agent.id, "sess-test").await.unwrap();
        (store, conversation, agent)
    }

    #[test]
    fn end_control_detection() {
        assert!(is_end_control(r#"{"type":"end"}"#));
        assert!(!is_end_control(r#"{"type":"mute"}"#));
        assert!(!is_end_control("not json"));
        assert!(!is_end_control("{}"));
    }

    #[tokio::test]
    async fn pump_reply_assembles_and_forwards_tokens() {
        let (emitter, frames) = capture_emitter();
        let (token_tx, token_rx) = mpsc::channel(10);
        let (llm_tx, mut llm_rx) = mpsc::channel(10);

        for token in ["Hi", "! ", "How", "'s it?"] {
            token_tx.send(token.to_string()).await.unwrap();
        }
        drop(token_tx);

        let reply = pump_reply(token_rx, &llm_tx, &emitter).await;
        assert_eq!(reply, "Hi! How's it?");

        // Every token was forwarded to the TTS leg in order.
        let mut forwarded = String::new();
        while let Ok(chunk) = llm_rx.try_recv() {
            forwarded.push_str(&chunk);
        }
        assert_eq!(forwarded, "Hi! How's it?");

        // And emitted as agent_chunk events, concatenating to the reply.
        let events = decode(&frames.lock());
        assert_eq!(events.len(), 4);
        let emitted: String = events
            .iter()
            .map(|e| {
                assert_eq!(e.event_type, EventType::AgentChunk);
                e.data.as_ref().unwrap()["text"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(emitted, "Hi! How's it?");
    }

    #[tokio::test]
    async fn transcripts_partials_are_events_only() {
        let (emitter, frames) = capture_emitter();
        let (store, conversation, _) = test_store().await;
        let (transcript_tx, transcript_rx) = mpsc::channel(10);
        let (stt_tx, mut stt_rx) = mpsc::channel(10);

        transcript_tx
            .send(TranscriptEvent {
                text: "hel".to_string(),
                is_partial: true,
                confidence: 0.2,
            })
            .await
            .unwrap();
        transcript_tx
            .send(TranscriptEvent {
                text: "hello there".to_string(),
                is_partial: false,
                confidence: 0.95,
            })
            .await
            .unwrap();
        drop(transcript_tx);

        pump_transcripts(
            transcript_rx,
            stt_tx,
            Arc::clone(&emitter),
            Arc::clone(&store) as Arc<dyn ConversationWriter>,
            conversation.id,
            Instant::now(),
        )
        .await;

        // Only the final transcript reaches the LLM leg.
        let committed = stt_rx.recv().await.unwrap();
        assert_eq!(committed.text, "hello there");
        assert!(stt_rx.recv().await.is_none());

        // Events: stt_chunk then stt_output.
        let events = decode(&frames.lock());
        assert_eq!(events[0].event_type, EventType::SttChunk);
        assert_eq!(events[0].data.as_ref().unwrap()["text"], "hel");
        assert_eq!(events[1].event_type, EventType::SttOutput);
        assert_eq!(events[1].data.as_ref().unwrap()["text"], "hello there");

        // The user message was persisted with its confidence.
        let messages = store.list_messages(conversation.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello there");
        assert_eq!(messages[0].confidence, Some(0.95));
    }

    #[tokio::test]
    async fn llm_stage_emits_error_and_persists_no_assistant_message() {
        // No provider keys: every turn fails with a configuration error.
        let (emitter, frames) = capture_emitter();
        let (store, conversation, agent) = test_store().await;
        let llm = Arc::new(LlmClient::new(String::new(), String::new()));
        let (stt_tx, stt_rx) = mpsc::channel(10);
        let (llm_tx, _llm_rx) = mpsc::channel(10);

        stt_tx
            .send(TranscriptEvent {
                text: "hello there".to_string(),
                is_partial: false,
                confidence: 0.9,
            })
            .await
            .unwrap();
        drop(stt_tx);

        run_direct_llm_stage(
            llm,
            Arc::new(agent),
            stt_rx,
            llm_tx,
            Arc::clone(&emitter),
            Arc::clone(&store) as Arc<dyn ConversationWriter>,
            conversation.id,
            Instant::now(),
            CancellationToken::new(),
        )
        .await;

        let events = decode(&frames.lock());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert_eq!(events[0].data.as_ref().unwrap()["message"], "LLM error");

        assert!(store.list_messages(conversation.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn audio_egress_encodes_base64() {
        let (emitter, frames) = capture_emitter();
        let (pcm_tx, pcm_rx) = mpsc::channel(10);

        pcm_tx.send(vec![0u8, 127, 255]).await.unwrap();
        drop(pcm_tx);

        pump_audio(pcm_rx, Arc::clone(&emitter)).await;

        let events = decode(&frames.lock());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::TtsChunk);
        let audio = events[0].data.as_ref().unwrap()["audio"].as_str().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(audio)
            .unwrap();
        assert_eq!(decoded, vec![0u8, 127, 255]);
    }

    #[tokio::test]
    async fn tool_session_falls_back_when_service_unreachable() {
        let config = Config {
            port: 0,
            env: "development".to_string(),
            db_path: String::new(),
            assemblyai_key: "key".to_string(),
            cartesia_key: "key".to_string(),
            cartesia_voice: "voice".to_string(),
            anthropic_key: "key".to_string(),
            openai_key: String::new(),
            // Nothing listens on the discard port locally.
            tool_agent_url: "http://127.0.0.1:9".to_string(),
            tool_agent_enabled: true,
        };
        let (store, _, agent) = test_store().await;
        let pipeline = VoicePipeline::new(&config, store as Arc<dyn ConversationWriter>);

        assert!(pipeline.tool_agent.is_some());
        let tool_session = init_tool_session(&pipeline, &agent, "sess-x").await;
        assert!(tool_session.is_none(), "must degrade to direct LLM mode");
    }

    #[tokio::test]
    async fn finalize_ends_conversation_and_emits_session_end() {
        let (emitter, frames) = capture_emitter();
        let (store, conversation, _) = test_store().await;

        finalize(store.as_ref(), &conversation, &emitter).await;
        finalize(store.as_ref(), &conversation, &emitter).await;

        let stored = store
            .get_conversation(&conversation.session_id)
            .unwrap()
            .unwrap();
        assert!(stored.ended_at.is_some());
        assert_eq!(stored.summary.as_deref(), Some("Conversation ended"));
        assert_eq!(stored.sentiment, Some(Sentiment::Neutral));

        let events = decode(&frames.lock());
        assert!(events
            .iter()
            .all(|e| e.event_type == EventType::SessionEnd));
    }
}
