//! Client event protocol and the serialized egress writer.
//!
//! Every server→client frame is a JSON object:
//!
//! ```text
//! { "type": <EventType>, "data": <object|absent>, "timestamp": <unix-ms> }
//! ```
//!
//! All stages of a session emit through one shared [`EventEmitter`]. The
//! emitter owns the outbound transport behind a mutex and assigns the
//! timestamp inside the lock, so events are serialized and timestamps are
//! monotonically non-decreasing per session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Kind of a server→client event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Pipeline is ready; carries session id, agent name, greeting, mode.
    Ready,
    /// Partial (speculative) transcription.
    SttChunk,
    /// Final transcription, committed to dialogue state.
    SttOutput,
    /// Incremental agent response text.
    AgentChunk,
    /// Agent finished responding for this turn.
    AgentEnd,
    /// Synthesized audio chunk for playback (base64 PCM).
    TtsChunk,
    /// A tool was invoked on behalf of the agent.
    ToolCall,
    /// Error surfaced to the client.
    Error,
    /// Session has ended.
    SessionEnd,
}

/// The unified event frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Unix milliseconds, assigned at emission.
    pub timestamp: i64,
}

/// Outbound transport for serialized event frames. Implemented over the
/// client WebSocket in production and over capture buffers in tests.
#[async_trait]
pub trait EventSink: Send {
    async fn send_frame(&mut self, frame: String) -> anyhow::Result<()>;
}

struct EmitterInner {
    sink: Box<dyn EventSink>,
    last_timestamp: i64,
}

/// Serialized, timestamp-monotonic event writer shared by all session
/// stages. This is the session's egress mutex: no stage writes to the
/// client socket except through here.
pub struct EventEmitter {
    inner: Mutex<EmitterInner>,
}

impl EventEmitter {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            inner: Mutex::new(EmitterInner {
                sink,
                last_timestamp: 0,
            }),
        }
    }

    /// Emit one event. Send failures are logged, not propagated; a dead
    /// client socket is detected by the ingress reader, which tears the
    /// session down.
    pub async fn emit(&self, event_type: EventType, data: Option<serde_json::Value>) {
        let mut inner = self.inner.lock().await;

        let now = chrono::Utc::now().timestamp_millis().max(inner.last_timestamp);
        inner.last_timestamp = now;

        let event = Event {
            event_type,
            data,
            timestamp: now,
        };

        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, event_type = ?event_type, "Failed to encode event");
                return;
            }
        };

        if let Err(e) = inner.sink.send_frame(frame).await {
            tracing::warn!(error = %e, event_type = ?event_type, "Failed to send event");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_sink {
    //! Capturing sink used by pipeline tests across the crate.

    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    pub struct CaptureSink {
        frames: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl CaptureSink {
        pub fn new() -> (Self, Arc<parking_lot::Mutex<Vec<String>>>) {
            let frames = Arc::new(parking_lot::Mutex::new(Vec::new()));
            (
                Self {
                    frames: Arc::clone(&frames),
                },
                frames,
            )
        }
    }

    #[async_trait]
    impl EventSink for CaptureSink {
        async fn send_frame(&mut self, frame: String) -> anyhow::Result<()> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    /// Decode captured frames back into events.
    pub fn decode(frames: &[String]) -> Vec<Event> {
        frames
            .iter()
            .map(|f| serde_json::from_str(f).expect("captured frame should decode"))
            .collect()
    }
}
