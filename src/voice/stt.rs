//! Streaming speech-to-text adapter.
//!
//! Opens one WebSocket session per voice session against the AssemblyAI
//! Universal-Streaming endpoint: raw binary PCM frames go up, JSON turn
//! events come down. Two tasks per session, an audio sender and an event
//! receiver, share a single "connection failed" latch so neither touches
//! a dead socket twice.
//!
//! ## Protocol
//!
//! 1. **Connect** — `wss://.../v3/ws?sample_rate=16000&token=KEY`
//! 2. **Stream** — binary frames of 16-bit LE mono PCM
//! 3. **Receive** — `Begin` (informational), `Turn` (transcript,
//!    end-of-turn flag, confidence), `Termination`
//! 4. **Close** — `{"type": "Terminate"}` when the audio input ends

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;

const STREAMING_URL: &str = "wss://streaming.assemblyai.com/v3/ws";
const SAMPLE_RATE: u32 = 16_000;
const TRANSCRIPT_CHANNEL_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum SttError {
    #[error("speech-to-text API key not configured")]
    MissingKey,
    #[error("speech-to-text connection failed: {0}")]
    Connect(String),
}

/// A transcription result. Partials are speculative and may be revised;
/// finals commit the turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_partial: bool,
    pub confidence: f64,
}

/// Parsed provider message.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
enum ProviderMessage {
    Begin {
        id: String,
    },
    Turn {
        #[serde(default)]
        transcript: String,
        #[serde(default)]
        end_of_turn: bool,
        #[serde(default)]
        turn_order: u64,
        #[serde(default)]
        end_of_turn_confidence: f64,
    },
    Termination {},
}

fn parse_provider_message(raw: &str) -> Option<ProviderMessage> {
    serde_json::from_str(raw).ok()
}

/// Tracks committed turns so a revised partial is never forwarded after
/// the final of the same turn.
#[derive(Debug, Default)]
struct TurnTracker {
    committed: Option<u64>,
}

impl TurnTracker {
    fn should_forward(&mut self, turn_order: u64, end_of_turn: bool) -> bool {
        if let Some(committed) = self.committed {
            if turn_order <= committed {
                return false;
            }
        }
        if end_of_turn {
            self.committed = Some(turn_order);
        }
        true
    }
}

/// Streaming STT client, one instance per process.
pub struct SttClient {
    api_key: String,
}

impl SttClient {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// Open a streaming transcription session.
    ///
    /// Consumes PCM frames from `audio_rx` and yields [`TranscriptEvent`]s
    /// until the audio input closes, the provider terminates, or the
    /// session is cancelled. The returned channel closes when the
    /// receiver task exits; a mid-session connection drop therefore
    /// drains downstream stages instead of erroring them.
    pub async fn stream(
        &self,
        cancel: CancellationToken,
        mut audio_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<mpsc::Receiver<TranscriptEvent>, SttError> {
        if self.api_key.is_empty() {
            return Err(SttError::MissingKey);
        }

        let url = format!(
            "{STREAMING_URL}?sample_rate={SAMPLE_RATE}&encoding=pcm_s16le&token={}",
            self.api_key
        );

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SttError::Connect(e.to_string()))?;

        tracing::debug!("Connected to transcription stream");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (transcript_tx, transcript_rx) = mpsc::channel(TRANSCRIPT_CHANNEL_CAPACITY);
        let failed = Arc::new(AtomicBool::new(false));

        // Sender: audio frames up, then a terminate control on input close.
        let failed_out = Arc::clone(&failed);
        let cancel_out = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_out.cancelled() => break,
                    frame = audio_rx.recv() => match frame {
                        Some(pcm) => {
                            if failed_out.load(Ordering::Relaxed) {
                                return;
                            }
                            if ws_sender.send(WsMessage::Binary(pcm)).await.is_err() {
                                tracing::warn!("Failed to send audio to transcription stream");
                                failed_out.store(true, Ordering::Relaxed);
                                return;
                            }
                        }
                        None => break,
                    }
                }
            }

            if failed_out.load(Ordering::Relaxed) {
                return;
            }
            let terminate = serde_json::json!({"type": "Terminate"}).to_string();
            if ws_sender.send(WsMessage::Text(terminate)).await.is_err() {
                failed_out.store(true, Ordering::Relaxed);
            }
            tracing::debug!("Transcription audio sender finished");
        });

        // Receiver: JSON events down. Closing the transcript channel (by
        // dropping the sender on exit) signals upstream completion.
        let failed_in = Arc::clone(&failed);
        tokio::spawn(async move {
            let mut turns = TurnTracker::default();
            loop {
                if failed_in.load(Ordering::Relaxed) {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            match parse_provider_message(&text) {
                                Some(ProviderMessage::Begin { id }) => {
                                    tracing::debug!(stream_id = %id, "Transcription session began");
                                }
                                Some(ProviderMessage::Turn {
                                    transcript,
                                    end_of_turn,
                                    turn_order,
                                    end_of_turn_confidence,
                                }) => {
                                    if transcript.is_empty() {
                                        continue;
                                    }
                                    if !turns.should_forward(turn_order, end_of_turn) {
                                        continue;
                                    }
                                    if end_of_turn {
                                        tracing::debug!(
                                            text = %transcript,
                                            confidence = end_of_turn_confidence,
                                            "Final transcript received"
                                        );
                                    }
                                    let event = TranscriptEvent {
                                        text: transcript,
                                        is_partial: !end_of_turn,
                                        confidence: end_of_turn_confidence,
                                    };
                                    if transcript_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Some(ProviderMessage::Termination {}) => {
                                    tracing::debug!("Transcription session terminated");
                                    break;
                                }
                                None => {
                                    tracing::debug!("Skipping unrecognized transcription message");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            tracing::debug!(close_frame = ?frame, "Transcription connection closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Transcription read error");
                            failed_in.store(true, Ordering::Relaxed);
                            break;
                        }
                        None => break,
                    }
                }
            }
        });

        Ok(transcript_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_begin() {
        let raw = r#"{"type":"Begin","id":"stream-abc","expires_at":1700000000}"#;
        assert_eq!(
            parse_provider_message(raw),
            Some(ProviderMessage::Begin {
                id: "stream-abc".to_string()
            })
        );
    }

    #[test]
    fn parse_partial_turn() {
        let raw = r#"{"type":"Turn","transcript":"hel","end_of_turn":false,"turn_order":0,"end_of_turn_confidence":0.1}"#;
        match parse_provider_message(raw) {
            Some(ProviderMessage::Turn {
                transcript,
                end_of_turn,
                ..
            }) => {
                assert_eq!(transcript, "hel");
                assert!(!end_of_turn);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn parse_final_turn() {
        let raw = r#"{"type":"Turn","transcript":"hello there","end_of_turn":true,"turn_order":1,"end_of_turn_confidence":0.97}"#;
        match parse_provider_message(raw) {
            Some(ProviderMessage::Turn {
                transcript,
                end_of_turn,
                turn_order,
                end_of_turn_confidence,
            }) => {
                assert_eq!(transcript, "hello there");
                assert!(end_of_turn);
                assert_eq!(turn_order, 1);
                assert!((end_of_turn_confidence - 0.97).abs() < 1e-9);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn parse_termination() {
        let raw = r#"{"type":"Termination","audio_duration_seconds":4.2}"#;
        assert_eq!(
            parse_provider_message(raw),
            Some(ProviderMessage::Termination {})
        );
    }

    #[test]
    fn parse_unknown_and_garbage() {
        assert_eq!(parse_provider_message(r#"{"type":"Pong"}"#), None);
        assert_eq!(parse_provider_message("not json"), None);
        assert_eq!(parse_provider_message("{}"), None);
    }

    #[test]
    fn turn_tracker_forwards_normal_sequence() {
        let mut turns = TurnTracker::default();
        assert!(turns.should_forward(0, false));
        assert!(turns.should_forward(0, false));
        assert!(turns.should_forward(0, true));
        // Next turn starts cleanly.
        assert!(turns.should_forward(1, false));
        assert!(turns.should_forward(1, true));
    }

    #[test]
    fn turn_tracker_drops_partial_after_final() {
        let mut turns = TurnTracker::default();
        assert!(turns.should_forward(0, true));
        // A late revision of the committed turn must not be forwarded.
        assert!(!turns.should_forward(0, false));
        assert!(!turns.should_forward(0, true));
        // But the following turn is unaffected.
        assert!(turns.should_forward(1, false));
    }

    #[tokio::test]
    async fn stream_without_key_fails() {
        let client = SttClient::new(String::new());
        let (_tx, rx) = mpsc::channel(1);
        let result = client.stream(CancellationToken::new(), rx).await;
        assert!(matches!(result, Err(SttError::MissingKey)));
    }
}
