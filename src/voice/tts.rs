//! Streaming text-to-speech adapter.
//!
//! Converts a bursty token stream into paced synthesis requests over a
//! single long-lived WebSocket, and delivers 44.1 kHz s16le PCM chunks
//! downstream. Three rates meet here: token arrival (fast), request
//! submission (sentence-paced), and audio delivery (real-time).
//!
//! ## Submission policy
//!
//! Tokens accumulate in a [`SentenceBuffer`]; the buffer is submitted
//! when it ends with terminal punctuation, exceeds 120 characters, a
//! 250 ms tick fires with content, or the token input closes. Only one
//! request may be outstanding: while the provider has not yet sent
//! `done`, further submissions are deferred and the buffer keeps
//! accumulating, so audio from different sentences never interleaves.
//!
//! ## Failure containment
//!
//! A shared "connection failed" latch stops both loops after the first
//! I/O error. Read deadlines are short, timeouts are not errors, a
//! bounded number of consecutive read errors is tolerated, and a panic
//! in the receiver is caught and converted into connection failure.

use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const WEBSOCKET_URL: &str = "wss://api.cartesia.ai/tts/websocket";
const PROTOCOL_VERSION: &str = "2024-06-10";
const DEFAULT_MODEL: &str = "sonic-3";
const OUTPUT_SAMPLE_RATE: u32 = 44_100;

/// Buffer length past which a submission is forced mid-sentence.
const MAX_BUFFER_CHARS: usize = 120;
/// Periodic flush of incomplete sentences.
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
/// Per-read deadline; a timeout is not an error.
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// How long the receiver keeps draining after the sender exits.
const DRAIN_GRACE: Duration = Duration::from_secs(1);
/// How long a flush waits for an in-flight request to finish.
const DONE_WAIT: Duration = Duration::from_secs(2);
/// Consecutive transient read errors tolerated before declaring
/// failure; one more than this many fails the connection.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 3;
const PCM_CHANNEL_CAPACITY: usize = 100;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("text-to-speech API key not configured")]
    MissingKey,
    #[error("text-to-speech connection failed: {0}")]
    Connect(String),
}

// ── Sentence-boundary batcher ──────────────────────────────────────

/// Accumulates token fragments and decides when a span is worth
/// submitting for synthesis.
#[derive(Debug, Default)]
struct SentenceBuffer {
    buf: String,
}

impl SentenceBuffer {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, token: &str) {
        self.buf.push_str(token);
    }

    fn is_empty(&self) -> bool {
        self.buf.trim().is_empty()
    }

    /// Whether the buffer qualifies for immediate submission: it ends
    /// with terminal punctuation or has outgrown the length cap.
    fn ready(&self) -> bool {
        let trimmed = self.buf.trim_end();
        trimmed.ends_with('.')
            || trimmed.ends_with('!')
            || trimmed.ends_with('?')
            || self.buf.len() > MAX_BUFFER_CHARS
    }

    /// Take the trimmed buffered text, leaving the buffer empty.
    fn take(&mut self) -> Option<String> {
        let text = self.buf.trim().to_string();
        self.buf.clear();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

// ── Wire types ─────────────────────────────────────────────────────

fn build_submission(text: &str, voice_id: &str, context_id: &str) -> serde_json::Value {
    serde_json::json!({
        "model_id": DEFAULT_MODEL,
        "transcript": text,
        "voice": {"mode": "id", "id": voice_id},
        "output_format": {
            "container": "raw",
            "encoding": "pcm_s16le",
            "sample_rate": OUTPUT_SAMPLE_RATE,
        },
        "context_id": context_id,
        "language": "en",
    })
}

/// Parsed provider message. A single frame can carry several of these
/// (e.g. a final chunk together with the done flag).
#[derive(Debug, PartialEq)]
enum TtsMessage {
    Chunk(Vec<u8>),
    Done,
    ProviderError(String),
}

fn parse_provider_message(raw: &str) -> Vec<TtsMessage> {
    #[derive(Deserialize, Default)]
    struct Incoming {
        #[serde(default, rename = "type")]
        kind: String,
        #[serde(default)]
        data: String,
        #[serde(default)]
        done: bool,
        #[serde(default)]
        error: String,
    }

    let mut messages = Vec::new();
    let Ok(incoming) = serde_json::from_str::<Incoming>(raw) else {
        return messages;
    };

    if !incoming.error.is_empty() {
        messages.push(TtsMessage::ProviderError(incoming.error));
    }

    if incoming.kind == "chunk" && !incoming.data.is_empty() {
        match base64::engine::general_purpose::STANDARD.decode(&incoming.data) {
            Ok(audio) if !audio.is_empty() => messages.push(TtsMessage::Chunk(audio)),
            Ok(_) => {}
            Err(_) => {
                tracing::warn!("Failed to decode synthesized audio chunk");
            }
        }
    }

    if incoming.done || incoming.kind == "done" {
        messages.push(TtsMessage::Done);
    }

    messages
}

/// Enqueue one PCM chunk without blocking. Drops (and counts) the chunk
/// when the egress channel is full. Returns false when the consumer is
/// gone.
fn deliver_chunk(pcm_tx: &mpsc::Sender<Vec<u8>>, audio: Vec<u8>, dropped: &AtomicU64) -> bool {
    match pcm_tx.try_send(audio) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Dropped synthesized audio chunk: egress channel full");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Streaming TTS client, one instance per process.
pub struct TtsClient {
    api_key: String,
    default_voice_id: String,
}

impl TtsClient {
    pub fn new(api_key: String, default_voice_id: String) -> Self {
        Self {
            api_key,
            default_voice_id,
        }
    }

    /// Open a synthesis stream for a session.
    ///
    /// Consumes token fragments from `token_rx`; yields raw PCM chunks
    /// (44.1 kHz, s16le, mono). The second return value counts chunks
    /// dropped under backpressure. The PCM channel closes after the
    /// token input ends and the drain grace elapses, or on terminal
    /// connection failure.
    pub async fn stream(
        &self,
        cancel: CancellationToken,
        token_rx: mpsc::Receiver<String>,
        voice_id: &str,
    ) -> Result<(mpsc::Receiver<Vec<u8>>, Arc<AtomicU64>), TtsError> {
        if self.api_key.is_empty() {
            return Err(TtsError::MissingKey);
        }

        let voice = if voice_id.is_empty() {
            self.default_voice_id.clone()
        } else {
            voice_id.to_string()
        };

        let url = format!(
            "{WEBSOCKET_URL}?api_key={}&cartesia_version={PROTOCOL_VERSION}",
            self.api_key
        );
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TtsError::Connect(e.to_string()))?;

        tracing::debug!(voice_id = %voice, "Connected to synthesis stream");

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (pcm_tx, pcm_rx) = mpsc::channel(PCM_CHANNEL_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        let conn_failed = Arc::new(AtomicBool::new(false));
        let awaiting_done = Arc::new(AtomicBool::new(false));
        let done_notify = Arc::new(Notify::new());
        let (sender_done_tx, sender_done_rx) = oneshot::channel::<()>();

        tokio::spawn(sender_loop(
            token_rx,
            ws_sender,
            voice,
            cancel.clone(),
            Arc::clone(&conn_failed),
            Arc::clone(&awaiting_done),
            Arc::clone(&done_notify),
            sender_done_tx,
        ));

        // A panic inside the read loop must end the session cleanly,
        // never the process.
        let conn_failed_panic = Arc::clone(&conn_failed);
        let dropped_counter = Arc::clone(&dropped);
        tokio::spawn(async move {
            let result = AssertUnwindSafe(receiver_loop(
                ws_receiver,
                pcm_tx,
                cancel,
                conn_failed_panic.clone(),
                awaiting_done,
                done_notify,
                sender_done_rx,
                dropped_counter,
            ))
            .catch_unwind()
            .await;

            if result.is_err() {
                conn_failed_panic.store(true, Ordering::Relaxed);
                tracing::warn!("Recovered from panic in synthesis receiver");
            }
        });

        Ok((pcm_rx, dropped))
    }

    /// Synchronous one-shot synthesis: submit a single span and collect
    /// the full audio.
    pub async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, TtsError> {
        let (token_tx, token_rx) = mpsc::channel(1);
        let _ = token_tx.send(text.to_string()).await;
        drop(token_tx);

        let (mut pcm_rx, _dropped) = self
            .stream(CancellationToken::new(), token_rx, voice_id)
            .await?;

        let mut audio = Vec::new();
        while let Some(chunk) = pcm_rx.recv().await {
            audio.extend_from_slice(&chunk);
        }
        Ok(audio)
    }
}

// ── Sender loop ────────────────────────────────────────────────────

/// Submit the buffer if allowed. Returns false on connection failure.
/// A deferred submission (request still in flight) is not a failure;
/// the buffer keeps the text.
async fn try_submit(
    ws_sender: &mut WsSink,
    buffer: &mut SentenceBuffer,
    voice_id: &str,
    context_counter: &mut u64,
    conn_failed: &AtomicBool,
    awaiting_done: &AtomicBool,
) -> bool {
    if conn_failed.load(Ordering::Relaxed) {
        return false;
    }
    if awaiting_done.load(Ordering::Relaxed) {
        return true;
    }
    let Some(text) = buffer.take() else {
        return true;
    };

    *context_counter += 1;
    let context_id = format!(
        "ctx_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        context_counter
    );

    tracing::debug!(text = %text, context_id = %context_id, "Submitting synthesis request");

    let payload = build_submission(&text, voice_id, &context_id);
    let frame = match serde_json::to_string(&payload) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode synthesis request");
            return true;
        }
    };

    if ws_sender.send(WsMessage::Text(frame)).await.is_err() {
        tracing::warn!("Failed to send synthesis request");
        conn_failed.store(true, Ordering::Relaxed);
        return false;
    }

    awaiting_done.store(true, Ordering::Relaxed);
    true
}

/// idle → buffering → submitted-waiting-done → idle; connection failure
/// is terminal. Dropping `_sender_done` tells the receiver to begin its
/// drain grace.
#[allow(clippy::too_many_arguments)]
async fn sender_loop(
    mut token_rx: mpsc::Receiver<String>,
    mut ws_sender: WsSink,
    voice_id: String,
    cancel: CancellationToken,
    conn_failed: Arc<AtomicBool>,
    awaiting_done: Arc<AtomicBool>,
    done_notify: Arc<Notify>,
    _sender_done: oneshot::Sender<()>,
) {
    let mut buffer = SentenceBuffer::new();
    let mut context_counter: u64 = 0;
    let mut ticker = interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if conn_failed.load(Ordering::Relaxed) {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                flush_remnant(
                    &mut ws_sender,
                    &mut buffer,
                    &voice_id,
                    &mut context_counter,
                    &conn_failed,
                    &awaiting_done,
                    &done_notify,
                )
                .await;
                return;
            }
            token = token_rx.recv() => match token {
                Some(token) => {
                    buffer.push(&token);
                    if buffer.ready()
                        && !try_submit(
                            &mut ws_sender,
                            &mut buffer,
                            &voice_id,
                            &mut context_counter,
                            &conn_failed,
                            &awaiting_done,
                        )
                        .await
                    {
                        return;
                    }
                }
                None => {
                    flush_remnant(
                        &mut ws_sender,
                        &mut buffer,
                        &voice_id,
                        &mut context_counter,
                        &conn_failed,
                        &awaiting_done,
                        &done_notify,
                    )
                    .await;
                    tracing::debug!("Synthesis text input complete");
                    return;
                }
            },
            _ = ticker.tick() => {
                if !buffer.is_empty()
                    && !try_submit(
                        &mut ws_sender,
                        &mut buffer,
                        &voice_id,
                        &mut context_counter,
                        &conn_failed,
                        &awaiting_done,
                    )
                    .await
                {
                    return;
                }
            }
            _ = done_notify.notified() => {
                // Previous request finished; a qualifying buffer goes
                // out immediately, the rest waits for the next tick.
                if buffer.ready()
                    && !try_submit(
                        &mut ws_sender,
                        &mut buffer,
                        &voice_id,
                        &mut context_counter,
                        &conn_failed,
                        &awaiting_done,
                    )
                    .await
                {
                    return;
                }
            }
        }
    }
}

/// Flush whatever is buffered on shutdown, waiting out an in-flight
/// request first so the final span is not silently deferred.
#[allow(clippy::too_many_arguments)]
async fn flush_remnant(
    ws_sender: &mut WsSink,
    buffer: &mut SentenceBuffer,
    voice_id: &str,
    context_counter: &mut u64,
    conn_failed: &AtomicBool,
    awaiting_done: &AtomicBool,
    done_notify: &Notify,
) {
    if buffer.is_empty() {
        return;
    }
    if awaiting_done.load(Ordering::Relaxed) {
        let _ = timeout(DONE_WAIT, done_notify.notified()).await;
        awaiting_done.store(false, Ordering::Relaxed);
    }
    let _ = try_submit(
        ws_sender,
        buffer,
        voice_id,
        context_counter,
        conn_failed,
        awaiting_done,
    )
    .await;
}

// ── Receiver loop ──────────────────────────────────────────────────

/// Generic over the frame source so tests can drive it with injected
/// read errors; production passes the split WebSocket stream.
#[allow(clippy::too_many_arguments)]
async fn receiver_loop<S>(
    mut ws_receiver: S,
    pcm_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    conn_failed: Arc<AtomicBool>,
    awaiting_done: Arc<AtomicBool>,
    done_notify: Arc<Notify>,
    mut sender_done_rx: oneshot::Receiver<()>,
    dropped: Arc<AtomicU64>,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let mut consecutive_errors: u32 = 0;
    // Soft deadline: sender finished, keep draining while audio flows.
    // Hard deadline: session cancelled, exit is bounded regardless.
    let mut drain_deadline: Option<Instant> = None;
    let mut hard_deadline: Option<Instant> = None;
    let mut sender_finished = false;

    loop {
        if conn_failed.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        if drain_deadline.is_some_and(|d| now >= d) || hard_deadline.is_some_and(|d| now >= d) {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled(), if hard_deadline.is_none() => {
                hard_deadline = Some(Instant::now() + DRAIN_GRACE);
            }
            _ = &mut sender_done_rx, if !sender_finished => {
                sender_finished = true;
                if drain_deadline.is_none() {
                    drain_deadline = Some(Instant::now() + DRAIN_GRACE);
                }
            }
            read = timeout(READ_TIMEOUT, ws_receiver.next()) => match read {
                // Read deadline reached; the loop head re-checks state.
                Err(_) => {}
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    consecutive_errors = 0;
                    // Audio still flowing: push the drain deadline out so
                    // a flushed remnant is not cut off mid-utterance.
                    if drain_deadline.is_some() {
                        drain_deadline = Some(Instant::now() + DRAIN_GRACE);
                    }
                    for message in parse_provider_message(&text) {
                        match message {
                            TtsMessage::Chunk(audio) => {
                                if !deliver_chunk(&pcm_tx, audio, &dropped) {
                                    return;
                                }
                            }
                            TtsMessage::Done => {
                                awaiting_done.store(false, Ordering::Relaxed);
                                done_notify.notify_one();
                            }
                            TtsMessage::ProviderError(error) => {
                                tracing::warn!(error = %error, "Synthesis provider error");
                            }
                        }
                    }
                }
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    tracing::debug!(close_frame = ?frame, "Synthesis connection closed");
                    conn_failed.store(true, Ordering::Relaxed);
                    return;
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    consecutive_errors += 1;
                    tracing::debug!(
                        error = %e,
                        attempts = consecutive_errors,
                        "Synthesis read error"
                    );
                    if consecutive_errors > MAX_CONSECUTIVE_READ_ERRORS {
                        conn_failed.store(true, Ordering::Relaxed);
                        return;
                    }
                }
                Ok(None) => {
                    conn_failed.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}
