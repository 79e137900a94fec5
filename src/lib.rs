//! Voiceline: a real-time, full-duplex voice conversation server.
//!
//! A client streams microphone audio over a persistent WebSocket; the
//! server transcribes it, feeds the transcript to an LLM backend,
//! synthesizes the reply to speech, and streams audio back, all while
//! the user may keep speaking.
//!
//! ## Architecture
//!
//! ```text
//! client ─► ingress ─► STT adapter ─► LLM stage ─► TTS adapter ─► egress ─► client
//!           (binary PCM frames)     (utterances)  (token stream)  (PCM audio)
//!                                                            │
//!                                                            └─► conversation store
//! ```
//!
//! Each session is a set of concurrent tasks wired with bounded mpsc
//! channels, sharing only a cancellation token and a mutex-guarded
//! outbound event writer. See [`voice`] for the pipeline itself and
//! [`gateway`] for the HTTP/WebSocket serving surface.

pub mod config;
pub mod gateway;
pub mod models;
pub mod store;
pub mod voice;

pub use config::Config;
pub use store::{AgentDirectory, ConversationWriter, SqliteStore};
pub use voice::VoicePipeline;
