//! The voice pipeline: per-session state machine and concurrency fabric
//! wiring three streaming providers into one low-latency conduit.
//!
//! ## Design
//! - Bounded mpsc channels between stages; no stage blocks unboundedly
//! - One cancellation token per session, cloned into every stage task
//! - A single mutex-guarded event writer for all outbound frames
//! - Provider adapters with split sender/receiver tasks and a shared
//!   "connection failed" latch
//! - Sentence-boundary batching between the LLM token stream and TTS
//! - Tool-agent mode with silent fallback to direct LLM calls

pub mod agent_service;
pub mod events;
pub mod llm;
pub mod pipeline;
pub mod session;
pub mod stt;
pub mod tts;

pub use events::{Event, EventEmitter, EventSink, EventType};
pub use pipeline::{tools_for_industry, VoicePipeline};
pub use stt::TranscriptEvent;
