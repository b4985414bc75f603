//! Voice Onboarding - Streaming speech playback for guided onboarding
//!
//! This library provides the playback core for a spoken onboarding flow:
//! - Anonymous bearer token acquisition and caching
//! - Chunked PCM ingestion from the speech endpoint
//! - A buffer-queue audio engine with drain detection
//! - Step-by-step sequencing of the conversation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               PlaybackOrchestrator                   │
//! │   step chain  │  transcription  │  terminal result   │
//! └───────┬─────────────────┬───────────────────┬───────┘
//!         │                 │                   │
//! ┌───────▼──────┐  ┌───────▼────────┐  ┌───────▼───────┐
//! │ TokenProvider│  │ StreamIngester │  │AudioQueueEngine│
//! │ cache+refresh│  │ 512-byte chunks│  │ slots + drain  │
//! └──────────────┘  └────────────────┘  └───────┬───────┘
//!                                               │
//!                                     ┌─────────▼─────────┐
//!                                     │  OutputBackend    │
//!                                     │  cpal  │  wav     │
//!                                     └───────────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod stream;

pub use auth::{MemoryTokenStore, SqliteTokenStore, TokenProvider, TokenStore};
pub use config::Config;
pub use engine::{
    AudioFormat, AudioQueueEngine, ChunkOutcome, CpalBackend, DrainedSignal, EngineSnapshot,
    EngineState, OutputBackend, OutputDevice, WavBackend,
};
pub use error::{EngineError, Error, OrchestratorError, Result, StreamError, TokenError};
pub use orchestrator::{PlaybackEvent, PlaybackOrchestrator, StepPhase, StepPlayback};
pub use stream::{SpeechRequest, SpeechSource, StreamIngester, StreamSession};
