//! Speech stream ingestion
//!
//! Opens the per-step speech request and re-segments the chunked HTTP body
//! into fixed-size pieces for the audio engine.

mod ingester;
mod rechunk;

pub use ingester::{
    AUDIO_FORMAT_PCM, SpeechMetadata, SpeechRequest, SpeechSource, StreamIngester, StreamSession,
};
pub use rechunk::{ChunkStream, Rechunker, rechunk};
