//! Speech endpoint client

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName};
use serde::Serialize;
use url::Url;

use super::rechunk::{ChunkStream, rechunk};
use crate::config::EndpointConfig;
use crate::engine::AudioFormat;
use crate::error::StreamError;
use crate::{Error, Result};

/// Audio format requested from the speech endpoint
pub const AUDIO_FORMAT_PCM: &str = "pcm";

/// One step's speech request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechRequest {
    pub voice_id: u32,
    pub step_id: u32,
}

/// Metadata captured once when the response arrives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeechMetadata {
    /// Transcription text for the step, if the header was present
    pub transcription: Option<String>,

    /// Response content type
    pub content_type: Option<String>,
}

/// Per-step stream context
pub struct StreamSession {
    pub step_id: u32,
    pub voice_id: u32,
    pub format: AudioFormat,
    pub metadata: SpeechMetadata,
    /// Re-chunked PCM body
    pub chunks: ChunkStream,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("step_id", &self.step_id)
            .field("voice_id", &self.voice_id)
            .field("format", &self.format)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Source of per-step speech streams
#[async_trait]
pub trait SpeechSource: Send + Sync {
    /// Open the speech stream for one step
    ///
    /// Metadata is captured before any chunk is yielded.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails before the body starts
    async fn open_stream(
        &self,
        token: &str,
        request: SpeechRequest,
    ) -> std::result::Result<StreamSession, StreamError>;
}

#[derive(Serialize)]
struct SpeechBody {
    voice_id: u32,
    step_id: u32,
    audio_format: &'static str,
}

/// Streams PCM from the speech endpoint
#[derive(Debug, Clone)]
pub struct StreamIngester {
    client: reqwest::Client,
    speech_url: Url,
    transcription_header: HeaderName,
    chunk_threshold: usize,
}

impl StreamIngester {
    /// Create an ingester for the configured speech endpoint
    ///
    /// # Errors
    ///
    /// - [`StreamError::InvalidUrl`] if the speech URL is malformed
    /// - [`Error::Config`] if the transcription header name is invalid
    pub fn new(
        client: reqwest::Client,
        endpoints: &EndpointConfig,
        chunk_threshold: usize,
    ) -> Result<Self> {
        let speech_url = Url::parse(&endpoints.speech_url)
            .map_err(|e| StreamError::InvalidUrl(format!("{}: {e}", endpoints.speech_url)))?;

        let transcription_header = HeaderName::from_bytes(endpoints.transcription_header.as_bytes())
            .map_err(|e| {
                Error::Config(format!(
                    "invalid transcription header {}: {e}",
                    endpoints.transcription_header
                ))
            })?;

        Ok(Self {
            client,
            speech_url,
            transcription_header,
            chunk_threshold,
        })
    }

    fn capture_metadata(
        &self,
        headers: &HeaderMap,
    ) -> std::result::Result<SpeechMetadata, StreamError> {
        let transcription = headers
            .get(&self.transcription_header)
            .map(|value| decode_header_text(value.as_bytes()))
            .transpose()?;

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(SpeechMetadata {
            transcription,
            content_type,
        })
    }
}

#[async_trait]
impl SpeechSource for StreamIngester {
    async fn open_stream(
        &self,
        token: &str,
        request: SpeechRequest,
    ) -> std::result::Result<StreamSession, StreamError> {
        let body = SpeechBody {
            voice_id: request.voice_id,
            step_id: request.step_id,
            audio_format: AUDIO_FORMAT_PCM,
        };

        tracing::debug!(
            step_id = request.step_id,
            voice_id = request.voice_id,
            "opening speech stream"
        );

        let response = self
            .client
            .post(self.speech_url.clone())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StreamError::NetworkFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                step_id = request.step_id,
                status = status.as_u16(),
                "speech endpoint rejected request"
            );
            return Err(StreamError::UnexpectedStatus(status.as_u16()));
        }

        let metadata = self.capture_metadata(response.headers())?;
        tracing::debug!(
            step_id = request.step_id,
            has_transcription = metadata.transcription.is_some(),
            "speech stream opened"
        );

        Ok(StreamSession {
            step_id: request.step_id,
            voice_id: request.voice_id,
            format: AudioFormat::PCM_S16LE_MONO_16K,
            metadata,
            chunks: rechunk(response.bytes_stream(), self.chunk_threshold),
        })
    }
}

/// Decode a header value that may carry percent-encoded UTF-8
fn decode_header_text(raw: &[u8]) -> std::result::Result<String, StreamError> {
    let text =
        std::str::from_utf8(raw).map_err(|e| StreamError::DecodeFailure(e.to_string()))?;
    urlencoding::decode(text)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| StreamError::DecodeFailure(e.to_string()))
}
