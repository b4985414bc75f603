//! Configuration for the onboarding playback core

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Default auth endpoint issuing anonymous identity tokens
pub const DEFAULT_AUTH_URL: &str = "https://api-dev.asah.dev/users/verify";

/// Default speech endpoint streaming PCM per step
pub const DEFAULT_SPEECH_URL: &str = "https://api-dev.asah.dev/conversations/onboarding/speech";

/// Response header carrying the step's transcription text
pub const DEFAULT_TRANSCRIPTION_HEADER: &str = "x-transcription";

/// Fixed re-segmentation size for the incoming byte stream
pub const DEFAULT_CHUNK_THRESHOLD: usize = 512;

/// Steps keep chaining while the finished step is at or below this id
pub const DEFAULT_CONTINUE_WHILE_STEP_LE: u32 = 3;

/// Delay between the last buffer returning and the drained notification
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(1000);

/// Upper bound on buffer slots held by the output device at once
pub const DEFAULT_MAX_SLOTS: usize = 4096;

/// Playback core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint configuration
    pub endpoints: EndpointConfig,

    /// Step chaining configuration
    pub session: SessionConfig,

    /// Audio engine configuration
    pub engine: EngineConfig,

    /// Token store location (`None` keeps the token in memory only)
    pub token_store_path: Option<PathBuf>,
}

/// Remote endpoints
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Auth endpoint (`POST`, anonymous bearer)
    pub auth_url: String,

    /// Speech endpoint (`POST`, chunked PCM response)
    pub speech_url: String,

    /// Header name holding the transcription text
    pub transcription_header: String,
}

/// Step chain configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Voice used for every step
    pub voice_id: u32,

    /// Step the chain starts at
    pub first_step: u32,

    /// A finished step chains into the next while `step_id <= continue_while_step_le`
    pub continue_while_step_le: u32,
}

/// Audio engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk size handed to the engine
    pub chunk_threshold: usize,

    /// Grace delay covering render lag past buffer return
    pub drain_grace: Duration,

    /// Slot pool capacity
    pub max_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: EndpointConfig::default(),
            session: SessionConfig::default(),
            engine: EngineConfig::default(),
            token_store_path: None,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            speech_url: DEFAULT_SPEECH_URL.to_string(),
            transcription_header: DEFAULT_TRANSCRIPTION_HEADER.to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice_id: 1,
            first_step: 1,
            continue_while_step_le: DEFAULT_CONTINUE_WHILE_STEP_LE,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            drain_grace: DEFAULT_DRAIN_GRACE,
            max_slots: DEFAULT_MAX_SLOTS,
        }
    }
}

/// Return the platform data directory used for the token store
///
/// Uses `~/.local/share/voice-onboarding/` on Linux
#[must_use]
pub fn data_dir() -> PathBuf {
    let data_dir = directories::ProjectDirs::from("dev", "onboarding", "voice-onboarding")
        .map_or_else(|| PathBuf::from(".voice-onboarding"), |d| d.data_dir().to_path_buf());

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::warn!(
            path = %data_dir.display(),
            error = %e,
            "failed to create data directory"
        );
    }

    data_dir
}

impl Config {
    /// Load configuration from `ONBOARD_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns error if a numeric setting is malformed
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let endpoints = EndpointConfig {
            auth_url: std::env::var("ONBOARD_AUTH_URL").unwrap_or(defaults.endpoints.auth_url),
            speech_url: std::env::var("ONBOARD_SPEECH_URL")
                .unwrap_or(defaults.endpoints.speech_url),
            transcription_header: std::env::var("ONBOARD_TRANSCRIPTION_HEADER")
                .unwrap_or(defaults.endpoints.transcription_header),
        };

        let session = SessionConfig {
            voice_id: env_parse("ONBOARD_VOICE_ID", defaults.session.voice_id)?,
            first_step: env_parse("ONBOARD_FIRST_STEP", defaults.session.first_step)?,
            continue_while_step_le: env_parse(
                "ONBOARD_CONTINUE_WHILE_STEP_LE",
                defaults.session.continue_while_step_le,
            )?,
        };

        let engine = EngineConfig {
            chunk_threshold: env_parse("ONBOARD_CHUNK_THRESHOLD", defaults.engine.chunk_threshold)?,
            drain_grace: Duration::from_millis(env_parse(
                "ONBOARD_DRAIN_GRACE_MS",
                u64::try_from(defaults.engine.drain_grace.as_millis()).unwrap_or(u64::MAX),
            )?),
            max_slots: env_parse("ONBOARD_MAX_SLOTS", defaults.engine.max_slots)?,
        };

        if engine.chunk_threshold == 0 {
            return Err(Error::Config("chunk threshold must be non-zero".to_string()));
        }

        // In-memory store when explicitly disabled, platform data dir otherwise
        let token_store_path = match std::env::var("ONBOARD_TOKEN_STORE") {
            Ok(v) if v == "memory" => None,
            Ok(v) => Some(PathBuf::from(v)),
            Err(_) => Some(data_dir().join("tokens.db")),
        };

        tracing::debug!(
            auth_url = %endpoints.auth_url,
            speech_url = %endpoints.speech_url,
            voice_id = session.voice_id,
            first_step = session.first_step,
            "configuration loaded"
        );

        Ok(Self {
            endpoints,
            session,
            engine,
            token_store_path,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}
