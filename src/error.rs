//! Error types for the onboarding playback core

use thiserror::Error;

/// Result type alias for crate-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the playback core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Token acquisition error
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Speech stream error
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Audio engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Step chain error
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while obtaining the bearer token
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Auth endpoint answered 200 but the body had no token field
    #[error("auth response did not contain a token")]
    MissingToken,

    /// Auth endpoint answered with a non-200 status or an undecodable body
    #[error("invalid auth response: {0}")]
    InvalidResponse(String),

    /// Transport failure talking to the auth endpoint
    #[error("auth network error: {0}")]
    NetworkError(String),

    /// Key-value store failure
    #[error("token storage error: {0}")]
    Storage(String),
}

/// Failures while opening or consuming the speech stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Request URL could not be built (local, no network involved)
    #[error("invalid speech url: {0}")]
    InvalidUrl(String),

    /// Transport failure before or during the body
    #[error("speech stream network failure: {0}")]
    NetworkFailure(String),

    /// Speech endpoint refused the request before any audio
    #[error("speech endpoint returned status {0}")]
    UnexpectedStatus(u16),

    /// Response metadata could not be decoded
    #[error("failed to decode speech response: {0}")]
    DecodeFailure(String),
}

/// Audio engine failures
///
/// Per-chunk variants are absorbed by the engine (logged, chunk dropped);
/// state variants are returned to the caller as programming errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// `initialize` called twice without an intervening `stop`
    #[error("engine already initialized")]
    AlreadyInitialized,

    /// Operation requires an initialized engine
    #[error("engine not ready")]
    NotReady,

    /// No buffer slot could be allocated for a chunk
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// Output device could not be opened
    #[error("failed to open output device: {0}")]
    DeviceOpen(String),

    /// Output device could not be started
    #[error("failed to start output device: {0}")]
    DeviceStart(String),

    /// Output device rejected a buffer
    #[error("failed to submit buffer: {0}")]
    Submit(String),

    /// Output device could not be paused or resumed
    #[error("failed to pause or resume output device: {0}")]
    Control(String),

    /// Engine was stopped before the pending playback drained
    #[error("engine stopped before playback drained")]
    Stopped,

    /// Engine task is gone
    #[error("engine task terminated")]
    Terminated,
}

impl EngineError {
    /// Whether the failure only costs the current chunk's audio
    #[must_use]
    pub const fn is_chunk_local(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed(_) | Self::DeviceStart(_) | Self::Submit(_)
        )
    }
}

/// Failures that abort a chained playback session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// Token could not be obtained
    #[error("step {step_id}: {source}")]
    Token {
        step_id: u32,
        #[source]
        source: TokenError,
    },

    /// Speech stream failed to open or broke mid-stream
    #[error("step {step_id}: {source}")]
    Stream {
        step_id: u32,
        #[source]
        source: StreamError,
    },

    /// Engine refused a state transition
    #[error("step {step_id}: {source}")]
    Engine {
        step_id: u32,
        #[source]
        source: EngineError,
    },

    /// Playback was stopped before the step drained
    #[error("step {step_id}: playback cancelled")]
    Cancelled { step_id: u32 },
}

impl OrchestratorError {
    /// Step the failure occurred in
    #[must_use]
    pub const fn step_id(&self) -> u32 {
        match self {
            Self::Token { step_id, .. }
            | Self::Stream { step_id, .. }
            | Self::Engine { step_id, .. }
            | Self::Cancelled { step_id } => *step_id,
        }
    }
}
