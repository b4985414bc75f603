//! Multi-step playback sequencing
//!
//! Each step obtains a token, opens the step's speech stream, feeds every
//! chunk to the engine in order, and waits for the engine's drained signal.
//! A finished step chains into the next while its id is at or below the
//! configured bound; any failure ends the whole chain. Nothing is retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::auth::{MemoryTokenStore, SqliteTokenStore, TokenProvider, TokenStore};
use crate::config::{Config, SessionConfig};
use crate::engine::{AudioFormat, AudioQueueEngine, ChunkOutcome, OutputBackend};
use crate::error::{EngineError, OrchestratorError};
use crate::stream::{SpeechRequest, SpeechSource, StreamIngester, StreamSession};
use crate::Result;

/// Per-step lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Failed,
}

/// Progress reported while a chain runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A step moved to a new phase
    Phase { step_id: u32, phase: StepPhase },
    /// Transcription captured when the step's stream opened
    Transcription {
        step_id: u32,
        text: Option<String>,
    },
}

/// Audio of one step, resolving when it has drained
#[derive(Debug)]
pub struct StepPlayback {
    step_id: u32,
    rx: oneshot::Receiver<std::result::Result<(), OrchestratorError>>,
}

impl StepPlayback {
    #[must_use]
    pub const fn step_id(&self) -> u32 {
        self.step_id
    }

    /// Wait until the step's audio has drained
    ///
    /// # Errors
    ///
    /// Returns the step's stream or engine failure, or
    /// [`OrchestratorError::Cancelled`] if playback was stopped
    pub async fn finished(self) -> std::result::Result<(), OrchestratorError> {
        let step_id = self.step_id;
        self.rx
            .await
            .unwrap_or(Err(OrchestratorError::Cancelled { step_id }))
    }
}

/// Drives the chained onboarding conversation
pub struct PlaybackOrchestrator {
    tokens: Arc<TokenProvider>,
    speech: Arc<dyn SpeechSource>,
    engine: AudioQueueEngine,
    session: SessionConfig,
    // Engine is initialized once per chain, not per step
    engine_ready: Mutex<bool>,
    // Set by `stop`, cleared when a new chain or single step begins
    cancelled: AtomicBool,
    phase: std::sync::Mutex<(u32, StepPhase)>,
}

impl PlaybackOrchestrator {
    #[must_use]
    pub fn new(
        tokens: Arc<TokenProvider>,
        speech: Arc<dyn SpeechSource>,
        engine: AudioQueueEngine,
        session: SessionConfig,
    ) -> Self {
        Self {
            tokens,
            speech,
            engine,
            phase: std::sync::Mutex::new((session.first_step, StepPhase::Idle)),
            session,
            engine_ready: Mutex::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Build the full stack from configuration
    ///
    /// Must be called within a Tokio runtime (the engine task is spawned).
    ///
    /// # Errors
    ///
    /// Returns error if an endpoint is malformed or the token store cannot
    /// be opened
    pub fn from_config(config: &Config, backend: Arc<dyn OutputBackend>) -> Result<Self> {
        let client = reqwest::Client::new();

        let store: Arc<dyn TokenStore> = match &config.token_store_path {
            Some(path) => Arc::new(SqliteTokenStore::open(path)?),
            None => Arc::new(MemoryTokenStore::new()),
        };

        let tokens = Arc::new(TokenProvider::new(
            client.clone(),
            &config.endpoints.auth_url,
            store,
        )?);
        let speech = Arc::new(StreamIngester::new(
            client,
            &config.endpoints,
            config.engine.chunk_threshold,
        )?);
        let engine = AudioQueueEngine::spawn(backend, &config.engine);

        Ok(Self::new(tokens, speech, engine, config.session.clone()))
    }

    /// Token provider shared by every step
    #[must_use]
    pub const fn tokens(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    /// Engine handle (for inspection)
    #[must_use]
    pub const fn engine(&self) -> &AudioQueueEngine {
        &self.engine
    }

    /// Most recent step and its phase
    ///
    /// `Idle` until the first step is requested; a failed chain stays at the
    /// step that failed.
    #[must_use]
    pub fn phase(&self) -> (u32, StepPhase) {
        self.phase
            .lock()
            .map_or((self.session.first_step, StepPhase::Idle), |p| *p)
    }

    /// Open one step and start feeding its audio
    ///
    /// Returns the step's transcription as soon as the stream opens, together
    /// with a handle resolving when the step's audio has drained.
    ///
    /// # Errors
    ///
    /// Returns error if the token, the stream, or engine initialization fails
    pub async fn get_transcription_and_audio_for_step(
        &self,
        step_id: u32,
    ) -> std::result::Result<(Option<String>, StepPlayback), OrchestratorError> {
        self.cancelled.store(false, Ordering::SeqCst);
        self.open_step(step_id).await
    }

    async fn open_step(
        &self,
        step_id: u32,
    ) -> std::result::Result<(Option<String>, StepPlayback), OrchestratorError> {
        self.check_cancelled(step_id)?;
        let token = self
            .tokens
            .get_valid_token()
            .await
            .map_err(|source| OrchestratorError::Token { step_id, source })?;
        self.check_cancelled(step_id)?;

        let request = SpeechRequest {
            voice_id: self.session.voice_id,
            step_id,
        };
        let session = self
            .speech
            .open_stream(&token, request)
            .await
            .map_err(|source| OrchestratorError::Stream { step_id, source })?;
        self.check_cancelled(step_id)?;

        self.ensure_engine(step_id, session.format).await?;

        let transcription = session.metadata.transcription.clone();
        let (tx, rx) = oneshot::channel();
        let engine = self.engine.clone();

        tokio::spawn(async move {
            let result = feed(engine, session).await;
            let _ = tx.send(result);
        });

        Ok((transcription, StepPlayback { step_id, rx }))
    }

    /// Play `step_id` and every step it chains into
    ///
    /// # Errors
    ///
    /// Returns the first failure; later steps are not attempted. A
    /// [`PlaybackOrchestrator::stop`] at any point ends the chain with
    /// [`OrchestratorError::Cancelled`].
    pub async fn drive_step(
        &self,
        step_id: u32,
        events: &mpsc::Sender<PlaybackEvent>,
    ) -> std::result::Result<(), OrchestratorError> {
        self.cancelled.store(false, Ordering::SeqCst);

        let mut step_id = step_id;
        loop {
            self.check_cancelled(step_id)?;
            self.play_step(step_id, events).await?;

            if step_id > self.session.continue_while_step_le {
                return Ok(());
            }
            let Some(next) = step_id.checked_add(1) else {
                return Ok(());
            };
            step_id = next;
        }
    }

    /// Run the whole chain from the configured first step
    ///
    /// Progress is reported on `events`; the terminal result is returned
    /// exactly once. The engine is stopped when the chain ends.
    ///
    /// # Errors
    ///
    /// Returns the failure that aborted the chain
    pub async fn run(
        &self,
        events: mpsc::Sender<PlaybackEvent>,
    ) -> std::result::Result<(), OrchestratorError> {
        let first_step = self.session.first_step;
        tracing::info!(
            first_step,
            voice_id = self.session.voice_id,
            "playback chain started"
        );

        let result = self.drive_step(first_step, &events).await;
        self.stop().await;

        match &result {
            Ok(()) => tracing::info!("playback chain completed"),
            Err(e) => tracing::error!(step_id = e.step_id(), error = %e, "playback chain failed"),
        }
        result
    }

    /// Stop playback; a pending step resolves as cancelled
    ///
    /// A running chain does not advance to another step.
    pub async fn stop(&self) {
        let mut ready = self.engine_ready.lock().await;
        self.cancelled.store(true, Ordering::SeqCst);
        self.engine.stop().await;
        *ready = false;
    }

    /// Suspend playback of the current step
    ///
    /// The step does not complete while paused; streaming continues to
    /// queue audio.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotReady`] if no step is playing
    pub async fn pause(&self) -> std::result::Result<(), EngineError> {
        self.engine.pause().await?;
        tracing::info!(step_id = self.phase().0, "playback paused");
        Ok(())
    }

    /// Continue playback after [`PlaybackOrchestrator::pause`]
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotReady`] if no step is playing
    pub async fn resume(&self) -> std::result::Result<(), EngineError> {
        self.engine.resume().await?;
        tracing::info!(step_id = self.phase().0, "playback resumed");
        Ok(())
    }

    fn check_cancelled(&self, step_id: u32) -> std::result::Result<(), OrchestratorError> {
        if self.cancelled.load(Ordering::SeqCst) {
            tracing::debug!(step_id, "step cancelled");
            return Err(OrchestratorError::Cancelled { step_id });
        }
        Ok(())
    }

    async fn play_step(
        &self,
        step_id: u32,
        events: &mpsc::Sender<PlaybackEvent>,
    ) -> std::result::Result<(), OrchestratorError> {
        self.enter(step_id, StepPhase::Requesting, events).await;

        let result = self.stream_step(step_id, events).await;
        match &result {
            Ok(()) => {
                tracing::info!(step_id, "step completed");
                self.enter(step_id, StepPhase::Completed, events).await;
            }
            // Reported through the terminal result only
            Err(_) => self.set_phase(step_id, StepPhase::Failed),
        }
        result
    }

    async fn stream_step(
        &self,
        step_id: u32,
        events: &mpsc::Sender<PlaybackEvent>,
    ) -> std::result::Result<(), OrchestratorError> {
        let (text, playback) = self.open_step(step_id).await?;

        emit(events, PlaybackEvent::Transcription { step_id, text }).await;
        self.enter(step_id, StepPhase::Streaming, events).await;

        playback.finished().await
    }

    async fn enter(&self, step_id: u32, phase: StepPhase, events: &mpsc::Sender<PlaybackEvent>) {
        self.set_phase(step_id, phase);
        emit(events, PlaybackEvent::Phase { step_id, phase }).await;
    }

    fn set_phase(&self, step_id: u32, phase: StepPhase) {
        tracing::debug!(step_id, ?phase, "step phase");
        if let Ok(mut current) = self.phase.lock() {
            *current = (step_id, phase);
        }
    }

    async fn ensure_engine(
        &self,
        step_id: u32,
        format: AudioFormat,
    ) -> std::result::Result<(), OrchestratorError> {
        let mut ready = self.engine_ready.lock().await;
        // Checked under the lock so a concurrent stop cannot be outrun
        self.check_cancelled(step_id)?;
        if !*ready {
            self.engine
                .initialize(format)
                .await
                .map_err(|source| OrchestratorError::Engine { step_id, source })?;
            *ready = true;
        }
        Ok(())
    }
}

/// Feed a step's chunks to the engine in order, then wait for the drain
async fn feed(
    engine: AudioQueueEngine,
    session: StreamSession,
) -> std::result::Result<(), OrchestratorError> {
    let StreamSession {
        step_id,
        format,
        mut chunks,
        ..
    } = session;

    let mut total = 0_usize;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|source| OrchestratorError::Stream { step_id, source })?;
        let bytes = chunk.len();
        total += bytes;

        match engine
            .enqueue_chunk(chunk)
            .await
            .map_err(|e| engine_failure(step_id, e))?
        {
            ChunkOutcome::Enqueued { active, .. } => {
                tracing::trace!(step_id, bytes, active, "chunk fed");
            }
            ChunkOutcome::Dropped(e) => {
                tracing::debug!(step_id, bytes, error = %e, "chunk audio dropped");
            }
        }
    }

    tracing::debug!(
        step_id,
        bytes = total,
        audio_ms = u64::try_from(format.duration_of(total).as_millis()).unwrap_or(u64::MAX),
        "speech stream ended"
    );
    let drained = engine
        .end_of_input()
        .await
        .map_err(|e| engine_failure(step_id, e))?;
    drained.wait().await.map_err(|e| engine_failure(step_id, e))
}

/// A stopped engine means the chain was cancelled, not broken
fn engine_failure(step_id: u32, source: EngineError) -> OrchestratorError {
    match source {
        EngineError::Stopped | EngineError::NotReady | EngineError::Terminated => {
            OrchestratorError::Cancelled { step_id }
        }
        source => OrchestratorError::Engine { step_id, source },
    }
}

async fn emit(events: &mpsc::Sender<PlaybackEvent>, event: PlaybackEvent) {
    // Receiver gone: the caller no longer wants progress
    let _ = events.send(event).await;
}
