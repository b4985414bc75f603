//! Shared test utilities
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use voice_onboarding::auth::TOKEN_SLOT;
use voice_onboarding::config::EngineConfig;
use voice_onboarding::engine::{DeviceEvents, SlotId};
use voice_onboarding::stream::{SpeechMetadata, rechunk};
use voice_onboarding::{
    AudioFormat, EngineError, MemoryTokenStore, OutputBackend, OutputDevice, SpeechRequest,
    SpeechSource, StreamError, StreamSession, TokenProvider, TokenStore,
};

/// Serve `router` on an ephemeral local port, returning its base URL
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("no local addr");

    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server failed");
    });

    format!("http://{addr}")
}

/// Engine config with a short drain grace
#[must_use]
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        drain_grace: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

/// Token provider with a pre-seeded token and an unreachable auth endpoint
#[must_use]
pub fn cached_token_provider(token: &str) -> Arc<TokenProvider> {
    let store = Arc::new(MemoryTokenStore::new());
    store.set(TOKEN_SLOT, token).expect("failed to seed token");
    Arc::new(
        TokenProvider::new(reqwest::Client::new(), "http://127.0.0.1:9/verify", store)
            .expect("failed to build token provider"),
    )
}

/// Token provider with an empty store and an unreachable auth endpoint
#[must_use]
pub fn unreachable_token_provider() -> Arc<TokenProvider> {
    Arc::new(
        TokenProvider::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/verify",
            Arc::new(MemoryTokenStore::new()),
        )
        .expect("failed to build token provider"),
    )
}

#[derive(Default)]
struct DeviceLog {
    opened: usize,
    started: usize,
    stopped: usize,
    paused: usize,
    resumed: usize,
    submitted: Vec<(SlotId, usize)>,
    pending: VecDeque<(usize, SlotId)>,
    events: Vec<DeviceEvents>,
}

/// Scripted output backend
///
/// In manual mode buffers stay pending until the test completes them; in
/// auto mode every buffer finishes as soon as it is submitted.
#[derive(Clone)]
pub struct ManualBackend {
    log: Arc<Mutex<DeviceLog>>,
    auto_complete: bool,
    fail_start: bool,
}

impl ManualBackend {
    #[must_use]
    pub fn manual() -> Self {
        Self {
            log: Arc::default(),
            auto_complete: false,
            fail_start: false,
        }
    }

    #[must_use]
    pub fn auto() -> Self {
        Self {
            auto_complete: true,
            ..Self::manual()
        }
    }

    /// Backend whose devices refuse to start
    #[must_use]
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::manual()
        }
    }

    /// Report the oldest pending buffer finished; false if none is pending
    pub fn complete_next(&self) -> bool {
        let mut log = self.log.lock().unwrap();
        let Some((device, slot)) = log.pending.pop_front() else {
            return false;
        };
        let events = log.events[device].clone();
        drop(log);
        events.started(slot);
        events.finished(slot);
        true
    }

    /// Report every pending buffer finished
    pub fn complete_all(&self) -> usize {
        let mut count = 0;
        while self.complete_next() {
            count += 1;
        }
        count
    }

    /// Event handle of the `n`th opened device
    #[must_use]
    pub fn device_events(&self, n: usize) -> DeviceEvents {
        self.log.lock().unwrap().events[n].clone()
    }

    #[must_use]
    pub fn submitted(&self) -> Vec<(SlotId, usize)> {
        self.log.lock().unwrap().submitted.clone()
    }

    #[must_use]
    pub fn submitted_sizes(&self) -> Vec<usize> {
        self.submitted().into_iter().map(|(_, len)| len).collect()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.log.lock().unwrap().pending.len()
    }

    #[must_use]
    pub fn opened(&self) -> usize {
        self.log.lock().unwrap().opened
    }

    #[must_use]
    pub fn started(&self) -> usize {
        self.log.lock().unwrap().started
    }

    #[must_use]
    pub fn stopped(&self) -> usize {
        self.log.lock().unwrap().stopped
    }

    #[must_use]
    pub fn paused(&self) -> usize {
        self.log.lock().unwrap().paused
    }

    #[must_use]
    pub fn resumed(&self) -> usize {
        self.log.lock().unwrap().resumed
    }
}

impl OutputBackend for ManualBackend {
    fn open(
        &self,
        _format: AudioFormat,
        events: DeviceEvents,
    ) -> Result<Box<dyn OutputDevice>, EngineError> {
        let mut log = self.log.lock().unwrap();
        let index = log.events.len();
        log.opened += 1;
        log.events.push(events.clone());

        Ok(Box::new(ManualDevice {
            log: Arc::clone(&self.log),
            index,
            events,
            auto_complete: self.auto_complete,
            fail_start: self.fail_start,
        }))
    }
}

struct ManualDevice {
    log: Arc<Mutex<DeviceLog>>,
    index: usize,
    events: DeviceEvents,
    auto_complete: bool,
    fail_start: bool,
}

impl OutputDevice for ManualDevice {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.fail_start {
            return Err(EngineError::DeviceStart("scripted failure".to_string()));
        }
        self.log.lock().unwrap().started += 1;
        Ok(())
    }

    fn submit(&mut self, slot: SlotId, pcm: &[u8]) -> Result<(), EngineError> {
        let mut log = self.log.lock().unwrap();
        log.submitted.push((slot, pcm.len()));
        if self.auto_complete {
            drop(log);
            self.events.started(slot);
            self.events.finished(slot);
        } else {
            log.pending.push_back((self.index, slot));
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        self.log.lock().unwrap().paused += 1;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        self.log.lock().unwrap().resumed += 1;
        Ok(())
    }

    fn stop(&mut self) {
        let mut log = self.log.lock().unwrap();
        log.stopped += 1;
        let index = self.index;
        log.pending.retain(|(device, _)| *device != index);
    }
}

/// One step's scripted response
#[derive(Clone, Default)]
pub struct StepScript {
    pub transcription: Option<String>,
    /// Body pieces as they would arrive off the network
    pub pieces: Vec<Result<Vec<u8>, String>>,
    /// Fail before the body starts
    pub open_error: Option<StreamError>,
    /// Time the endpoint takes to answer
    pub open_delay: Option<Duration>,
}

impl StepScript {
    /// A step delivering `len` bytes in 300-byte pieces
    #[must_use]
    pub fn audio(transcription: &str, len: usize) -> Self {
        let body = vec![0_u8; len];
        Self {
            transcription: Some(transcription.to_string()),
            pieces: body.chunks(300).map(|c| Ok(c.to_vec())).collect(),
            open_error: None,
            open_delay: None,
        }
    }

    /// Answer only after `delay`
    #[must_use]
    pub fn answered_after(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// A step whose body fails after `len` bytes
    #[must_use]
    pub fn broken(transcription: &str, len: usize) -> Self {
        let mut script = Self::audio(transcription, len);
        script.pieces.push(Err("connection reset".to_string()));
        script
    }
}

/// Speech source serving scripted steps and recording requests
#[derive(Clone, Default)]
pub struct ScriptedSource {
    steps: Arc<HashMap<u32, StepScript>>,
    requests: Arc<Mutex<Vec<(String, SpeechRequest)>>>,
}

impl ScriptedSource {
    #[must_use]
    pub fn new(steps: impl IntoIterator<Item = (u32, StepScript)>) -> Self {
        Self {
            steps: Arc::new(steps.into_iter().collect()),
            requests: Arc::default(),
        }
    }

    /// Step ids requested so far, in order
    #[must_use]
    pub fn requested_steps(&self) -> Vec<u32> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.step_id)
            .collect()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<(String, SpeechRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSource for ScriptedSource {
    async fn open_stream(
        &self,
        token: &str,
        request: SpeechRequest,
    ) -> Result<StreamSession, StreamError> {
        self.requests
            .lock()
            .unwrap()
            .push((token.to_string(), request));

        let script = self
            .steps
            .get(&request.step_id)
            .cloned()
            .ok_or(StreamError::UnexpectedStatus(404))?;

        if let Some(delay) = script.open_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = script.open_error {
            return Err(e);
        }

        Ok(StreamSession {
            step_id: request.step_id,
            voice_id: request.voice_id,
            format: AudioFormat::PCM_S16LE_MONO_16K,
            metadata: SpeechMetadata {
                transcription: script.transcription,
                content_type: Some("audio/pcm".to_string()),
            },
            chunks: rechunk(futures::stream::iter(script.pieces), 512),
        })
    }
}
