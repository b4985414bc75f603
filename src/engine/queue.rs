//! Engine task and its handle

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::device::{DeviceEvent, DeviceEvents, OutputBackend, OutputDevice};
use super::format::AudioFormat;
use super::slots::{SlotArena, SlotId};
use crate::config::EngineConfig;
use crate::error::EngineError;

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Playing,
    Stopped,
}

/// Result of handing one chunk to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk was submitted; `active` is the counter after the increment
    Enqueued { slot: SlotId, active: usize },
    /// Chunk audio was dropped; the session continues
    Dropped(EngineError),
}

/// Point-in-time view of engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub state: EngineState,
    /// Buffers owned by the device and not yet reported finished
    pub active_buffers: usize,
    /// Slots not currently free
    pub live_slots: usize,
    /// End of input signalled for the current step
    pub input_ended: bool,
    /// A drained notification is waiting to fire
    pub drain_pending: bool,
    /// Rendering is suspended; drain detection is held until resume
    pub paused: bool,
    pub enqueued: u64,
    pub completed: u64,
    pub dropped: u64,
}

/// Resolves once the current step's audio has drained
#[derive(Debug)]
pub struct DrainedSignal {
    rx: oneshot::Receiver<()>,
}

impl DrainedSignal {
    /// Wait for the drained notification
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] if the engine stopped first
    pub async fn wait(self) -> Result<(), EngineError> {
        self.rx.await.map_err(|_| EngineError::Stopped)
    }
}

enum Command {
    Initialize {
        format: AudioFormat,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Enqueue {
        chunk: Vec<u8>,
        reply: oneshot::Sender<Result<ChunkOutcome, EngineError>>,
    },
    EndOfInput {
        reply: oneshot::Sender<Result<DrainedSignal, EngineError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
}

/// Events generated off the engine task and applied on it
#[derive(Debug)]
pub(crate) enum Internal {
    Device { device_id: u64, event: DeviceEvent },
    GraceElapsed { epoch: u64 },
}

/// Handle to the audio engine task
///
/// Cloning the handle shares the same engine. Commands are applied in the
/// order they are sent; the task exits, disposing of the device, once every
/// handle is dropped.
#[derive(Clone)]
pub struct AudioQueueEngine {
    commands: mpsc::UnboundedSender<Command>,
}

impl AudioQueueEngine {
    /// Spawn the engine task
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime
    #[must_use]
    pub fn spawn(backend: Arc<dyn OutputBackend>, config: &EngineConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let task = EngineTask {
            backend,
            grace: config.drain_grace,
            max_slots: config.max_slots,
            slot_capacity: config.chunk_threshold.max(1),
            state: EngineState::Uninitialized,
            device: None,
            device_id: 0,
            device_started: false,
            paused: false,
            slots: SlotArena::new(0, 0),
            active: 0,
            input_ended: false,
            drained_tx: None,
            drain_epoch: 0,
            drain_scheduled: false,
            enqueued: 0,
            completed: 0,
            dropped: 0,
            internal_tx,
        };
        tokio::spawn(task.run(command_rx, internal_rx));

        Self { commands }
    }

    /// Open the output device for `format` (`Uninitialized | Stopped → Ready`)
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyInitialized`] without an intervening `stop`
    /// - [`EngineError::DeviceOpen`] if the device cannot be opened
    pub async fn initialize(&self, format: AudioFormat) -> Result<(), EngineError> {
        self.request(|reply| Command::Initialize { format, reply })
            .await?
    }

    /// Copy a chunk into a slot and submit it to the device
    ///
    /// Allocation, start, and submit failures only drop this chunk and are
    /// reported as [`ChunkOutcome::Dropped`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotReady`] unless the engine is `Ready` or `Playing`
    pub async fn enqueue_chunk(&self, chunk: Vec<u8>) -> Result<ChunkOutcome, EngineError> {
        self.request(|reply| Command::Enqueue { chunk, reply })
            .await?
    }

    /// Mark the end of the current input stream
    ///
    /// The returned signal fires once, a grace delay after the active buffer
    /// count reaches zero with input ended.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotReady`] unless the engine is `Ready` or `Playing`
    pub async fn end_of_input(&self) -> Result<DrainedSignal, EngineError> {
        self.request(|reply| Command::EndOfInput { reply }).await?
    }

    /// Suspend rendering without dropping queued buffers
    ///
    /// Chunks may still be enqueued while paused. No drained notification
    /// fires until [`AudioQueueEngine::resume`]. Idempotent.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotReady`] unless the engine is `Ready` or `Playing`
    /// - [`EngineError::Control`] if the device cannot pause
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Pause { reply }).await?
    }

    /// Continue rendering after [`AudioQueueEngine::pause`]
    ///
    /// A drain held back by the pause is rescheduled. No-op when not paused.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotReady`] unless the engine is `Ready` or `Playing`
    /// - [`EngineError::Control`] if the device cannot resume
    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    /// Halt and dispose of the device, dropping all buffers
    ///
    /// No drained notification fires after this returns. Idempotent.
    pub async fn stop(&self) {
        // Task gone means the device is already disposed
        let _ = self.request(|reply| Command::Stop { reply }).await;
    }

    /// Current engine state
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Terminated`] if the engine task is gone
    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| EngineError::Terminated)?;
        rx.await.map_err(|_| EngineError::Terminated)
    }
}

struct EngineTask {
    backend: Arc<dyn OutputBackend>,
    grace: Duration,
    max_slots: usize,
    slot_capacity: usize,

    state: EngineState,
    device: Option<Box<dyn OutputDevice>>,
    device_id: u64,
    device_started: bool,
    paused: bool,
    slots: SlotArena,

    active: usize,
    input_ended: bool,
    drained_tx: Option<oneshot::Sender<()>>,
    drain_epoch: u64,
    drain_scheduled: bool,

    enqueued: u64,
    completed: u64,
    dropped: u64,

    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl EngineTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(event) = internal.recv() => self.handle_internal(event),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        self.stop();
        tracing::debug!("audio engine task exited");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { format, reply } => {
                let _ = reply.send(self.initialize(format));
            }
            Command::Enqueue { chunk, reply } => {
                let _ = reply.send(self.enqueue(&chunk));
            }
            Command::EndOfInput { reply } => {
                let _ = reply.send(self.end_of_input());
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume());
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Device { device_id, event } => {
                if self.device.is_none() || device_id != self.device_id {
                    tracing::trace!(device_id, ?event, "ignoring event from disposed device");
                    return;
                }
                match event {
                    DeviceEvent::Started(slot) => {
                        self.slots.mark_playing(slot);
                    }
                    DeviceEvent::Finished(slot) => self.buffer_finished(slot),
                }
            }
            Internal::GraceElapsed { epoch } => {
                if epoch != self.drain_epoch || !self.drain_scheduled {
                    return;
                }
                self.drain_scheduled = false;
                self.input_ended = false;
                if let Some(tx) = self.drained_tx.take() {
                    tracing::debug!(completed = self.completed, "playback drained");
                    let _ = tx.send(());
                }
            }
        }
    }

    fn initialize(&mut self, format: AudioFormat) -> Result<(), EngineError> {
        if matches!(self.state, EngineState::Ready | EngineState::Playing) {
            return Err(EngineError::AlreadyInitialized);
        }

        let device_id = self.device_id + 1;
        let events = DeviceEvents::new(device_id, self.internal_tx.clone());
        let device = self.backend.open(format, events)?;

        self.device_id = device_id;
        self.device = Some(device);
        self.device_started = false;
        self.paused = false;
        self.slots = SlotArena::new(self.max_slots, self.slot_capacity);
        self.state = EngineState::Ready;

        tracing::debug!(
            device_id,
            sample_rate = format.sample_rate,
            channels = format.channels,
            "audio engine initialized"
        );
        Ok(())
    }

    fn enqueue(&mut self, chunk: &[u8]) -> Result<ChunkOutcome, EngineError> {
        if !matches!(self.state, EngineState::Ready | EngineState::Playing) {
            return Err(EngineError::NotReady);
        }
        let Some(device) = self.device.as_mut() else {
            return Err(EngineError::NotReady);
        };

        let slot = match self.slots.allocate(chunk) {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(error = %e, bytes = chunk.len(), "dropping chunk");
                self.dropped += 1;
                return Ok(ChunkOutcome::Dropped(e));
            }
        };

        if !self.device_started {
            if let Err(e) = device.start() {
                tracing::warn!(error = %e, "dropping chunk");
                self.slots.release(slot);
                self.dropped += 1;
                return Ok(ChunkOutcome::Dropped(e));
            }
            self.device_started = true;
            self.state = EngineState::Playing;
            tracing::debug!(device_id = self.device_id, "output device started");

            // Paused before the first chunk: hold the device right after start
            if self.paused {
                if let Err(e) = device.pause() {
                    tracing::warn!(error = %e, "failed to pause output device");
                }
            }
        }

        let data = self.slots.data(slot).unwrap_or_default();
        if let Err(e) = device.submit(slot, data) {
            tracing::warn!(error = %e, "dropping chunk");
            self.slots.release(slot);
            self.dropped += 1;
            return Ok(ChunkOutcome::Dropped(e));
        }

        self.slots.mark_enqueued(slot);
        self.active += 1;
        self.enqueued += 1;

        // More audio arrived: the pending drain no longer covers the tail
        if self.drain_scheduled {
            self.drain_scheduled = false;
            self.drain_epoch += 1;
        }

        tracing::trace!(bytes = chunk.len(), active = self.active, "buffer enqueued");
        Ok(ChunkOutcome::Enqueued {
            slot,
            active: self.active,
        })
    }

    fn buffer_finished(&mut self, slot: SlotId) {
        if !self.slots.complete(slot) {
            tracing::trace!(?slot, "ignoring completion for stale slot");
            return;
        }

        debug_assert!(self.active > 0, "completion without an active buffer");
        self.active = self.active.saturating_sub(1);
        self.completed += 1;
        tracing::trace!(active = self.active, "buffer finished");

        self.schedule_drain_if_idle();
    }

    fn end_of_input(&mut self) -> Result<DrainedSignal, EngineError> {
        if !matches!(self.state, EngineState::Ready | EngineState::Playing) {
            return Err(EngineError::NotReady);
        }

        let (tx, rx) = oneshot::channel();
        self.drained_tx = Some(tx);
        self.input_ended = true;
        self.drain_epoch += 1;
        self.drain_scheduled = false;

        tracing::debug!(active = self.active, "end of input");
        self.schedule_drain_if_idle();

        Ok(DrainedSignal { rx })
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        if !matches!(self.state, EngineState::Ready | EngineState::Playing) {
            return Err(EngineError::NotReady);
        }
        if self.paused {
            return Ok(());
        }

        if self.device_started {
            if let Some(device) = self.device.as_mut() {
                device.pause()?;
            }
        }
        self.paused = true;

        // Hold a drain that was waiting out its grace delay
        if self.drain_scheduled {
            self.drain_scheduled = false;
            self.drain_epoch += 1;
        }

        tracing::debug!(active = self.active, "playback paused");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        if !matches!(self.state, EngineState::Ready | EngineState::Playing) {
            return Err(EngineError::NotReady);
        }
        if !self.paused {
            return Ok(());
        }

        if self.device_started {
            if let Some(device) = self.device.as_mut() {
                device.resume()?;
            }
        }
        self.paused = false;

        tracing::debug!(active = self.active, "playback resumed");
        self.schedule_drain_if_idle();
        Ok(())
    }

    fn schedule_drain_if_idle(&mut self) {
        if self.paused
            || !self.input_ended
            || self.active != 0
            || self.drain_scheduled
            || self.drained_tx.is_none()
        {
            return;
        }

        self.drain_scheduled = true;
        let epoch = self.drain_epoch;
        let grace = self.grace;
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(Internal::GraceElapsed { epoch });
        });
    }

    fn stop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop();
            tracing::debug!(device_id = self.device_id, "output device disposed");
        }

        self.slots.clear();
        self.active = 0;
        self.input_ended = false;
        self.drained_tx = None;
        self.drain_epoch += 1;
        self.drain_scheduled = false;
        self.device_started = false;
        self.paused = false;
        self.state = EngineState::Stopped;
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state,
            active_buffers: self.active,
            live_slots: self.slots.live(),
            input_ended: self.input_ended,
            drain_pending: self.drained_tx.is_some(),
            paused: self.paused,
            enqueued: self.enqueued,
            completed: self.completed,
            dropped: self.dropped,
        }
    }
}
