//! Output device abstraction

use tokio::sync::mpsc;

use super::format::AudioFormat;
use super::queue::Internal;
use super::slots::SlotId;
use crate::error::EngineError;

/// Buffer progress reported by an output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device began rendering the slot
    Started(SlotId),
    /// The device returned the slot; its audio has been handed to hardware
    Finished(SlotId),
}

/// Handle an output device uses to report buffer progress
///
/// Events are posted into the engine's queue and applied on the engine task,
/// so this is safe to call from a device-owned thread or callback.
#[derive(Debug, Clone)]
pub struct DeviceEvents {
    device_id: u64,
    tx: mpsc::UnboundedSender<Internal>,
}

impl DeviceEvents {
    pub(crate) const fn new(device_id: u64, tx: mpsc::UnboundedSender<Internal>) -> Self {
        Self { device_id, tx }
    }

    pub fn started(&self, slot: SlotId) {
        self.post(DeviceEvent::Started(slot));
    }

    pub fn finished(&self, slot: SlotId) {
        self.post(DeviceEvent::Finished(slot));
    }

    /// Identifier of the device instance this handle belongs to
    #[must_use]
    pub const fn device_id(&self) -> u64 {
        self.device_id
    }

    fn post(&self, event: DeviceEvent) {
        // Engine gone: nothing left to notify
        let _ = self.tx.send(Internal::Device {
            device_id: self.device_id,
            event,
        });
    }
}

/// An opened output device
///
/// Buffers must be rendered in submission order.
pub trait OutputDevice: Send {
    /// Begin rendering; called once before the first submit
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DeviceStart`] if the device cannot start
    fn start(&mut self) -> Result<(), EngineError>;

    /// Queue a slot's PCM bytes behind any previously submitted buffers
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Submit`] if the buffer is rejected
    fn submit(&mut self, slot: SlotId, pcm: &[u8]) -> Result<(), EngineError>;

    /// Suspend rendering; queued buffers are kept
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Control`] if the device cannot pause
    fn pause(&mut self) -> Result<(), EngineError>;

    /// Continue rendering after [`OutputDevice::pause`]
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Control`] if the device cannot resume
    fn resume(&mut self) -> Result<(), EngineError>;

    /// Halt and dispose of the device; pending buffers are discarded
    fn stop(&mut self);
}

/// Factory for output devices
pub trait OutputBackend: Send + Sync {
    /// Open a device for `format` reporting through `events`
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DeviceOpen`] if no suitable device is available
    fn open(
        &self,
        format: AudioFormat,
        events: DeviceEvents,
    ) -> Result<Box<dyn OutputDevice>, EngineError>;
}
