//! Streaming PCM audio engine
//!
//! [`AudioQueueEngine`] owns a pool of buffer slots and an output device.
//! Chunks pushed by the caller and completion events posted by the device
//! are funnelled into one engine task, which is the only code that mutates
//! slot and counter state. The device never touches engine memory; it holds a
//! [`DeviceEvents`] handle tagged with its device id, so events from a
//! disposed device are recognised and ignored.
//!
//! ```text
//!  caller ──Command──▶ ┌──────────────┐ ──submit──▶ OutputDevice
//!                      │ engine task  │
//!  device ──Event────▶ └──────────────┘ ──drained──▶ DrainedSignal
//! ```

mod device;
mod format;
mod queue;
mod slots;
mod speaker;
mod wav;

pub use device::{DeviceEvent, DeviceEvents, OutputBackend, OutputDevice};
pub use format::{AudioFormat, pcm_s16le_samples, pcm_s16le_to_f32};
pub use queue::{AudioQueueEngine, ChunkOutcome, DrainedSignal, EngineSnapshot, EngineState};
pub use slots::{SlotArena, SlotId, SlotState};
pub use speaker::CpalBackend;
pub use wav::WavBackend;
