//! Headless output writing PCM to a WAV file

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use super::device::{DeviceEvents, OutputBackend, OutputDevice};
use super::format::{AudioFormat, pcm_s16le_samples};
use super::slots::SlotId;
use crate::error::EngineError;

/// Writes each session to a WAV file instead of a speaker
///
/// Buffers complete as soon as they are written, so a step drains at network
/// speed rather than in real time.
#[derive(Debug, Clone)]
pub struct WavBackend {
    path: PathBuf,
}

impl WavBackend {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl OutputBackend for WavBackend {
    fn open(
        &self,
        format: AudioFormat,
        events: DeviceEvents,
    ) -> Result<Box<dyn OutputDevice>, EngineError> {
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        };

        let writer = hound::WavWriter::create(&self.path, spec)
            .map_err(|e| EngineError::DeviceOpen(e.to_string()))?;

        tracing::debug!(path = %self.path.display(), "wav output opened");
        Ok(Box::new(WavOutput {
            writer: Some(writer),
            events,
        }))
    }
}

struct WavOutput {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    events: DeviceEvents,
}

impl OutputDevice for WavOutput {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.writer.is_none() {
            return Err(EngineError::DeviceStart("wav writer closed".to_string()));
        }
        Ok(())
    }

    fn submit(&mut self, slot: SlotId, pcm: &[u8]) -> Result<(), EngineError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| EngineError::Submit("wav writer closed".to_string()))?;

        self.events.started(slot);
        for sample in pcm_s16le_samples(pcm) {
            writer
                .write_sample(sample)
                .map_err(|e| EngineError::Submit(e.to_string()))?;
        }
        self.events.finished(slot);
        Ok(())
    }

    // Buffers are written on submit, so there is nothing to suspend
    fn pause(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                tracing::warn!(error = %e, "failed to finalize wav output");
            }
        }
    }
}

impl Drop for WavOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
