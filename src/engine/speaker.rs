//! Speaker output through the default `cpal` device

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::device::{DeviceEvents, OutputBackend, OutputDevice};
use super::format::{AudioFormat, pcm_s16le_to_f32};
use super::slots::SlotId;
use crate::error::EngineError;

/// Opens the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl OutputBackend for CpalBackend {
    fn open(
        &self,
        format: AudioFormat,
        events: DeviceEvents,
    ) -> Result<Box<dyn OutputDevice>, EngineError> {
        Ok(Box::new(CpalOutput::open(format, events)?))
    }
}

struct PendingBuffer {
    slot: SlotId,
    samples: Vec<f32>,
    pos: usize,
}

/// Buffers awaiting render, consumed by the audio callback
#[derive(Default)]
struct RenderQueue {
    pending: VecDeque<PendingBuffer>,
    current: Option<PendingBuffer>,
}

impl RenderQueue {
    /// Next mono sample, reporting buffer boundaries; silence when empty
    fn next_sample(&mut self, events: &DeviceEvents) -> f32 {
        loop {
            if self.current.is_none() {
                let Some(buffer) = self.pending.pop_front() else {
                    return 0.0;
                };
                events.started(buffer.slot);
                self.current = Some(buffer);
            }

            if let Some(buffer) = self.current.as_mut() {
                if let Some(&sample) = buffer.samples.get(buffer.pos) {
                    buffer.pos += 1;
                    if buffer.pos == buffer.samples.len() {
                        events.finished(buffer.slot);
                        self.current = None;
                    }
                    return sample;
                }
                // Empty buffer: nothing to render
                events.finished(buffer.slot);
                self.current = None;
            }
        }
    }
}

enum Control {
    Play(std_mpsc::Sender<Result<(), String>>),
    Pause(std_mpsc::Sender<Result<(), String>>),
    Shutdown,
}

/// Run a blocking wait without stalling other tasks on the runtime
///
/// Multi-threaded runtimes hand the worker's other tasks off first; on a
/// current-thread runtime (or outside one) the wait runs inline.
fn blocking<T>(wait: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(tokio::runtime::RuntimeFlavor::MultiThread) => tokio::task::block_in_place(wait),
        _ => wait(),
    }
}

/// `cpal` output stream
///
/// `cpal::Stream` is not `Send`, so it lives on a dedicated thread; the
/// render queue is shared with the audio callback.
struct CpalOutput {
    queue: Arc<Mutex<RenderQueue>>,
    control: std_mpsc::Sender<Control>,
    thread: Option<JoinHandle<()>>,
    channels: u16,
}

impl CpalOutput {
    fn open(format: AudioFormat, events: DeviceEvents) -> Result<Self, EngineError> {
        let queue = Arc::new(Mutex::new(RenderQueue::default()));
        let (control, control_rx) = std_mpsc::channel::<Control>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u16, String>>();

        let render_queue = Arc::clone(&queue);
        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let (stream, channels) = match build_stream(format, render_queue, events) {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(channels));

                while let Ok(control) = control_rx.recv() {
                    match control {
                        Control::Play(reply) => {
                            let _ = reply.send(stream.play().map_err(|e| e.to_string()));
                        }
                        Control::Pause(reply) => {
                            let _ = reply.send(stream.pause().map_err(|e| e.to_string()));
                        }
                        Control::Shutdown => break,
                    }
                }

                if let Err(e) = stream.pause() {
                    tracing::debug!(error = %e, "failed to pause output stream");
                }
                drop(stream);
            })
            .map_err(|e| EngineError::DeviceOpen(e.to_string()))?;

        match blocking(|| ready_rx.recv()) {
            Ok(Ok(channels)) => Ok(Self {
                queue,
                control,
                thread: Some(thread),
                channels,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(EngineError::DeviceOpen(e))
            }
            Err(_) => {
                let _ = thread.join();
                Err(EngineError::DeviceOpen("audio thread exited".to_string()))
            }
        }
    }
}

impl CpalOutput {
    /// Send a control message and wait for the audio thread's answer
    fn request(
        &self,
        build: impl FnOnce(std_mpsc::Sender<Result<(), String>>) -> Control,
    ) -> Result<(), String> {
        let (reply, reply_rx) = std_mpsc::channel();
        self.control
            .send(build(reply))
            .map_err(|_| "audio thread exited".to_string())?;

        blocking(|| reply_rx.recv()).map_err(|_| "audio thread exited".to_string())?
    }
}

impl OutputDevice for CpalOutput {
    fn start(&mut self) -> Result<(), EngineError> {
        self.request(Control::Play).map_err(EngineError::DeviceStart)?;

        tracing::debug!(channels = self.channels, "speaker output playing");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EngineError> {
        self.request(Control::Pause).map_err(EngineError::Control)?;
        tracing::debug!("speaker output paused");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        self.request(Control::Play).map_err(EngineError::Control)?;
        tracing::debug!("speaker output resumed");
        Ok(())
    }

    fn submit(&mut self, slot: SlotId, pcm: &[u8]) -> Result<(), EngineError> {
        let samples: Vec<f32> = pcm_s16le_to_f32(pcm).collect();
        let mut queue = self
            .queue
            .lock()
            .map_err(|e| EngineError::Submit(e.to_string()))?;
        queue.pending.push_back(PendingBuffer {
            slot,
            samples,
            pos: 0,
        });
        Ok(())
    }

    fn stop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("audio output thread panicked");
            }
        }
        if let Ok(mut queue) = self.queue.lock() {
            queue.pending.clear();
            queue.current = None;
        }
        tracing::debug!("speaker output stopped");
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

/// Build the output stream on the current thread
fn build_stream(
    format: AudioFormat,
    queue: Arc<Mutex<RenderQueue>>,
    events: DeviceEvents,
) -> Result<(cpal::Stream, u16), String> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device available".to_string())?;

    let rate = SampleRate(format.sample_rate);
    let supported_config = device
        .supported_output_configs()
        .map_err(|e| e.to_string())?
        .find(|c| {
            c.channels() == format.channels
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
        .or_else(|| {
            // Fallback: stereo, mono sample duplicated
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        })
        .ok_or_else(|| "no suitable output config found".to_string())?;

    let config: StreamConfig = supported_config.with_sample_rate(rate).config();
    let channels = config.channels;
    let frame_len = usize::from(channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = format.sample_rate,
        channels,
        "speaker output initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(frame_len) {
                    let sample = queue.next_sample(&events);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| e.to_string())?;

    Ok((stream, channels))
}
