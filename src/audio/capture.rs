use super::format::AudioFormat;
use super::sink::AudioSink;
use super::wav_sink::WavSink;
use crate::error::DeviceError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use ringbuf::{HeapRb, traits::*};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

/// A microphone that can be opened at a requested format.
///
/// `open` is the "construct and initialize" step of sample-rate negotiation:
/// an `Ok` handle is initialized at exactly the requested format.
pub trait AudioInput {
    fn open(&self, format: AudioFormat) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

/// An initialized microphone handle.
///
/// Lifecycle: `set_output` → `prepare` → `start` → `stop` → `release`.
/// Streams may be `!Send` (cpal), so the trait is used from a `LocalSet`.
#[async_trait(?Send)]
pub trait CaptureStream {
    fn format(&self) -> AudioFormat;

    fn set_output(&mut self, path: &Path);

    fn prepare(&mut self) -> Result<(), DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;

    /// Stop capturing and flush everything recorded so far to the output file
    async fn stop(&mut self) -> Result<(), DeviceError>;

    /// Drop the device; safe to call in any state and more than once
    fn release(&mut self);
}

/// Default input device through cpal
pub struct CpalInput {
    host: cpal::Host,
}

impl CpalInput {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }
}

impl Default for CpalInput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioInput for CpalInput {
    fn open(&self, format: AudioFormat) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let device = self
            .host
            .default_input_device()
            .ok_or(DeviceError::NoDevice("input"))?;

        let supported = device
            .supported_input_configs()
            .map_err(|e| DeviceError::Backend(e.to_string()))?
            .any(|c| {
                c.channels() == format.channels
                    && c.min_sample_rate().0 <= format.sample_rate
                    && c.max_sample_rate().0 >= format.sample_rate
            });

        if !supported {
            return Err(DeviceError::Unsupported {
                rate: format.sample_rate,
                channels: format.channels,
            });
        }

        tracing::debug!(
            "Input device {} initialized at {} Hz",
            device.name().unwrap_or_default(),
            format.sample_rate
        );

        Ok(Box::new(CpalCapture {
            device,
            format,
            output: None,
            stream: None,
            drain: None,
        }))
    }
}

struct Drain {
    finish: oneshot::Sender<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

/// Microphone capture streaming into a WAV scratch file
///
/// The cpal callback pushes samples into a lock-free ring buffer; a bridge
/// task drains the ring into the [`WavSink`] in half-second chunks and flushes
/// the remainder when the capture stops.
pub struct CpalCapture {
    device: cpal::Device,
    format: AudioFormat,
    output: Option<PathBuf>,
    stream: Option<cpal::Stream>,
    drain: Option<Drain>,
}

impl CpalCapture {
    async fn bridge_task(
        mut consumer: impl Consumer<Item = f32>,
        mut sink: WavSink,
        chunk_size: usize,
        notify: Arc<Notify>,
        mut finish: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    while consumer.occupied_len() >= chunk_size {
                        let mut chunk = vec![0.0f32; chunk_size];
                        let n = consumer.pop_slice(&mut chunk);
                        chunk.truncate(n);
                        sink.write_chunk(chunk)?;
                    }
                }
                // Either an explicit stop or the handle being dropped
                _ = &mut finish => break,
            }
        }

        let rest: Vec<f32> = consumer.pop_iter().collect();
        if !rest.is_empty() {
            sink.write_chunk(rest)?;
        }
        sink.finalize().await
    }
}

#[async_trait(?Send)]
impl CaptureStream for CpalCapture {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn set_output(&mut self, path: &Path) {
        self.output = Some(path.to_path_buf());
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        let path = self.output.as_deref().ok_or(DeviceError::NoOutput)?;
        let sink =
            WavSink::create(path, self.format).map_err(|e| DeviceError::Backend(e.to_string()))?;

        let ring = HeapRb::<f32>::new(self.format.samples_for_duration(60.0));
        let (mut producer, consumer) = ring.split();

        let config = StreamConfig {
            channels: self.format.channels,
            sample_rate: SampleRate(self.format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let notify = Arc::new(Notify::new());
        let notify_callback = notify.clone();

        let stream = self
            .device
            .build_input_stream(
                &config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    producer.push_slice(data);
                    notify_callback.notify_one();
                },
                move |err| {
                    tracing::error!("Audio input stream error: {}", err);
                },
                None,
            )
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        let chunk_size = self.format.samples_for_duration(0.5);
        let (finish, finish_rx) = oneshot::channel();
        let task = tokio::spawn(Self::bridge_task(
            consumer, sink, chunk_size, notify, finish_rx,
        ));

        self.stream = Some(stream);
        self.drain = Some(Drain { finish, task });
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream.as_ref().ok_or(DeviceError::NotPrepared)?;
        stream
            .play()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        tracing::info!("Audio capture started at {} Hz", self.format.sample_rate);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream.take().ok_or(DeviceError::NotPrepared)?;
        let paused = stream
            .pause()
            .map_err(|e| DeviceError::Backend(e.to_string()));
        drop(stream);

        let flushed = match self.drain.take() {
            Some(Drain { finish, task }) => {
                let _ = finish.send(());
                match task.await {
                    Ok(result) => result.map_err(|e| DeviceError::Backend(e.to_string())),
                    Err(e) => Err(DeviceError::Backend(e.to_string())),
                }
            }
            None => Ok(()),
        };

        tracing::info!("Audio capture stopped");
        paused.and(flushed)
    }

    fn release(&mut self) {
        self.stream = None;
        // Dropping `finish` lets the bridge flush and exit on its own
        self.drain = None;
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.release();
    }
}
