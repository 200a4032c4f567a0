use crate::audio::{AudioFormat, AudioInput, CaptureStream};
use crate::error::DeviceError;
use std::path::Path;

/// Owns the microphone handle and negotiates its sample rate
///
/// This service:
/// - Tries the configured sample rates in order until the device opens
/// - Points the handle at the scratch file, prepares and starts it
/// - Stops and releases the handle, swallowing stop-time failures
///
/// Note: capture handles may hold a cpal::Stream which is !Send, so the
/// recorder lives inside the session controller on a LocalSet.
pub struct Recorder {
    input: Box<dyn AudioInput>,
    channels: u16,
    sample_rates: Vec<u32>,
    handle: Option<Box<dyn CaptureStream>>,
}

impl Recorder {
    pub fn new(input: Box<dyn AudioInput>, channels: u16, sample_rates: &[u32]) -> Self {
        // Rate order matters, duplicates don't
        let mut rates = Vec::with_capacity(sample_rates.len());
        for &rate in sample_rates {
            if !rates.contains(&rate) {
                rates.push(rate);
            }
        }

        Self {
            input,
            channels,
            sample_rates: rates,
            handle: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the input at the first candidate rate it accepts
    fn negotiate(&mut self) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let mut last_error = None;

        for &rate in &self.sample_rates {
            if let Some(mut previous) = self.handle.take() {
                previous.release();
            }

            let format = AudioFormat::new(rate, self.channels);
            match self.input.open(format) {
                Ok(handle) => {
                    tracing::info!("Microphone initialized at {} Hz", rate);
                    return Ok(handle);
                }
                Err(e) => {
                    tracing::debug!("Microphone rejected {} Hz: {}", rate, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(DeviceError::NoDevice("input")))
    }

    /// Start capturing into `output`; returns the negotiated format.
    ///
    /// On failure no handle is left behind.
    pub fn start(&mut self, output: &Path) -> Result<AudioFormat, DeviceError> {
        let mut handle = self.negotiate()?;
        handle.set_output(output);

        if let Err(e) = Self::prepare_and_start(handle.as_mut()) {
            handle.release();
            return Err(e);
        }

        let format = handle.format();
        self.handle = Some(handle);
        Ok(format)
    }

    fn prepare_and_start(handle: &mut dyn CaptureStream) -> Result<(), DeviceError> {
        handle.prepare()?;
        handle.start()
    }

    /// Stop and release the current handle.
    ///
    /// A failing stop is only logged: whatever reached the scratch file is
    /// still usable, and the caller must be able to move on.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        if let Err(e) = handle.stop().await {
            tracing::warn!("Microphone stop failed, keeping captured audio: {}", e);
        }
        handle.release();
    }

    /// Drop the handle without flushing
    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
            tracing::debug!("Microphone released");
        }
    }
}
