//! In-memory devices and collaborators shared by the unit tests.

use crate::audio::codec;
use crate::audio::{AudioFormat, AudioInput, AudioOutput, CaptureStream, Playback, PlaybackReporter};
use crate::error::{DecryptError, DeviceError, PttError};
use crate::messages::{Completion, MessageRef};
use crate::transfer::{DecryptParams, Decryptor, Downloader, Uploader};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

pub fn message_ref(data: &str) -> MessageRef {
    MessageRef {
        data: data.to_string(),
        iv: "aXY=".to_string(),
        our_version: "1".to_string(),
        other_user: "bob".to_string(),
        their_version: "2".to_string(),
    }
}

pub fn completion() -> (Completion, oneshot::Receiver<Result<(), PttError>>) {
    let (tx, rx) = oneshot::channel();
    let done: Completion = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (done, rx)
}

// ---- capture ----

#[derive(Default)]
struct MonitorState {
    attempts: Mutex<Vec<u32>>,
    failed: AtomicUsize,
    opens: AtomicUsize,
    live: AtomicUsize,
    capture_millis: AtomicUsize,
}

/// Observes what a [`FakeInput`] was asked to do
#[derive(Clone)]
pub struct InputMonitor(Arc<MonitorState>);

impl InputMonitor {
    pub fn attempts(&self) -> Vec<u32> {
        self.0.attempts.lock().unwrap().clone()
    }

    pub fn failed_opens(&self) -> usize {
        self.0.failed.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.0.opens.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet released
    pub fn live(&self) -> usize {
        self.0.live.load(Ordering::SeqCst)
    }

    /// Length of audio the next stopped capture writes
    pub fn set_capture_seconds(&self, seconds: f64) {
        self.0
            .capture_millis
            .store((seconds * 1000.0).round() as usize, Ordering::SeqCst);
    }
}

/// Microphone that accepts a fixed set of rates and records a tone
pub struct FakeInput {
    rates: Vec<u32>,
    fail_prepare: bool,
    fail_stop: bool,
    monitor: InputMonitor,
}

impl FakeInput {
    pub fn accepting(rates: &[u32]) -> Self {
        let monitor = InputMonitor(Arc::new(MonitorState::default()));
        monitor.set_capture_seconds(0.5);
        Self {
            rates: rates.to_vec(),
            fail_prepare: false,
            fail_stop: false,
            monitor,
        }
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn monitor(&self) -> InputMonitor {
        self.monitor.clone()
    }
}

impl AudioInput for FakeInput {
    fn open(&self, format: AudioFormat) -> Result<Box<dyn CaptureStream>, DeviceError> {
        self.monitor.0.attempts.lock().unwrap().push(format.sample_rate);

        if !self.rates.contains(&format.sample_rate) {
            self.monitor.0.failed.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::Unsupported {
                rate: format.sample_rate,
                channels: format.channels,
            });
        }

        self.monitor.0.opens.fetch_add(1, Ordering::SeqCst);
        self.monitor.0.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            format,
            output: None,
            prepared: false,
            released: false,
            fail_prepare: self.fail_prepare,
            fail_stop: self.fail_stop,
            monitor: self.monitor.clone(),
        }))
    }
}

struct FakeCapture {
    format: AudioFormat,
    output: Option<PathBuf>,
    prepared: bool,
    released: bool,
    fail_prepare: bool,
    fail_stop: bool,
    monitor: InputMonitor,
}

impl FakeCapture {
    fn write_tone(&self, path: &Path) -> Result<(), DeviceError> {
        let spec = hound::WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: AudioFormat::BITS_PER_SAMPLE,
            sample_format: hound::SampleFormat::Int,
        };
        let millis = self.monitor.0.capture_millis.load(Ordering::SeqCst);
        let frames = self.format.sample_rate as usize * millis / 1000;

        let to_device = |e: hound::Error| DeviceError::Backend(e.to_string());
        let mut writer = hound::WavWriter::create(path, spec).map_err(to_device)?;
        for i in 0..frames {
            let t = i as f32 / self.format.sample_rate as f32;
            let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
            for _ in 0..self.format.channels {
                writer.write_sample(sample).map_err(to_device)?;
            }
        }
        writer.finalize().map_err(to_device)
    }
}

#[async_trait(?Send)]
impl CaptureStream for FakeCapture {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn set_output(&mut self, path: &Path) {
        self.output = Some(path.to_path_buf());
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        if self.fail_prepare {
            return Err(DeviceError::Backend("prepare failed".into()));
        }
        if self.output.is_none() {
            return Err(DeviceError::NoOutput);
        }
        self.prepared = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if !self.prepared {
            return Err(DeviceError::NotPrepared);
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        let path = self.output.clone().ok_or(DeviceError::NoOutput)?;
        self.write_tone(&path)?;
        if self.fail_stop {
            return Err(DeviceError::Backend("stop failed".into()));
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.monitor.0.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.release();
    }
}

// ---- playback ----

#[derive(Default)]
struct OutputState {
    paths: Vec<PathBuf>,
    reporters: Vec<Option<PlaybackReporter>>,
    stopped: Vec<bool>,
}

/// Speaker that never makes a sound; tests decide when clips end
#[derive(Clone, Default)]
pub struct FakeOutput {
    state: Arc<Mutex<OutputState>>,
    fail: bool,
}

impl FakeOutput {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().paths.len()
    }

    /// Whether playback `index` was asked to stop early
    pub fn stop_requested(&self, index: usize) -> bool {
        let state = self.state.lock().unwrap();
        match &state.reporters[index] {
            Some(reporter) => reporter.should_stop(),
            None => state.stopped[index],
        }
    }

    /// Report every running clip as played to the end
    pub fn finish_all(&self) {
        let mut state = self.state.lock().unwrap();
        for i in 0..state.reporters.len() {
            if let Some(reporter) = state.reporters[i].take() {
                state.stopped[i] = reporter.should_stop();
                reporter.finish(Ok(()));
            }
        }
    }

    /// Path of the first clip started, waiting for it if needed
    pub async fn wait_for_start(&self) -> PathBuf {
        for _ in 0..400 {
            if let Some(path) = self.state.lock().unwrap().paths.first() {
                return path.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("playback never started");
    }
}

impl AudioOutput for FakeOutput {
    fn start(&self, path: &Path) -> Result<Playback, DeviceError> {
        if self.fail {
            return Err(DeviceError::NoDevice("output"));
        }
        if !path.exists() {
            return Err(io::Error::from(io::ErrorKind::NotFound).into());
        }

        let (playback, reporter) = Playback::channel();
        let mut state = self.state.lock().unwrap();
        state.paths.push(path.to_path_buf());
        state.reporters.push(Some(reporter));
        state.stopped.push(false);
        Ok(playback)
    }
}

// ---- transfer ----

/// Ciphertext store keyed by `MessageRef::data`
#[derive(Clone, Default)]
pub struct MemoryDownloader {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryDownloader {
    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.blobs.lock().unwrap().insert(key.to_string(), data);
    }
}

impl Downloader for MemoryDownloader {
    fn open_read_stream(&self, message: &MessageRef) -> io::Result<Box<dyn Read + Send>> {
        match self.blobs.lock().unwrap().get(&message.data) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no blob named {}", message.data),
            )),
        }
    }
}

/// Blocks in `open_read_stream` until its gate is opened
pub struct GatedDownloader {
    data: Vec<u8>,
    gate: Gate,
}

#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        let (open, cvar) = &*self.0;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (open, cvar) = &*self.0;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = cvar.wait(guard).unwrap();
        }
    }
}

impl GatedDownloader {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            gate: Gate::default(),
        }
    }

    pub fn gate(&self) -> Gate {
        self.gate.clone()
    }
}

impl Downloader for GatedDownloader {
    fn open_read_stream(&self, _message: &MessageRef) -> io::Result<Box<dyn Read + Send>> {
        self.gate.wait();
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}

/// Toy stream cipher: XOR with a constant key byte
pub struct XorDecryptor;

impl XorDecryptor {
    const KEY: u8 = 0x5A;

    pub fn apply(data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ Self::KEY).collect()
    }
}

impl Decryptor for XorDecryptor {
    fn decrypt(
        &self,
        _params: &DecryptParams,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<u64, DecryptError> {
        let mut buf = [0u8; 4096];
        let mut total = 0u64;
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            for b in &mut buf[..n] {
                *b ^= Self::KEY;
            }
            output.write_all(&buf[..n])?;
            total += n as u64;
        }
    }
}

/// Emits `n` bytes of plaintext, then rejects the rest of the stream
pub struct FailMidStream(pub usize);

impl Decryptor for FailMidStream {
    fn decrypt(
        &self,
        _params: &DecryptParams,
        _input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<u64, DecryptError> {
        output.write_all(&vec![0x11; self.0])?;
        Err(DecryptError::Crypto("bad mac".into()))
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub recipient: String,
    pub duration: Duration,
}

/// Decodes every uploaded clip and remembers what it heard
#[derive(Clone, Default)]
pub struct RecordingUploader {
    uploads: Arc<Mutex<Vec<Upload>>>,
    calls: Arc<AtomicUsize>,
    fail_next: Arc<AtomicBool>,
    held: Arc<Mutex<Option<(String, Arc<Notify>)>>>,
}

impl RecordingUploader {
    /// Successful uploads, in completion order
    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    /// Every call, successful or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Uploads to `recipient` wait for the returned notify, then fail
    pub fn fail_late_for(&self, recipient: &str) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.held.lock().unwrap() = Some((recipient.to_string(), release.clone()));
        release
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, encoded: &Path, recipient: &str) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let held = self.held.lock().unwrap().clone();
        if let Some((who, release)) = held {
            if who == recipient {
                release.notified().await;
                anyhow::bail!("connection dropped while sending to {}", recipient);
            }
        }

        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("server said no");
        }

        let clip = codec::decode_file(encoded)?;
        self.uploads.lock().unwrap().push(Upload {
            recipient: recipient.to_string(),
            duration: clip.duration(),
        });
        Ok(())
    }
}
