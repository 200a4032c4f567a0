use super::player::Player;
use super::recorder::Recorder;
use crate::audio::{AudioFormat, AudioInput, AudioOutput, EncoderParams, VoiceEncoder};
use crate::error::{DeviceError, PttError, StreamError};
use crate::messages::{Completion, MessageRef, SessionCommand, SessionState};
use crate::transfer::{DecryptBridge, Decryptor, Downloader, Uploader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Settings the controller needs from the configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sample_rates: Vec<u32>,
    pub channels: u16,
    pub bit_depth: u16,
    pub output_sample_rate: u32,
    pub bitrate: i32,
    pub pipe_capacity: usize,
    pub scratch_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rates: vec![44100, 8000, 11025, 22050],
            channels: 1,
            bit_depth: 16,
            output_sample_rate: 16000,
            bitrate: 16000,
            pipe_capacity: 16,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

pub struct Devices {
    pub input: Box<dyn AudioInput>,
    pub output: Arc<dyn AudioOutput>,
}

pub struct Collaborators {
    pub uploader: Arc<dyn Uploader>,
    pub downloader: Arc<dyn Downloader>,
    pub decryptor: Arc<dyn Decryptor>,
}

/// A finished capture, owned by exactly one place at a time
struct Capture {
    /// Increases with every recording started
    seq: u64,
    file: TempPath,
    format: AudioFormat,
    recipient: String,
}

enum Event {
    SendFinished {
        generation: u64,
        capture: Option<Capture>,
        result: Result<(), PttError>,
        done: Completion,
    },
    DownloadFinished {
        generation: u64,
        result: Result<TempPath, PttError>,
        done: Completion,
    },
    PlaybackFinished {
        id: u64,
        result: Result<(), DeviceError>,
    },
}

/// Push-to-talk session controller
///
/// Runs as an actor: commands arrive from [`SessionHandle`]s, background work
/// (encode + upload, download + decrypt) runs on tokio tasks and reports back
/// as events, so every callback is invoked from the controller's own task.
///
/// Note: the capture handle may be !Send, so the controller must be spawned
/// on a LocalSet using [`SessionController::spawn`].
pub struct SessionController {
    state: SessionState,
    config: SessionConfig,
    recorder: Recorder,
    player: Player,
    collaborators: Option<Collaborators>,
    recording: Option<Capture>,
    last_capture: Option<Capture>,
    latest_seq: u64,
    generation: u64,
    destroyed: bool,
    cancel: CancellationToken,
    pending: usize,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        devices: Devices,
        collaborators: Collaborators,
    ) -> (Self, SessionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let recorder = Recorder::new(devices.input, config.channels, &config.sample_rates);
        let player = Player::new(devices.output);

        let mut controller = Self {
            state: SessionState::Initializing,
            config,
            recorder,
            player,
            collaborators: Some(collaborators),
            recording: None,
            last_capture: None,
            latest_seq: 0,
            generation: 0,
            destroyed: false,
            cancel: CancellationToken::new(),
            pending: 0,
            cmd_rx,
            event_tx,
            event_rx,
        };
        controller.transition(SessionState::Ready);

        if let Err(e) = std::fs::create_dir_all(&controller.config.scratch_dir) {
            tracing::warn!(
                "Scratch directory {} is unusable: {}",
                controller.config.scratch_dir.display(),
                e
            );
        }
        controller.transition(SessionState::Started);

        (controller, SessionHandle { tx: cmd_tx })
    }

    /// Build the controller and spawn it on the current LocalSet
    pub fn spawn(
        config: SessionConfig,
        devices: Devices,
        collaborators: Collaborators,
    ) -> SessionHandle {
        let (controller, handle) = Self::new(config, devices, collaborators);
        tokio::task::spawn_local(controller.run());
        handle
    }

    pub async fn run(mut self) {
        let mut commands_open = true;

        loop {
            if !commands_open && self.pending == 0 {
                break;
            }

            tokio::select! {
                cmd = self.cmd_rx.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::debug!("All session handles dropped");
                        commands_open = false;
                        self.destroy();
                    }
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event),
            }
        }

        tracing::debug!("Session controller stopped");
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::StartRecording { recipient, reply } => {
                self.start_recording(recipient);
                let _ = reply.send(self.state);
            }
            SessionCommand::StopRecording { reply } => {
                self.stop_recording().await;
                let _ = reply.send(self.state);
            }
            SessionCommand::SendPtt { done } => self.send_ptt(done),
            SessionCommand::PlayPtt { message, done } => self.play_ptt(message, done),
            SessionCommand::State { reply } => {
                let _ = reply.send(self.state);
            }
            SessionCommand::Destroy { reply } => {
                self.destroy();
                let _ = reply.send(());
            }
        }
    }

    fn start_recording(&mut self, recipient: String) {
        if self.destroyed {
            tracing::warn!("Ignoring start_recording on a destroyed session");
            return;
        }
        if self.state == SessionState::Recording {
            tracing::debug!("Already recording, ignoring start");
            return;
        }
        if self.state != SessionState::Started {
            tracing::warn!("Cannot start recording in state {:?}", self.state);
            return;
        }

        let file = match tempfile::Builder::new()
            .prefix("ptt_rec_")
            .suffix(".wav")
            .tempfile_in(&self.config.scratch_dir)
        {
            Ok(file) => file.into_temp_path(),
            Err(e) => {
                tracing::error!("Failed to create capture file: {}", e);
                return;
            }
        };

        match self.recorder.start(&file) {
            Ok(format) => {
                tracing::info!(
                    "Recording to {} at {} Hz for {}",
                    file.display(),
                    format.sample_rate,
                    recipient
                );
                // A new recording supersedes an unsent one
                self.last_capture = None;
                self.latest_seq += 1;
                self.recording = Some(Capture {
                    seq: self.latest_seq,
                    file,
                    format,
                    recipient,
                });
                self.transition(SessionState::Recording);
            }
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
            }
        }
    }

    async fn stop_recording(&mut self) {
        if self.state != SessionState::Recording {
            tracing::debug!("Not recording, ignoring stop");
            return;
        }

        self.recorder.stop().await;
        self.last_capture = self.recording.take();
        self.transition(SessionState::Started);
        tracing::info!("Recording stopped");
    }

    fn send_ptt(&mut self, done: Completion) {
        let Some(collaborators) = &self.collaborators else {
            done(Err(PttError::Destroyed));
            return;
        };
        if self.state == SessionState::Recording {
            done(Err(PttError::RecordingInProgress));
            return;
        }
        let Some(capture) = self.last_capture.take() else {
            done(Err(PttError::NoRecording));
            return;
        };

        let uploader = collaborators.uploader.clone();
        let settings = EncodeSettings::from(&self.config);
        let generation = self.generation;
        let events = self.event_tx.clone();

        self.pending += 1;
        let work = tokio::spawn(deliver(capture, uploader, settings));
        tokio::spawn(async move {
            let (result, capture) = match work.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Send task failed: {}", e);
                    (Err(PttError::Task(e.to_string())), None)
                }
            };
            let _ = events.send(Event::SendFinished {
                generation,
                capture,
                result,
                done,
            });
        });
    }

    fn play_ptt(&mut self, message: MessageRef, done: Completion) {
        let Some(collaborators) = &self.collaborators else {
            done(Err(PttError::Destroyed));
            return;
        };

        let file = match tempfile::Builder::new()
            .prefix("sound")
            .suffix(".ogg")
            .tempfile_in(&self.config.scratch_dir)
        {
            Ok(file) => file.into_temp_path(),
            Err(e) => {
                tracing::warn!("Failed to create playback file: {}", e);
                done(Err(e.into()));
                return;
            }
        };

        let bridge = DecryptBridge::new(
            collaborators.downloader.clone(),
            collaborators.decryptor.clone(),
            self.config.pipe_capacity,
        );
        let cancel = self.cancel.clone();
        let generation = self.generation;
        let events = self.event_tx.clone();

        self.pending += 1;
        let work = tokio::spawn(async move { fetch_clip(&bridge, &message, &cancel, file).await });
        tokio::spawn(async move {
            let result = match work.await {
                Ok(result) => result,
                Err(e) => Err(PttError::Task(e.to_string())),
            };
            let _ = events.send(Event::DownloadFinished {
                generation,
                result,
                done,
            });
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::SendFinished {
                generation,
                capture,
                result,
                done,
            } => {
                self.pending -= 1;
                match &result {
                    Ok(()) => tracing::info!("Voice message sent"),
                    Err(e) => tracing::warn!("Voice message not sent: {}", e),
                }

                let current = !self.destroyed && generation == self.generation;
                if let Some(capture) = capture {
                    // Only the newest recording may come back for a resend
                    if current
                        && capture.seq == self.latest_seq
                        && self.last_capture.is_none()
                        && self.state != SessionState::Recording
                    {
                        tracing::debug!("Keeping capture {} for resend", capture.file.display());
                        self.last_capture = Some(capture);
                    } else {
                        tracing::debug!("Dropping superseded capture {}", capture.seq);
                    }
                }
                done(result);
            }

            Event::DownloadFinished {
                generation,
                result,
                done,
            } => {
                self.pending -= 1;
                let file = match result {
                    Ok(file) => file,
                    Err(e) => {
                        log_fetch_failure(&e);
                        done(Err(e));
                        return;
                    }
                };

                if self.destroyed || generation != self.generation {
                    tracing::debug!("Discarding clip fetched before destroy");
                    done(Err(PttError::Destroyed));
                    return;
                }

                let path = match file.keep() {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::warn!("Failed to hand clip to the player: {}", e);
                        done(Err(e.error.into()));
                        return;
                    }
                };

                if let Some((id, finished)) = self.player.start(path, true, done) {
                    let events = self.event_tx.clone();
                    self.pending += 1;
                    tokio::spawn(async move {
                        let result = finished.wait().await;
                        let _ = events.send(Event::PlaybackFinished { id, result });
                    });
                }
            }

            Event::PlaybackFinished { id, result } => {
                self.pending -= 1;
                self.player.finish(id, result);
            }
        }
    }

    fn destroy(&mut self) {
        if self.destroyed {
            tracing::debug!("Session already destroyed");
            return;
        }

        tracing::debug!(
            "Destroying session (capture active: {}, playback active: {}, pending: {})",
            self.recorder.is_active(),
            self.player.is_playing(),
            self.pending
        );
        self.destroyed = true;
        self.generation += 1;
        self.cancel.cancel();

        self.recorder.release();
        self.recording = None;
        self.last_capture = None;
        self.player.release();
        self.collaborators = None;

        if self.state == SessionState::Recording {
            self.transition(SessionState::Started);
        }
        tracing::info!("Session destroyed");
    }
}

fn log_fetch_failure(err: &PttError) {
    match err {
        PttError::Stream(StreamError::Interrupted { .. }) => {
            tracing::warn!("Voice clip download interrupted: {}", err)
        }
        PttError::Stream(StreamError::Decrypt { .. }) => {
            tracing::warn!("Voice clip could not be decrypted: {}", err)
        }
        PttError::Stream(e @ StreamError::Cancelled { .. }) => {
            tracing::debug!("Voice clip fetch cancelled after {} bytes", e.delivered())
        }
        _ => tracing::warn!("Failed to fetch voice clip: {}", err),
    }
}

#[derive(Debug, Clone)]
struct EncodeSettings {
    bit_depth: u16,
    output_rate: u32,
    bitrate: i32,
    scratch_dir: PathBuf,
}

impl From<&SessionConfig> for EncodeSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            bit_depth: config.bit_depth,
            output_rate: config.output_sample_rate,
            bitrate: config.bitrate,
            scratch_dir: config.scratch_dir.clone(),
        }
    }
}

/// Encode then upload; hands the capture back if the upload failed
async fn deliver(
    capture: Capture,
    uploader: Arc<dyn Uploader>,
    settings: EncodeSettings,
) -> (Result<(), PttError>, Option<Capture>) {
    let encoded = match encode_capture(&capture, settings).await {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::error!("Failed to encode {}: {}", capture.file.display(), e);
            return (Err(e), None);
        }
    };

    let result = uploader
        .upload(&encoded, &capture.recipient)
        .await
        .map_err(PttError::Upload);

    // Encoded clip is dropped (deleted) here, whatever the upload outcome
    drop(encoded);

    match result {
        Ok(()) => (Ok(()), None),
        Err(e) => (Err(e), Some(capture)),
    }
}

async fn encode_capture(capture: &Capture, settings: EncodeSettings) -> Result<TempPath, PttError> {
    let source = capture.file.to_path_buf();
    let format = capture.format;

    tokio::task::spawn_blocking(move || -> Result<TempPath, PttError> {
        let raw = std::fs::read(&source)?;

        let output = tempfile::Builder::new()
            .prefix("voice")
            .suffix(".ogg")
            .tempfile_in(&settings.scratch_dir)?
            .into_temp_path();

        let started = Instant::now();
        let mut encoder = VoiceEncoder::new();
        encoder.init(EncoderParams {
            input_rate: format.sample_rate,
            channels: format.channels,
            output_rate: settings.output_rate,
            bit_depth: settings.bit_depth,
            bitrate: settings.bitrate,
            output: output.to_path_buf(),
        })?;
        let clip = encoder.transform(&raw);
        if let Err(e) = encoder.finalize() {
            tracing::warn!("Failed to release encoder: {}", e);
        }
        let clip = clip?;

        tracing::debug!(
            "Encoded {} ({:.1}s) in {} ms",
            source.display(),
            clip.duration.as_secs_f64(),
            started.elapsed().as_millis()
        );
        Ok(output)
    })
    .await
    .map_err(|e| PttError::Task(e.to_string()))?
}

async fn fetch_clip(
    bridge: &DecryptBridge,
    message: &MessageRef,
    cancel: &CancellationToken,
    file: TempPath,
) -> Result<TempPath, PttError> {
    let plaintext = bridge.run_cancellable(message, cancel).await?;
    tokio::fs::write(&file, &plaintext).await?;
    Ok(file)
}

/// Cloneable handle to a running [`SessionController`]
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn request<F>(&self, make: F) -> Result<SessionState, PttError>
    where
        F: FnOnce(oneshot::Sender<SessionState>) -> SessionCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| PttError::Closed)?;
        rx.await.map_err(|_| PttError::Closed)
    }

    /// Start capturing a message for `recipient`; returns the resulting state
    pub async fn start_recording(
        &self,
        recipient: impl Into<String>,
    ) -> Result<SessionState, PttError> {
        let recipient = recipient.into();
        self.request(|reply| SessionCommand::StartRecording { recipient, reply })
            .await
    }

    pub async fn stop_recording(&self) -> Result<SessionState, PttError> {
        self.request(|reply| SessionCommand::StopRecording { reply })
            .await
    }

    pub async fn state(&self) -> Result<SessionState, PttError> {
        self.request(|reply| SessionCommand::State { reply }).await
    }

    /// Encode and upload the last recording; `done` gets the upload result
    pub async fn send_ptt<F>(&self, done: F)
    where
        F: FnOnce(Result<(), PttError>) + Send + 'static,
    {
        let cmd = SessionCommand::SendPtt {
            done: Box::new(done),
        };
        if let Err(mpsc::error::SendError(SessionCommand::SendPtt { done })) =
            self.tx.send(cmd).await
        {
            done(Err(PttError::Closed));
        }
    }

    /// Fetch, decrypt and play `message`; `done` fires when playback ends
    pub async fn play_ptt<F>(&self, message: MessageRef, done: F)
    where
        F: FnOnce(Result<(), PttError>) + Send + 'static,
    {
        let cmd = SessionCommand::PlayPtt {
            message,
            done: Box::new(done),
        };
        if let Err(mpsc::error::SendError(SessionCommand::PlayPtt { done, .. })) =
            self.tx.send(cmd).await
        {
            done(Err(PttError::Closed));
        }
    }

    /// [`send_ptt`](Self::send_ptt), awaiting the result
    pub async fn send_ptt_and_wait(&self) -> Result<(), PttError> {
        let (tx, rx) = oneshot::channel();
        self.send_ptt(move |result| {
            let _ = tx.send(result);
        })
        .await;
        rx.await.map_err(|_| PttError::Closed)?
    }

    /// [`play_ptt`](Self::play_ptt), awaiting the end of playback
    pub async fn play_ptt_and_wait(&self, message: MessageRef) -> Result<(), PttError> {
        let (tx, rx) = oneshot::channel();
        self.play_ptt(message, move |result| {
            let _ = tx.send(result);
        })
        .await;
        rx.await.map_err(|_| PttError::Closed)?
    }

    /// Release devices and collaborators. Idempotent.
    pub async fn destroy(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionCommand::Destroy { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
