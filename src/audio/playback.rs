use super::codec;
use crate::error::DeviceError;
use rodio::OutputStreamBuilder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// A speaker that can play a local audio file.
///
/// `start` prepares the source and starts playback, blocking until the
/// device is actually running. Completion is reported through the returned
/// [`Playback`].
pub trait AudioOutput: Send + Sync {
    fn start(&self, path: &Path) -> Result<Playback, DeviceError>;
}

/// Owned handle to a running playback
pub struct Playback {
    stop: Arc<AtomicBool>,
    done: oneshot::Receiver<Result<(), DeviceError>>,
}

/// The device side of a [`Playback`]
pub struct PlaybackReporter {
    stop: Arc<AtomicBool>,
    done: oneshot::Sender<Result<(), DeviceError>>,
}

impl Playback {
    pub fn channel() -> (Playback, PlaybackReporter) {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        (
            Playback {
                stop: stop.clone(),
                done: rx,
            },
            PlaybackReporter { stop, done: tx },
        )
    }

    /// Split into a stop switch and the completion future
    pub fn into_parts(self) -> (StopSwitch, PlaybackDone) {
        (StopSwitch(self.stop), PlaybackDone(self.done))
    }
}

#[derive(Clone)]
pub struct StopSwitch(Arc<AtomicBool>);

impl StopSwitch {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct PlaybackDone(oneshot::Receiver<Result<(), DeviceError>>);

impl PlaybackDone {
    pub async fn wait(self) -> Result<(), DeviceError> {
        match self.0.await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Backend("playback ended without reporting".into())),
        }
    }
}

impl PlaybackReporter {
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn finish(self, result: Result<(), DeviceError>) {
        let _ = self.done.send(result);
    }
}

enum Source {
    Opus(codec::DecodedClip),
    File(BufReader<File>),
}

impl Source {
    fn open(path: &Path) -> Result<Self, DeviceError> {
        let data = std::fs::read(path)?;
        if codec::is_ogg(&data) {
            let clip = codec::decode_ogg_opus(&data)
                .map_err(|e| DeviceError::Backend(format!("undecodable clip: {}", e)))?;
            return Ok(Self::Opus(clip));
        }
        Ok(Self::File(BufReader::new(File::open(path)?)))
    }
}

/// Default output device through rodio
///
/// Each playback owns its output stream on a dedicated thread, polling for
/// the end of the clip or an early stop.
#[derive(Default)]
pub struct RodioOutput;

impl RodioOutput {
    pub fn new() -> Self {
        Self
    }

    fn play_blocking(
        path: PathBuf,
        source: Source,
        reporter: PlaybackReporter,
        started: std::sync::mpsc::Sender<Result<(), DeviceError>>,
    ) {
        let stream = match OutputStreamBuilder::open_default_stream() {
            Ok(stream) => stream,
            Err(e) => {
                let _ = started.send(Err(DeviceError::Backend(e.to_string())));
                return;
            }
        };

        let sink = match source {
            Source::Opus(clip) => {
                let sink = rodio::Sink::connect_new(stream.mixer());
                sink.append(rodio::buffer::SamplesBuffer::new(
                    clip.channels,
                    clip.sample_rate,
                    clip.samples,
                ));
                sink
            }
            Source::File(reader) => match rodio::play(stream.mixer(), reader) {
                Ok(sink) => sink,
                Err(e) => {
                    let _ = started.send(Err(DeviceError::Backend(e.to_string())));
                    return;
                }
            },
        };

        let _ = started.send(Ok(()));
        tracing::debug!("Playing {}", path.display());

        while !sink.empty() && !reporter.should_stop() {
            std::thread::sleep(Duration::from_millis(50));
        }
        sink.stop();
        drop(stream);

        reporter.finish(Ok(()));
    }
}

impl AudioOutput for RodioOutput {
    fn start(&self, path: &Path) -> Result<Playback, DeviceError> {
        let source = Source::open(path)?;
        let (playback, reporter) = Playback::channel();
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        let path = path.to_path_buf();
        std::thread::Builder::new()
            .name("ptt-playback".into())
            .spawn(move || Self::play_blocking(path, source, reporter, started_tx))?;

        match started_rx.recv() {
            Ok(result) => result.map(|_| playback),
            Err(_) => Err(DeviceError::Backend("playback thread exited early".into())),
        }
    }
}
