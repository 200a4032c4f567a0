use std::io;
use thiserror::Error;

/// Failures of the capture or playback hardware.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {0} audio device available")]
    NoDevice(&'static str),
    #[error("device does not support {rate} Hz with {channels} channel(s)")]
    Unsupported { rate: u32, channels: u16 },
    #[error("no output file configured for capture")]
    NoOutput,
    #[error("capture stream has not been prepared")]
    NotPrepared,
    #[error("audio backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoder used before init")]
    NotInitialized,
    #[error("encoder is already initialized; finalize it first")]
    AlreadyInitialized,
    #[error("encoder session already produced its output")]
    AlreadyTransformed,
    #[error("unsupported opus sample rate: {0} Hz")]
    UnsupportedRate(u32),
    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("no audio samples to encode")]
    EmptyInput,
    #[error("malformed ogg opus stream: {0}")]
    Malformed(String),
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
    #[error("opus error: {0}")]
    Opus(#[from] opus::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error returned by a [`Decryptor`](crate::transfer::Decryptor).
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("decryption failed: {0}")]
    Crypto(String),
}

/// Failure of the download/decrypt stream, with the number of plaintext bytes
/// the consumer had already received.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream interrupted after {delivered} bytes: {source}")]
    Interrupted {
        delivered: usize,
        #[source]
        source: io::Error,
    },
    #[error("decryption failed after {delivered} bytes: {message}")]
    Decrypt { delivered: usize, message: String },
    #[error("stream i/o failed after {delivered} bytes: {source}")]
    Io {
        delivered: usize,
        #[source]
        source: io::Error,
    },
    #[error("stream cancelled after {delivered} bytes")]
    Cancelled { delivered: usize },
    #[error("stream producer panicked")]
    ProducerPanicked,
}

impl StreamError {
    pub fn delivered(&self) -> usize {
        match self {
            Self::Interrupted { delivered, .. }
            | Self::Decrypt { delivered, .. }
            | Self::Io { delivered, .. }
            | Self::Cancelled { delivered } => *delivered,
            Self::ProducerPanicked => 0,
        }
    }

    pub(crate) fn from_decrypt(err: DecryptError, delivered: usize) -> Self {
        match err {
            DecryptError::Io(source) if is_interruption(&source) => {
                Self::Interrupted { delivered, source }
            }
            DecryptError::Io(source) => Self::Io { delivered, source },
            DecryptError::Crypto(message) => Self::Decrypt { delivered, message },
        }
    }
}

fn is_interruption(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}

/// Result delivered to `send_ptt` / `play_ptt` completion callbacks.
#[derive(Debug, Error)]
pub enum PttError {
    #[error("audio device unavailable: {0}")]
    Device(#[from] DeviceError),
    #[error("scratch file i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error("upload failed: {0:#}")]
    Upload(anyhow::Error),
    #[error("no recording available to send")]
    NoRecording,
    #[error("recording still in progress")]
    RecordingInProgress,
    #[error("playback was replaced by a newer clip")]
    Preempted,
    #[error("session controller destroyed")]
    Destroyed,
    #[error("session controller is no longer running")]
    Closed,
    #[error("background task failed: {0}")]
    Task(String),
}
