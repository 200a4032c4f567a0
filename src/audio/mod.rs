pub mod capture;
pub mod codec;
pub mod format;
pub mod playback;
pub mod sink;
pub mod wav_sink;

pub use capture::{AudioInput, CaptureStream, CpalInput};
pub use codec::{EncodedClip, EncoderParams, VoiceEncoder};
pub use format::AudioFormat;
pub use playback::{AudioOutput, Playback, PlaybackReporter, RodioOutput};
pub use sink::AudioSink;
pub use wav_sink::WavSink;
