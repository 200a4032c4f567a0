//! Opus voice encoder writing Ogg Opus clips.
//!
//! The encoder is a one-shot session: `init` → `transform` → `finalize`,
//! and a fresh `init` is needed for every message. Input is the complete
//! capture file held in memory, which is fine for voice-message lengths but
//! not meant for unbounded streams.

use crate::error::CodecError;
use ogg::writing::PacketWriteEndInfo;
use opus::{Application, Bitrate, Channels, Decoder, Encoder};
use rubato::{FftFixedIn, Resampler};
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sample rates libopus accepts
pub const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

const FRAME_MS: u32 = 20;
/// Granule positions in Ogg Opus are always 48 kHz (RFC 7845)
const GRANULE_RATE: u32 = 48000;
/// Encoder lookahead expressed at 48 kHz
const PRE_SKIP: u16 = 312;
const MAX_PACKET_SIZE: usize = 4000;
/// Input frames handed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;
/// 120 ms at 48 kHz, the longest frame a packet can carry
const MAX_FRAME_SAMPLES: usize = 5760;
const VENDOR: &str = concat!("ptt-voice ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct EncoderParams {
    pub input_rate: u32,
    pub channels: u16,
    pub output_rate: u32,
    pub bit_depth: u16,
    pub bitrate: i32,
    pub output: PathBuf,
}

/// Result of a successful `transform`
#[derive(Debug, Clone)]
pub struct EncodedClip {
    pub path: PathBuf,
    pub duration: Duration,
}

struct Session {
    params: EncoderParams,
    encoder: Encoder,
    transformed: bool,
}

/// Opus/Ogg encoding session
#[derive(Default)]
pub struct VoiceEncoder {
    session: Option<Session>,
}

impl VoiceEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self, params: EncoderParams) -> Result<(), CodecError> {
        if self.session.is_some() {
            return Err(CodecError::AlreadyInitialized);
        }
        if !OPUS_RATES.contains(&params.output_rate) {
            return Err(CodecError::UnsupportedRate(params.output_rate));
        }
        if params.input_rate == 0 {
            return Err(CodecError::UnsupportedRate(params.input_rate));
        }
        if !matches!(params.bit_depth, 8 | 16) {
            return Err(CodecError::UnsupportedBitDepth(params.bit_depth));
        }
        if !matches!(params.channels, 1 | 2) {
            return Err(CodecError::UnsupportedChannels(params.channels));
        }

        let mut encoder = Encoder::new(params.output_rate, Channels::Mono, Application::Voip)?;
        encoder.set_bitrate(Bitrate::Bits(params.bitrate))?;

        tracing::debug!(
            "Encoder initialized: {} Hz x{} -> {} Hz opus @ {} bps",
            params.input_rate,
            params.channels,
            params.output_rate,
            params.bitrate
        );

        self.session = Some(Session {
            params,
            encoder,
            transformed: false,
        });
        Ok(())
    }

    /// Encode a complete capture (WAV file contents or headerless PCM) and
    /// write the Ogg Opus result to the configured output path.
    pub fn transform(&mut self, raw: &[u8]) -> Result<EncodedClip, CodecError> {
        let session = self.session.as_mut().ok_or(CodecError::NotInitialized)?;
        if session.transformed {
            return Err(CodecError::AlreadyTransformed);
        }
        session.transformed = true;

        let params = &session.params;
        let pcm = Pcm::parse(raw, params)?;
        let mono = pcm.downmix();
        let samples = resample(&mono, pcm.sample_rate, params.output_rate)?;
        if samples.is_empty() {
            return Err(CodecError::EmptyInput);
        }

        let frame_size = (params.output_rate * FRAME_MS / 1000) as usize;
        let mut packets = Vec::with_capacity(samples.len() / frame_size + 1);
        let mut output = vec![0u8; MAX_PACKET_SIZE];
        for chunk in samples.chunks(frame_size) {
            let len = if chunk.len() < frame_size {
                let mut padded = chunk.to_vec();
                padded.resize(frame_size, 0.0);
                session.encoder.encode_float(&padded, &mut output)?
            } else {
                session.encoder.encode_float(chunk, &mut output)?
            };
            packets.push(output[..len].to_vec());
        }

        let ogg = write_ogg(packets, samples.len() as u64, params.output_rate, pcm.sample_rate)?;
        std::fs::write(&params.output, &ogg)?;

        let duration = Duration::from_secs_f64(samples.len() as f64 / params.output_rate as f64);
        tracing::info!(
            "Encoded {:.2}s of audio into {} bytes",
            duration.as_secs_f64(),
            ogg.len()
        );

        Ok(EncodedClip {
            path: params.output.clone(),
            duration,
        })
    }

    /// Release the codec session. Valid after `init`, whether or not
    /// `transform` succeeded.
    pub fn finalize(&mut self) -> Result<(), CodecError> {
        self.session
            .take()
            .map(|_| ())
            .ok_or(CodecError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }
}

struct Pcm {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl Pcm {
    fn parse(raw: &[u8], params: &EncoderParams) -> Result<Self, CodecError> {
        if raw.starts_with(b"RIFF") {
            return Self::parse_wav(raw, params);
        }

        let samples = match params.bit_depth {
            16 => raw
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect(),
            // 8-bit PCM is unsigned
            8 => raw.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
            other => return Err(CodecError::UnsupportedBitDepth(other)),
        };

        Ok(Self {
            samples,
            sample_rate: params.input_rate,
            channels: params.channels,
        })
    }

    fn parse_wav(raw: &[u8], params: &EncoderParams) -> Result<Self, CodecError> {
        let mut reader = hound::WavReader::new(Cursor::new(raw))?;
        let spec = reader.spec();
        if spec.sample_rate != params.input_rate {
            tracing::debug!(
                "WAV header says {} Hz, expected {} Hz; trusting the header",
                spec.sample_rate,
                params.input_rate
            );
        }

        let samples = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<Result<Vec<_>, _>>()?,
            (hound::SampleFormat::Int, 8) => reader
                .samples::<i8>()
                .map(|s| s.map(|v| v as f32 / 128.0))
                .collect::<Result<Vec<_>, _>>()?,
            (hound::SampleFormat::Float, 32) => {
                reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?
            }
            (_, bits) => return Err(CodecError::UnsupportedBitDepth(bits)),
        };

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    fn downmix(&self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Resample a complete mono buffer with an FFT resampler.
///
/// The output is trimmed to exactly `len * to / from` samples, with the
/// resampler's delay removed from the front.
fn resample(input: &[f32], from: u32, to: u32) -> Result<Vec<f32>, CodecError> {
    if from == to || input.is_empty() {
        return Ok(input.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| CodecError::Resample(e.to_string()))?;

    let expected = (input.len() as u64 * to as u64 / from as u64) as usize;
    let delay = resampler.output_delay();
    let chunk_size = resampler.input_frames_next();
    let mut output = Vec::with_capacity(expected + delay + chunk_size);

    for chunk in input.chunks(chunk_size) {
        let resampled = if chunk.len() == chunk_size {
            resampler.process(&[chunk], None)
        } else {
            resampler.process_partial(Some(&[chunk][..]), None)
        }
        .map_err(|e| CodecError::Resample(e.to_string()))?;
        output.extend_from_slice(&resampled[0]);
    }

    // Flush the delay line
    while output.len() < delay + expected {
        let resampled = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| CodecError::Resample(e.to_string()))?;
        if resampled[0].is_empty() {
            break;
        }
        output.extend_from_slice(&resampled[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

fn write_ogg(
    packets: Vec<Vec<u8>>,
    total_samples: u64,
    output_rate: u32,
    input_rate: u32,
) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();
    let serial = stream_serial();
    let scale = (GRANULE_RATE / output_rate) as u64;
    let frame_granule = (output_rate * FRAME_MS / 1000) as u64 * scale;
    let end_granule = PRE_SKIP as u64 + total_samples * scale;

    {
        let mut writer = ogg::PacketWriter::new(Cursor::new(&mut buffer));
        writer.write_packet(opus_head(input_rate), serial, PacketWriteEndInfo::EndPage, 0)?;
        writer.write_packet(opus_tags(), serial, PacketWriteEndInfo::EndPage, 0)?;

        let count = packets.len();
        for (i, packet) in packets.into_iter().enumerate() {
            let is_last = i + 1 == count;
            let (end_info, granule) = if is_last {
                (PacketWriteEndInfo::EndStream, end_granule)
            } else {
                (
                    PacketWriteEndInfo::NormalPacket,
                    PRE_SKIP as u64 + (i as u64 + 1) * frame_granule,
                )
            };
            writer.write_packet(packet, serial, end_info, granule)?;
        }
    }

    Ok(buffer)
}

fn opus_head(input_rate: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(19);
    header.extend_from_slice(b"OpusHead");
    header.push(1); // version
    header.push(1); // mono
    header.extend_from_slice(&PRE_SKIP.to_le_bytes());
    header.extend_from_slice(&input_rate.to_le_bytes());
    header.extend_from_slice(&0i16.to_le_bytes()); // output gain
    header.push(0); // mapping family
    header
}

fn opus_tags() -> Vec<u8> {
    let mut header = Vec::with_capacity(16 + VENDOR.len());
    header.extend_from_slice(b"OpusTags");
    header.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
    header.extend_from_slice(VENDOR.as_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // no user comments
    header
}

fn stream_serial() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ std::process::id())
        .unwrap_or(0x5054_5456)
}

/// PCM decoded from an Ogg Opus clip, always at 48 kHz
#[derive(Debug, Clone)]
pub struct DecodedClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedClip {
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / self.channels.max(1) as usize;
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }
}

pub fn is_ogg(data: &[u8]) -> bool {
    data.starts_with(b"OggS")
}

/// Decode an Ogg Opus clip, honouring pre-skip and end trimming
pub fn decode_ogg_opus(data: &[u8]) -> Result<DecodedClip, CodecError> {
    let mut reader = ogg::PacketReader::new(Cursor::new(data));

    let head = next_packet(&mut reader)?.ok_or_else(|| CodecError::Malformed("empty stream".into()))?;
    if head.data.len() < 19 || !head.data.starts_with(b"OpusHead") {
        return Err(CodecError::Malformed("missing OpusHead".into()));
    }
    let channels = head.data[9] as u16;
    let pre_skip = u16::from_le_bytes([head.data[10], head.data[11]]) as usize;
    let opus_channels = match channels {
        1 => Channels::Mono,
        2 => Channels::Stereo,
        other => return Err(CodecError::UnsupportedChannels(other)),
    };

    let tags = next_packet(&mut reader)?.ok_or_else(|| CodecError::Malformed("missing OpusTags".into()))?;
    if !tags.data.starts_with(b"OpusTags") {
        return Err(CodecError::Malformed("missing OpusTags".into()));
    }

    let mut decoder = Decoder::new(GRANULE_RATE, opus_channels)?;
    let mut frame = vec![0f32; MAX_FRAME_SAMPLES * channels as usize];
    let mut samples = Vec::new();
    let mut last_granule = 0u64;

    while let Some(packet) = next_packet(&mut reader)? {
        let n = decoder.decode_float(&packet.data, &mut frame, false)?;
        samples.extend_from_slice(&frame[..n * channels as usize]);
        last_granule = packet.absgp_page();
    }

    let per_frame = channels as usize;
    let total = (last_granule as usize).saturating_sub(pre_skip) * per_frame;
    let start = (pre_skip * per_frame).min(samples.len());
    samples.drain(..start);
    if total > 0 && total < samples.len() {
        samples.truncate(total);
    }

    Ok(DecodedClip {
        samples,
        sample_rate: GRANULE_RATE,
        channels,
    })
}

fn next_packet<R: Read + Seek>(
    reader: &mut ogg::PacketReader<R>,
) -> Result<Option<ogg::Packet>, CodecError> {
    reader
        .read_packet()
        .map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Read a file and decode it as Ogg Opus
pub fn decode_file(path: &Path) -> Result<DecodedClip, CodecError> {
    let data = std::fs::read(path)?;
    decode_ogg_opus(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_wav(path: &Path, rate: u32, seconds: f32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let count = (rate as f32 * seconds) as usize;
        for i in 0..count {
            let t = i as f32 / rate as f32;
            let v = (t * 440.0 * std::f32::consts::TAU).sin() * 0.4;
            writer.write_sample((v * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
        std::fs::read(path).unwrap()
    }

    fn params(dir: &Path, input_rate: u32) -> EncoderParams {
        EncoderParams {
            input_rate,
            channels: 1,
            output_rate: 16000,
            bit_depth: 16,
            bitrate: 16000,
            output: dir.join("voice.ogg"),
        }
    }

    #[test]
    fn test_round_trip_preserves_duration() {
        let dir = tempfile::tempdir().unwrap();
        let raw = sine_wav(&dir.path().join("rec.wav"), 44100, 1.3);

        let mut encoder = VoiceEncoder::new();
        encoder.init(params(dir.path(), 44100)).unwrap();
        let clip = encoder.transform(&raw).unwrap();
        encoder.finalize().unwrap();

        assert!((clip.duration.as_secs_f64() - 1.3).abs() < 0.001);

        let decoded = decode_file(&clip.path).unwrap();
        let frame = FRAME_MS as f64 / 1000.0;
        assert!((decoded.duration().as_secs_f64() - 1.3).abs() <= frame);
    }

    #[test]
    fn test_headerless_eight_bit_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = params(dir.path(), 8000);
        p.bit_depth = 8;
        p.output_rate = 8000;

        let raw = vec![128u8; 8000];
        let mut encoder = VoiceEncoder::new();
        encoder.init(p).unwrap();
        let clip = encoder.transform(&raw).unwrap();

        assert!((clip.duration.as_secs_f64() - 1.0).abs() < 0.001);
        assert!(is_ogg(&std::fs::read(&clip.path).unwrap()));
    }

    #[test]
    fn test_sequencing_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = VoiceEncoder::new();

        assert!(matches!(
            encoder.transform(&[0; 64]),
            Err(CodecError::NotInitialized)
        ));
        assert!(matches!(encoder.finalize(), Err(CodecError::NotInitialized)));

        encoder.init(params(dir.path(), 16000)).unwrap();
        assert!(matches!(
            encoder.init(params(dir.path(), 16000)),
            Err(CodecError::AlreadyInitialized)
        ));

        encoder.transform(&[0; 640]).unwrap();
        assert!(matches!(
            encoder.transform(&[0; 640]),
            Err(CodecError::AlreadyTransformed)
        ));

        encoder.finalize().unwrap();
        assert!(!encoder.is_initialized());
        encoder.init(params(dir.path(), 16000)).unwrap();
    }

    #[test]
    fn test_rejects_bad_params_and_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = VoiceEncoder::new();

        let mut p = params(dir.path(), 44100);
        p.output_rate = 44100;
        assert!(matches!(
            encoder.init(p),
            Err(CodecError::UnsupportedRate(44100))
        ));

        let mut p = params(dir.path(), 44100);
        p.bit_depth = 24;
        assert!(matches!(
            encoder.init(p),
            Err(CodecError::UnsupportedBitDepth(24))
        ));

        encoder.init(params(dir.path(), 44100)).unwrap();
        assert!(matches!(encoder.transform(&[]), Err(CodecError::EmptyInput)));
    }

    #[test]
    fn test_resample_and_downmix() {
        let down = resample(&[0.0; 441], 44100, 16000).unwrap();
        assert_eq!(down.len(), 160);

        // A 440 Hz tone keeps its level through 44.1k -> 16k
        let tone: Vec<f32> = (0..44100)
            .map(|i| (i as f32 / 44100.0 * 440.0 * std::f32::consts::TAU).sin() * 0.5)
            .collect();
        let out = resample(&tone, 44100, 16000).unwrap();
        assert_eq!(out.len(), 16000);
        let middle = &out[2000..14000];
        let rms = (middle.iter().map(|s| s * s).sum::<f32>() / middle.len() as f32).sqrt();
        assert!((rms - 0.5 / 2f32.sqrt()).abs() < 0.02, "rms {}", rms);

        let same = resample(&[0.25; 10], 16000, 16000).unwrap();
        assert_eq!(same, vec![0.25; 10]);

        let pcm = Pcm {
            samples: vec![1.0, 0.0, 0.5, 0.5],
            sample_rate: 8000,
            channels: 2,
        };
        assert_eq!(pcm.downmix(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_ogg_opus(b"definitely not ogg").is_err());
    }
}
