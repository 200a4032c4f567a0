use super::format::AudioFormat;
use super::sink::AudioSink;
use anyhow::Result;
use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

enum WavCommand {
    WriteChunk(Vec<f32>),
    Finalize { reply: oneshot::Sender<Result<()>> },
}

/// Capture scratch-file writer running on a dedicated blocking thread
///
/// Chunks are queued from the capture bridge and written sequentially, so the
/// audio path never waits on disk I/O. A write failure is remembered and
/// reported by `finalize`.
pub struct WavSink {
    tx: mpsc::UnboundedSender<WavCommand>,
}

impl WavSink {
    pub fn create(path: &Path, format: AudioFormat) -> Result<Self> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: AudioFormat::BITS_PER_SAMPLE,
            sample_format: SampleFormat::Int,
        };

        let mut writer = WavWriter::create(path, spec)
            .map_err(|e| anyhow::anyhow!("Failed to create WAV writer: {}", e))?;

        let (tx, mut rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            let mut write_error: Option<hound::Error> = None;
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    WavCommand::WriteChunk(samples) => {
                        if write_error.is_some() {
                            continue;
                        }
                        for sample in samples {
                            // f32 (-1.0 to 1.0) to i16
                            let amplitude = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                            if let Err(e) = writer.write_sample(amplitude) {
                                tracing::error!("Failed to write capture sample: {}", e);
                                write_error = Some(e);
                                break;
                            }
                        }
                    }
                    WavCommand::Finalize { reply } => {
                        let result = match write_error.take() {
                            Some(e) => Err(anyhow::anyhow!("Capture write failed: {}", e)),
                            None => writer
                                .finalize()
                                .map_err(|e| anyhow::anyhow!("Failed to finalize WAV: {}", e)),
                        };
                        let _ = reply.send(result);
                        return;
                    }
                }
            }
        });

        Ok(Self { tx })
    }
}

#[async_trait]
impl AudioSink for WavSink {
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<()> {
        self.tx
            .send(WavCommand::WriteChunk(samples))
            .map_err(|e| anyhow::anyhow!("Failed to send write command: {}", e))
    }

    async fn finalize(&mut self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WavCommand::Finalize { reply })
            .map_err(|e| anyhow::anyhow!("Failed to send finalize command: {}", e))?;

        rx.await
            .map_err(|e| anyhow::anyhow!("Failed to receive finalize response: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunks_land_in_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");

        let mut sink = WavSink::create(&path, AudioFormat::new(8000, 1)).unwrap();
        sink.write_chunk(vec![0.0; 400]).unwrap();
        sink.write_chunk(vec![0.5, -0.5, 1.5]).unwrap();
        sink.finalize().await.unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        assert_eq!(reader.len(), 403);

        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples[402], i16::MAX);
    }

    #[tokio::test]
    async fn test_finalize_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");

        let mut sink = WavSink::create(&path, AudioFormat::new(8000, 1)).unwrap();
        sink.finalize().await.unwrap();
        assert!(sink.finalize().await.is_err());
    }
}
