use anyhow::Result;
use async_trait::async_trait;

/// Destination for captured samples
///
/// Implementations persist audio in a streaming fashion, writing data as it
/// arrives rather than buffering the whole recording.
#[async_trait]
pub trait AudioSink: Send {
    /// Write interleaved samples (called repeatedly while capturing)
    /// The Vec is moved to avoid copying
    fn write_chunk(&mut self, samples: Vec<f32>) -> Result<()>;

    /// Flush and close the sink
    async fn finalize(&mut self) -> Result<()>;
}
