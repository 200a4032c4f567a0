use super::pipe::pipe;
use super::{DecryptParams, Decryptor, Downloader};
use crate::error::{DecryptError, StreamError};
use crate::messages::MessageRef;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Download → decrypt → plaintext, without holding the whole ciphertext
///
/// The producer (open the remote stream, decrypt into a bounded pipe) runs on
/// the blocking pool while the caller's task drains the pipe. The pipe writer
/// is dropped whenever the producer returns, so the consumer always reaches
/// end-of-stream, and a producer failure is reported with the number of bytes
/// already delivered.
#[derive(Clone)]
pub struct DecryptBridge {
    downloader: Arc<dyn Downloader>,
    decryptor: Arc<dyn Decryptor>,
    capacity: usize,
}

impl DecryptBridge {
    pub fn new(
        downloader: Arc<dyn Downloader>,
        decryptor: Arc<dyn Decryptor>,
        capacity: usize,
    ) -> Self {
        Self {
            downloader,
            decryptor,
            capacity,
        }
    }

    pub async fn run(&self, message: &MessageRef) -> Result<Vec<u8>, StreamError> {
        self.run_cancellable(message, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but stops consuming once `cancel` fires. The
    /// producer then fails its next write with `BrokenPipe` and exits.
    pub async fn run_cancellable(
        &self,
        message: &MessageRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, StreamError> {
        let (mut writer, mut reader) = pipe(self.capacity);
        let downloader = self.downloader.clone();
        let decryptor = self.decryptor.clone();
        let params = DecryptParams::from(message);
        let message = message.clone();

        let producer = tokio::task::spawn_blocking(move || -> Result<u64, DecryptError> {
            let mut source = downloader.open_read_stream(&message)?;
            decryptor.decrypt(&params, &mut source, &mut writer)
        });

        let mut plaintext = Vec::new();
        let cancelled = tokio::select! {
            _ = reader.read_to_end(&mut plaintext) => false,
            _ = cancel.cancelled() => true,
        };
        drop(reader);

        if cancelled {
            tracing::debug!("Decrypt stream cancelled after {} bytes", plaintext.len());
            return Err(StreamError::Cancelled {
                delivered: plaintext.len(),
            });
        }

        match producer.await {
            Ok(Ok(written)) => {
                tracing::debug!(
                    "Decrypted {} bytes ({} reported by decryptor)",
                    plaintext.len(),
                    written
                );
                Ok(plaintext)
            }
            Ok(Err(e)) => Err(StreamError::from_decrypt(e, plaintext.len())),
            Err(e) => {
                tracing::error!("Decrypt producer failed: {}", e);
                Err(StreamError::ProducerPanicked)
            }
        }
    }
}
