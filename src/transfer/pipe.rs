use bytes::Bytes;
use std::io::{self, Write};
use tokio::sync::mpsc;

/// Largest chunk a single `write` hands to the reader
const MAX_CHUNK: usize = 8 * 1024;

/// Bounded in-memory pipe from a blocking writer to an async reader.
///
/// `capacity` is the number of in-flight chunks; a full pipe blocks the
/// writer. Dropping the writer is end-of-stream for the reader, dropping the
/// reader makes the next write fail with `BrokenPipe`.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PipeWriter { tx }, PipeReader { rx })
}

/// Blocking end of [`pipe`]. Must not be used from inside an async task.
pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(MAX_CHUNK);
        self.tx
            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
}

impl PipeReader {
    /// Next chunk, or `None` once the writer is gone and the pipe is drained
    pub async fn chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Append everything up to end-of-stream to `buf`; returns bytes read
    pub async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> usize {
        let mut total = 0;
        while let Some(chunk) = self.chunk().await {
            total += chunk.len();
            buf.extend_from_slice(&chunk);
        }
        total
    }
}
