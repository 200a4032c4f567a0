//! Filesystem-backed collaborators for the host binary.

use super::retry::{Method, RetryPolicy, TransferFailure};
use super::{DecryptParams, Decryptor, Downloader, Uploader};
use crate::error::DecryptError;
use crate::messages::MessageRef;
use anyhow::Context;
use async_trait::async_trait;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// "Uploads" clips by copying them into `outbox/<recipient>/`
pub struct FsUploader {
    outbox: PathBuf,
    policy: RetryPolicy,
}

impl FsUploader {
    pub fn new(outbox: PathBuf, max_retries: u32) -> Self {
        Self {
            outbox,
            policy: RetryPolicy::new(max_retries),
        }
    }
}

#[async_trait]
impl Uploader for FsUploader {
    async fn upload(&self, encoded: &Path, recipient: &str) -> anyhow::Result<()> {
        if recipient.is_empty() || recipient.contains(['/', '\\']) || recipient == ".." {
            anyhow::bail!("invalid recipient name: {:?}", recipient);
        }

        let dir = self.outbox.join(recipient);
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let target = dir.join(format!("ptt-{}.ogg", stamp));

        self.policy
            .run(Method::Put, |_| {
                let dir = dir.clone();
                let target = target.clone();
                async move {
                    tokio::fs::create_dir_all(&dir)
                        .await
                        .map_err(TransferFailure::before_send)?;
                    tokio::fs::copy(encoded, &target)
                        .await
                        .map_err(TransferFailure::before_send)
                }
            })
            .await
            .with_context(|| format!("Failed to deliver clip to {:?}", target))?;

        tracing::info!("Delivered voice clip to {}", target.display());
        Ok(())
    }
}

/// Opens message data as files, relative locators resolved under `root`
pub struct FsDownloader {
    root: PathBuf,
}

impl FsDownloader {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Downloader for FsDownloader {
    fn open_read_stream(&self, message: &MessageRef) -> io::Result<Box<dyn Read + Send>> {
        let path = self.root.join(&message.data);
        let file = std::fs::File::open(&path)?;
        Ok(Box::new(io::BufReader::new(file)))
    }
}

/// Copies input to output unchanged, for clips stored in the clear
pub struct PassthroughDecryptor;

impl Decryptor for PassthroughDecryptor {
    fn decrypt(
        &self,
        _params: &DecryptParams,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<u64, DecryptError> {
        Ok(io::copy(input, output)?)
    }
}
