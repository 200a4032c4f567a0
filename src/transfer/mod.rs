//! Collaborators at the transfer boundary and the plumbing around them.
//!
//! The upload/download transport and the cryptographic scheme live outside
//! this crate; only their call shapes are fixed here.

pub mod bridge;
pub mod fs;
pub mod pipe;
pub mod retry;

pub use bridge::DecryptBridge;
pub use pipe::{PipeReader, PipeWriter, pipe};
pub use retry::{Method, RetryClass, RetryPolicy, TransferFailure};

use crate::error::DecryptError;
use crate::messages::MessageRef;
use async_trait::async_trait;
use std::io::{self, Read, Write};
use std::path::Path;

/// Sends an encoded clip to a user. Retry policy is the implementor's call.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, encoded: &Path, recipient: &str) -> anyhow::Result<()>;
}

/// Opens the remote ciphertext of a message.
///
/// Called from a blocking thread; implementations may block.
pub trait Downloader: Send + Sync {
    fn open_read_stream(&self, message: &MessageRef) -> io::Result<Box<dyn Read + Send>>;
}

/// Streaming decryption from `input` to `output`.
///
/// Called from a blocking thread. Returns the number of plaintext bytes
/// written.
pub trait Decryptor: Send + Sync {
    fn decrypt(
        &self,
        params: &DecryptParams,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<u64, DecryptError>;
}

/// Key material selectors for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptParams {
    pub our_version: String,
    pub their_user: String,
    pub their_version: String,
    pub iv: String,
}

impl From<&MessageRef> for DecryptParams {
    fn from(message: &MessageRef) -> Self {
        Self {
            our_version: message.our_version.clone(),
            their_user: message.other_user.clone(),
            their_version: message.their_version.clone(),
            iv: message.iv.clone(),
        }
    }
}
