use crate::error::PttError;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Session controller state.
///
/// `Initializing → Ready → Started` happens once during construction; after
/// that the controller only moves between `Started` and `Recording`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready,
    Started,
    Recording,
}

/// Reference to a remote encrypted voice clip
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    /// Locator of the ciphertext, interpreted by the downloader
    pub data: String,
    pub iv: String,
    pub our_version: String,
    pub other_user: String,
    pub their_version: String,
}

/// Completion callback for `send_ptt` / `play_ptt`, called exactly once
pub type Completion = Box<dyn FnOnce(Result<(), PttError>) + Send>;

/// Commands for the session controller
pub enum SessionCommand {
    StartRecording {
        recipient: String,
        reply: oneshot::Sender<SessionState>,
    },
    StopRecording {
        reply: oneshot::Sender<SessionState>,
    },
    SendPtt {
        done: Completion,
    },
    PlayPtt {
        message: MessageRef,
        done: Completion,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}
