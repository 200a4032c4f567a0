//! Push-to-talk voice messages: record, encode and upload clips, and
//! download, decrypt and play received ones.

pub mod app;
pub mod audio;
pub mod config;
pub mod error;
pub mod messages;
pub mod services;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use error::{CodecError, DecryptError, DeviceError, PttError, StreamError};
pub use messages::{MessageRef, SessionState};
pub use services::{Collaborators, Devices, SessionConfig, SessionController, SessionHandle};
