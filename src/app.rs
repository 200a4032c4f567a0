use crate::audio::{CpalInput, RodioOutput};
use crate::config::Config;
use crate::messages::MessageRef;
use crate::services::{Collaborators, Devices, SessionController, SessionHandle};
use crate::transfer::fs::{FsDownloader, FsUploader, PassthroughDecryptor};

use anyhow::{Result, bail};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// A line typed on stdin
#[derive(Debug, PartialEq, Eq)]
pub enum HostCommand {
    Record(String),
    Stop,
    Send,
    Play(String),
    State,
    Quit,
}

impl HostCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next(), words.next()) {
            (Some("record"), Some(user)) => Self::Record(user.to_string()),
            (Some("stop"), None) => Self::Stop,
            (Some("send"), None) => Self::Send,
            (Some("play"), Some(file)) => Self::Play(file.to_string()),
            (Some("state"), None) => Self::State,
            (Some("quit"), None) => Self::Quit,
            _ => bail!("unknown command {:?} (record <user>, stop, send, play <file>, state, quit)", line.trim()),
        };

        if words.next().is_some() {
            bail!("too many arguments in {:?}", line.trim());
        }
        Ok(command)
    }
}

pub struct App {
    session: SessionHandle,
    lines_rx: mpsc::Receiver<String>,
}

impl App {
    /// Must be called from within a LocalSet
    pub fn new(config: Config) -> Self {
        let session = Self::setup_session(&config);
        let lines_rx = Self::setup_stdin();

        tracing::info!("Ready! Commands: record <user>, stop, send, play <file>, state, quit");

        Self { session, lines_rx }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                line = self.lines_rx.recv() => {
                    let Some(line) = line else {
                        tracing::info!("stdin closed, shutting down");
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    match HostCommand::parse(&line) {
                        Ok(HostCommand::Quit) => break,
                        Ok(command) => {
                            if let Err(e) = self.handle(command).await {
                                tracing::error!("Error handling command: {}", e);
                            }
                        }
                        Err(e) => tracing::warn!("{}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        self.session.destroy().await;
        tracing::info!("ptt-voice shutdown complete");
        Ok(())
    }

    async fn handle(&self, command: HostCommand) -> Result<()> {
        match command {
            HostCommand::Record(user) => {
                let state = self.session.start_recording(user).await?;
                tracing::info!("State: {:?}", state);
            }
            HostCommand::Stop => {
                let state = self.session.stop_recording().await?;
                tracing::info!("State: {:?}", state);
            }
            HostCommand::Send => {
                self.session
                    .send_ptt(|result| match result {
                        Ok(()) => tracing::info!("Send complete"),
                        Err(e) => tracing::error!("Send failed: {}", e),
                    })
                    .await;
            }
            HostCommand::Play(file) => {
                let message = MessageRef {
                    data: file.clone(),
                    iv: String::new(),
                    our_version: String::new(),
                    other_user: String::new(),
                    their_version: String::new(),
                };
                self.session
                    .play_ptt(message, move |result| match result {
                        Ok(()) => tracing::info!("Finished playing {}", file),
                        Err(e) => tracing::error!("Playback of {} failed: {}", file, e),
                    })
                    .await;
            }
            HostCommand::State => {
                tracing::info!("State: {:?}", self.session.state().await?);
            }
            HostCommand::Quit => {}
        }

        Ok(())
    }

    fn setup_session(config: &Config) -> SessionHandle {
        let devices = Devices {
            input: Box::new(CpalInput::new()),
            output: Arc::new(RodioOutput::new()),
        };
        let collaborators = Collaborators {
            uploader: Arc::new(FsUploader::new(
                config.outbox_dir.clone(),
                config.max_retries,
            )),
            downloader: Arc::new(FsDownloader::new(config.inbox_dir.clone())),
            decryptor: Arc::new(PassthroughDecryptor),
        };

        // Spawned with spawn_local because capture streams are !Send
        SessionController::spawn(config.session(), devices, collaborators)
    }

    fn setup_stdin() -> mpsc::Receiver<String> {
        let (lines_tx, lines_rx) = mpsc::channel(10);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if lines_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        });
        lines_rx
    }
}
