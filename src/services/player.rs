use crate::audio::AudioOutput;
use crate::audio::playback::{PlaybackDone, StopSwitch};
use crate::error::{DeviceError, PttError};
use crate::messages::Completion;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct ActivePlayback {
    id: u64,
    path: PathBuf,
    delete_on_complete: bool,
    stop: StopSwitch,
    done: Completion,
}

impl ActivePlayback {
    fn close(self, result: Result<(), PttError>) {
        self.stop.stop();
        if self.delete_on_complete {
            remove_scratch(&self.path);
        }
        (self.done)(result);
    }
}

/// Plays one clip at a time
///
/// Starting a clip while another is playing stops the old one first; its
/// completion receives [`PttError::Preempted`].
pub struct Player {
    output: Arc<dyn AudioOutput>,
    active: Option<ActivePlayback>,
    next_id: u64,
}

impl Player {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            active: None,
            next_id: 0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    /// Start playing `path`. Returns the playback id and its completion to be
    /// reported back through [`finish`](Self::finish), or `None` if the
    /// device could not start (in which case `done` has already been called).
    pub fn start(
        &mut self,
        path: PathBuf,
        delete_on_complete: bool,
        done: Completion,
    ) -> Option<(u64, PlaybackDone)> {
        if let Some(previous) = self.active.take() {
            tracing::debug!("Stopping playback {} for a newer clip", previous.id);
            previous.close(Err(PttError::Preempted));
        }

        let playback = match self.output.start(&path) {
            Ok(playback) => playback,
            Err(e) => {
                tracing::error!("Failed to start playback of {}: {}", path.display(), e);
                if delete_on_complete {
                    remove_scratch(&path);
                }
                done(Err(e.into()));
                return None;
            }
        };

        self.next_id += 1;
        let id = self.next_id;
        let (stop, finished) = playback.into_parts();
        self.active = Some(ActivePlayback {
            id,
            path,
            delete_on_complete,
            stop,
            done,
        });

        tracing::info!("Playback {} started", id);
        Some((id, finished))
    }

    /// Completion of playback `id`. Stale ids are ignored.
    pub fn finish(&mut self, id: u64, result: Result<(), DeviceError>) {
        let is_current = self.active.as_ref().is_some_and(|a| a.id == id);
        if !is_current {
            tracing::debug!("Ignoring completion of stale playback {}", id);
            return;
        }

        if let Some(active) = self.active.take() {
            match &result {
                Ok(()) => tracing::info!("Playback {} finished", id),
                Err(e) => tracing::warn!("Playback {} failed: {}", id, e),
            }
            active.close(result.map_err(PttError::from));
        }
    }

    /// Stop any playback and release the device
    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!("Releasing playback {}", active.id);
            active.close(Err(PttError::Destroyed));
        }
    }
}

fn remove_scratch(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("Failed to remove scratch file {}: {}", path.display(), e);
    }
}
