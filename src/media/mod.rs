mod devices;
mod track;

pub use devices::GstMediaDevices;
pub use track::{LocalTrack, MediaKind, TrackSource};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{MeetError, Result};
use crate::mesh::MeshEventSender;

/// Access to local capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Each opener takes the session's event sender; `LocalSourceEnded` arrives
    /// there when the source goes away on its own.
    async fn open_microphone(&self, events: MeshEventSender) -> Result<Arc<LocalTrack>>;

    async fn open_camera(&self, events: MeshEventSender) -> Result<Arc<LocalTrack>>;

    async fn open_display(&self, events: MeshEventSender) -> Result<Arc<LocalTrack>>;
}

/// The local client's outgoing media
#[derive(Debug, Default)]
pub struct LocalStream {
    audio: Option<Arc<LocalTrack>>,
    video: Option<Arc<LocalTrack>>,
    screen: Option<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(audio: Option<Arc<LocalTrack>>, video: Option<Arc<LocalTrack>>) -> Self {
        Self {
            audio,
            video,
            screen: None,
        }
    }

    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.video.as_ref()
    }

    pub fn screen(&self) -> Option<&Arc<LocalTrack>> {
        self.screen.as_ref()
    }

    pub fn audio_on(&self) -> bool {
        self.audio
            .as_ref()
            .map(|t| t.is_live() && t.is_enabled())
            .unwrap_or(false)
    }

    pub fn video_on(&self) -> bool {
        self.video
            .as_ref()
            .map(|t| t.is_live() && t.is_enabled())
            .unwrap_or(false)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        if let Some(track) = &self.audio {
            track.set_enabled(enabled);
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        if let Some(track) = &self.video {
            track.set_enabled(enabled);
        }
    }

    pub fn screen_share_active(&self) -> bool {
        self.screen.as_ref().map(|t| t.is_live()).unwrap_or(false)
    }

    /// The video track peers should currently receive
    pub fn outgoing_video(&self) -> Option<Arc<LocalTrack>> {
        self.screen
            .as_ref()
            .filter(|t| t.is_live())
            .or(self.video.as_ref())
            .cloned()
    }

    /// Tracks attached to every new peer connection
    pub fn outgoing_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.audio
            .iter()
            .cloned()
            .chain(self.outgoing_video())
            .collect()
    }

    pub fn begin_screen_share(&mut self, track: Arc<LocalTrack>) {
        if let Some(previous) = self.screen.replace(track) {
            previous.stop();
        }
    }

    /// Stops and removes the screen track, returning it if one was active
    pub fn end_screen_share(&mut self) -> Option<Arc<LocalTrack>> {
        let track = self.screen.take()?;
        track.stop();
        Some(track)
    }

    /// Stop camera, microphone and screen share
    pub fn stop_all(&mut self) {
        for track in [self.audio.take(), self.video.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
    }
}

/// Open whatever was requested; a missing device degrades the stream instead of failing the join
pub async fn acquire_user_media(
    devices: &dyn MediaDevices,
    want_audio: bool,
    want_video: bool,
    events: &MeshEventSender,
) -> (LocalStream, Vec<MeetError>) {
    let mut failures = Vec::new();

    let audio = if want_audio {
        match devices.open_microphone(events.clone()).await {
            Ok(track) => Some(track),
            Err(e) => {
                tracing::warn!(error = %e, "Microphone unavailable, joining without audio");
                failures.push(e);
                None
            }
        }
    } else {
        None
    };

    let video = if want_video {
        match devices.open_camera(events.clone()).await {
            Ok(track) => Some(track),
            Err(e) => {
                tracing::warn!(error = %e, "Camera unavailable, joining without video");
                failures.push(e);
                None
            }
        }
    } else {
        None
    };

    (LocalStream::new(audio, video), failures)
}
