use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Whatever produces samples for a track; stopped when the track is stopped
pub trait TrackSource: Send {
    fn stop(&mut self);
}

/// A locally captured track. Only the local client owns and stops it.
pub struct LocalTrack {
    kind: MediaKind,
    id: String,
    enabled: Arc<AtomicBool>,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
    source: Mutex<Option<Box<dyn TrackSource>>>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, id: &str) -> Self {
        let capability = match kind {
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        };

        Self {
            kind,
            id: id.to_string(),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: AtomicBool::new(false),
            rtc: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.to_owned(),
                "meet-mesh".to_owned(),
            )),
            source: Mutex::new(None),
        }
    }

    /// A track with no capture source behind it
    pub fn detached(kind: MediaKind, id: &str) -> Arc<Self> {
        Arc::new(Self::new(kind, id))
    }

    pub fn attach_source(&self, source: Box<dyn TrackSource>) {
        let mut slot = self.source.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(source);
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    /// Shared with the sample pump, which drops samples while disabled
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Idempotent
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.enabled.store(false, Ordering::SeqCst);

        let source = self
            .source
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut source) = source {
            source.stop();
        }
        tracing::debug!(track_id = %self.id, kind = %self.kind, "Local track stopped");
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}
