//! In-crate fakes for exercising the mesh without real media or networking

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::connection::{PeerConnector, PeerLink};
use super::signaling::IceCandidate;
use super::{MeshEvent, MeshEventSender};
use crate::error::{MeetError, Result};
use crate::media::{LocalTrack, MediaDevices, MediaKind};
use crate::recording::{CaptureBackend, CaptureSession};

#[derive(Default)]
pub struct FakeLink {
    pub peer_id: String,
    pub generation: u64,
    pub attached: Vec<String>,
    pub calls: Mutex<Vec<String>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub remote_described: AtomicBool,
    pub closed: AtomicBool,
    pub fail_negotiation: bool,
    pub video_track: Mutex<Option<String>>,
}

impl FakeLink {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<String> {
        self.record("create_offer");
        if self.fail_negotiation {
            return Err(MeetError::CreateOfferFailed("fake".into()));
        }
        Ok(format!("offer-sdp-{}", self.peer_id))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        self.record(&format!("accept_offer:{}", sdp));
        if self.fail_negotiation {
            return Err(MeetError::SetRemoteDescriptionFailed("fake".into()));
        }
        self.remote_described.store(true, Ordering::SeqCst);
        Ok(format!("answer-sdp-{}", self.peer_id))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        self.record(&format!("accept_answer:{}", sdp));
        if self.fail_negotiation {
            return Err(MeetError::SetRemoteDescriptionFailed("fake".into()));
        }
        self.remote_described.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_described.load(Ordering::SeqCst) {
            return Err(MeetError::AddIceCandidateFailed("no remote description".into()));
        }
        self.record("add_ice_candidate");
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote_described.load(Ordering::SeqCst)
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        *self.video_track.lock().unwrap() = Some(track.id().to_string());
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub links: Mutex<Vec<Arc<FakeLink>>>,
    pub failing_peers: Mutex<HashSet<String>>,
    pub refuse_connect: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_negotiation_with(&self, peer_id: &str) {
        self.failing_peers.lock().unwrap().insert(peer_id.to_string());
    }

    pub fn created(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Most recent link created for `peer_id`
    pub fn link(&self, peer_id: &str) -> Option<Arc<FakeLink>> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|l| l.peer_id == peer_id)
            .cloned()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        peer_id: &str,
        generation: u64,
        tracks: &[Arc<LocalTrack>],
        _events: MeshEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(MeetError::PeerConnectionCreation("fake".into()));
        }
        let link = Arc::new(FakeLink {
            peer_id: peer_id.to_string(),
            generation,
            attached: tracks.iter().map(|t| t.id().to_string()).collect(),
            fail_negotiation: self.failing_peers.lock().unwrap().contains(peer_id),
            ..Default::default()
        });
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

#[derive(Default)]
pub struct FakeDevices {
    pub no_camera: bool,
    pub no_microphone: bool,
    pub displays_opened: AtomicUsize,
}

impl FakeDevices {
    pub fn without_camera() -> Self {
        Self {
            no_camera: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_microphone(&self, _events: MeshEventSender) -> Result<Arc<LocalTrack>> {
        if self.no_microphone {
            return Err(MeetError::media("microphone permission denied"));
        }
        Ok(LocalTrack::detached(MediaKind::Audio, "microphone"))
    }

    async fn open_camera(&self, _events: MeshEventSender) -> Result<Arc<LocalTrack>> {
        if self.no_camera {
            return Err(MeetError::media("no camera found"));
        }
        Ok(LocalTrack::detached(MediaKind::Video, "camera"))
    }

    async fn open_display(&self, _events: MeshEventSender) -> Result<Arc<LocalTrack>> {
        let n = self.displays_opened.fetch_add(1, Ordering::SeqCst);
        Ok(LocalTrack::detached(MediaKind::Video, &format!("screen-{}", n)))
    }
}

/// Capture backend that remembers its sessions so tests can end them out-of-band
#[derive(Default)]
pub struct FakeCapture {
    pub deny: AtomicBool,
    pub started: AtomicUsize,
    pub finished: Arc<AtomicUsize>,
    pub last_capture: AtomicU64,
    pub events: Mutex<Option<MeshEventSender>>,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the user pressing the platform's "stop sharing" button
    pub fn end_externally(&self) {
        let capture_id = self.last_capture.load(Ordering::SeqCst);
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(MeshEvent::CaptureEnded {
                capture_id,
                error: None,
            });
        }
    }
}

struct FakeCaptureSession {
    output: PathBuf,
    finished: Arc<AtomicUsize>,
}

#[async_trait]
impl CaptureSession for FakeCaptureSession {
    async fn finish(&mut self) -> Result<PathBuf> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

#[async_trait]
impl CaptureBackend for FakeCapture {
    async fn start(
        &self,
        capture_id: u64,
        output: PathBuf,
        events: MeshEventSender,
    ) -> Result<Box<dyn CaptureSession>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MeetError::CaptureFailed("display capture denied".into()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        self.last_capture.store(capture_id, Ordering::SeqCst);
        *self.events.lock().unwrap() = Some(events);
        Ok(Box::new(FakeCaptureSession {
            output,
            finished: self.finished.clone(),
        }))
    }
}
