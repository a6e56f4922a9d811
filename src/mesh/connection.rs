use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use super::signaling::IceCandidate;
use super::webrtc_utils::{self, WebRTCConfig};
use super::{MeshEvent, MeshEventSender};
use crate::error::{MeetError, Result};
use crate::media::{LocalTrack, MediaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the connection is gone for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Closed)
    }
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerConnectionState::New,
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            // Disconnected may still recover through ICE; only failed/closed are terminal
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        }
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A remote track received on a peer connection (the remote media sink)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// One negotiated connection to a remote participant
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer, apply it locally and return its SDP
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer, create and apply the answer, return its SDP
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    async fn accept_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<()>;

    async fn close(&self);
}

/// Creates peer links; callbacks are reported through `events` tagged with `generation`
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer_id: &str,
        generation: u64,
        tracks: &[Arc<LocalTrack>],
        events: MeshEventSender,
    ) -> Result<Arc<dyn PeerLink>>;
}

pub struct RtcPeerConnector {
    api: Arc<API>,
    config: WebRTCConfig,
}

impl RtcPeerConnector {
    pub fn new(config: WebRTCConfig) -> Result<Self> {
        Ok(Self {
            api: webrtc_utils::create_webrtc_api(&config)?,
            config,
        })
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect(
        &self,
        peer_id: &str,
        generation: u64,
        tracks: &[Arc<LocalTrack>],
        events: MeshEventSender,
    ) -> Result<Arc<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: webrtc_utils::rtc_ice_servers(&self.config),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| MeetError::PeerConnectionCreation(e.to_string()))?,
        );

        let video_sender = attach_or_close(&peer_connection, tracks).await?;

        {
            let events = events.clone();
            let peer_id = peer_id.to_string();
            peer_connection.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(MeshEvent::LocalIceCandidate {
                                peer_id,
                                generation,
                                candidate: IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            });
                        }
                        Err(e) => {
                            tracing::warn!(peer_id = %peer_id, error = %e, "Failed to serialize local ICE candidate");
                        }
                    }
                })
            }));
        }

        {
            let events = events.clone();
            let peer_id = peer_id.to_string();
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                tracing::debug!(peer_id = %peer_id, state = %state, "Peer connection state changed");
                let _ = events.send(MeshEvent::ConnectionState {
                    peer_id: peer_id.clone(),
                    generation,
                    state: state.into(),
                });
                Box::pin(async {})
            }));
        }

        {
            let peer_id = peer_id.to_string();
            peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = if track.kind() == RTPCodecType::Audio {
                    MediaKind::Audio
                } else {
                    MediaKind::Video
                };
                let _ = events.send(MeshEvent::RemoteTrack {
                    peer_id: peer_id.clone(),
                    generation,
                    track: RemoteTrackInfo {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    },
                });
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(RtcPeerLink {
            peer_id: peer_id.to_string(),
            peer_connection,
            video_sender: Mutex::new(video_sender),
        }))
    }
}

/// Attach local tracks and make sure both kinds are received. The connection is
/// closed if anything fails, so no half-built connection outlives the error.
async fn attach_or_close(
    peer_connection: &RTCPeerConnection,
    tracks: &[Arc<LocalTrack>],
) -> Result<Option<Arc<RTCRtpSender>>> {
    match attach_media(peer_connection, tracks).await {
        Ok(video_sender) => Ok(video_sender),
        Err(e) => {
            if let Err(close_err) = peer_connection.close().await {
                tracing::debug!(error = %close_err, "Closing half-built peer connection failed");
            }
            Err(e)
        }
    }
}

async fn attach_media(
    peer_connection: &RTCPeerConnection,
    tracks: &[Arc<LocalTrack>],
) -> Result<Option<Arc<RTCRtpSender>>> {
    let mut video_sender = None;
    for track in tracks {
        let sender = peer_connection
            .add_track(track.rtc_track())
            .await
            .map_err(|e| MeetError::AddTrackFailed(e.to_string()))?;
        if track.kind() == MediaKind::Video {
            video_sender = Some(sender);
        }
    }

    // Always offer to receive both kinds, even with no local camera or mic
    for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
        let local_kind = if kind == RTPCodecType::Audio {
            MediaKind::Audio
        } else {
            MediaKind::Video
        };
        if !tracks.iter().any(|t| t.kind() == local_kind) {
            peer_connection.add_transceiver_from_kind(kind, None).await?;
        }
    }
    Ok(video_sender)
}

pub struct RtcPeerLink {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| MeetError::CreateOfferFailed(e.to_string()))?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MeetError::SetLocalDescriptionFailed(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| MeetError::InvalidSdp(format!("Failed to parse offer SDP: {}", e)))?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| MeetError::SetRemoteDescriptionFailed(e.to_string()))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| MeetError::CreateAnswerFailed(e.to_string()))?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MeetError::SetLocalDescriptionFailed(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| MeetError::InvalidSdp(format!("Failed to parse answer SDP: {}", e)))?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| MeetError::SetRemoteDescriptionFailed(e.to_string()))?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let ice_candidate = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(ice_candidate)
            .await
            .map_err(|e| MeetError::AddIceCandidateFailed(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let sender = self.video_sender.lock().await.clone();
        match sender {
            Some(sender) => {
                sender.replace_track(Some(track.rtc_track())).await?;
                Ok(())
            }
            None => {
                // No camera was attached at creation; renegotiation is out of scope
                tracing::warn!(peer_id = %self.peer_id, "No video sender to replace");
                Ok(())
            }
        }
    }

    async fn close(&self) {
        tracing::info!(peer_id = %self.peer_id, "Closing peer connection");
        if let Err(e) = self.peer_connection.close().await {
            tracing::debug!(peer_id = %self.peer_id, error = %e, "Error while closing peer connection");
        }
    }
}
