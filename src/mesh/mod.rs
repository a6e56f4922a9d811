pub mod chat;
pub mod connection;
pub mod host;
pub mod peers;
pub mod roster;
pub mod session;
pub mod signaling;
pub mod webrtc_utils;

#[cfg(test)]
pub(crate) mod testing;

use tokio::sync::mpsc;

pub use connection::{PeerConnectionState, PeerConnector, PeerLink, RemoteTrackInfo, RtcPeerConnector};
pub use peers::PeerManager;
pub use roster::{MeetingSnapshot, Participant, Roster, RosterUpdate};
pub use session::{ClientCommand, MeetingClient, Notice, TeardownReason};
pub use signaling::{ClientMessage, IceCandidate, JoinUser, ServerMessage, SignalData, SignalingSender};

/// Events raised off the main loop (webrtc callbacks, capture threads) and fed back into it
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    LocalIceCandidate {
        peer_id: String,
        generation: u64,
        candidate: IceCandidate,
    },
    ConnectionState {
        peer_id: String,
        generation: u64,
        state: PeerConnectionState,
    },
    RemoteTrack {
        peer_id: String,
        generation: u64,
        track: RemoteTrackInfo,
    },
    CaptureEnded {
        capture_id: u64,
        error: Option<String>,
    },
    /// A local capture source stopped without being asked to
    LocalSourceEnded {
        track_id: String,
    },
}

pub type MeshEventSender = mpsc::UnboundedSender<MeshEvent>;
pub type MeshEventReceiver = mpsc::UnboundedReceiver<MeshEvent>;
