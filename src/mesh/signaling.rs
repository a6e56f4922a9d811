use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::chat::ChatMessage;
use super::host::{HostAction, HostCommand};
use super::roster::RosterUpdate;
use crate::error::{MeetError, Result};

/// Identity announced in `join` and carried by `peer-join`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinUser {
    pub user_key: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Payload of a `signal` frame, relayed verbatim between two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    Offer { sdp: String },
    Answer { sdp: String },
    Ice(IceCandidate),
}

impl SignalData {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalData::Offer { .. } => "offer",
            SignalData::Answer { .. } => "answer",
            SignalData::Ice(_) => "ice",
        }
    }
}

/// Client → coordinator frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join { meeting_id: String, user: JoinUser },

    Signal { to: String, data: SignalData },

    #[serde(rename_all = "camelCase")]
    Status { audio_on: bool, video_on: bool },

    #[serde(rename_all = "camelCase")]
    HostCommand {
        meeting_id: String,
        cmd: HostCommand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },

    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        text: String,
    },

    #[serde(rename_all = "camelCase")]
    DeleteMessage { meeting_id: String, message_id: String },

    Leave {},
}

/// Coordinator → client frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Transport handshake carrying this client's connection id
    Connected { id: String },

    Participants(RosterUpdate),

    PeerJoin {
        id: String,
        #[serde(default)]
        user: Option<JoinUser>,
    },

    Signal { from: String, data: SignalData },

    PeerLeft { id: String },

    #[serde(rename_all = "camelCase")]
    HostAssigned { host_id: String },

    HostAction {
        cmd: HostAction,
        #[serde(default)]
        reason: Option<String>,
    },

    Recording {
        recording: bool,
        #[serde(default)]
        by: Option<String>,
    },

    ChatToggled { enabled: bool },

    ChatHistory {
        #[serde(default)]
        messages: Vec<ChatMessage>,
    },

    Chat { message: ChatMessage },

    MessageDeleted { id: String },

    #[serde(rename_all = "camelCase")]
    MeetingDeleted { meeting_id: String },

    /// Generic failure reported by the coordinator (unauthorized, target not found, ...)
    Error { message: String },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| MeetError::InvalidSignalingMessage(e.to_string()))
    }
}

/// Outbound half of the signaling channel.
///
/// Clones share one underlying sender; `disconnect` drops it for all of them, which
/// lets the transport writer flush and close the socket.
#[derive(Clone)]
pub struct SignalingSender {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>>,
}

impl SignalingSender {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Channel pair for wiring a transport, or for inspecting traffic in tests
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn slot(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ClientMessage>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.slot().as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    pub fn send(&self, message: ClientMessage) -> Result<()> {
        let slot = self.slot();
        let tx = slot.as_ref().ok_or(MeetError::NotConnected)?;
        tx.send(message).map_err(|_| MeetError::NotConnected)
    }

    pub fn disconnect(&self) {
        if self.slot().take().is_some() {
            tracing::debug!("Signaling sender detached");
        }
    }
}
