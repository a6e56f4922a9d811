use thiserror::Error;

/// Error types for the meeting client
#[derive(Debug, Error)]
pub enum MeetError {
    /// WebRTC negotiation errors
    #[error("Failed to create peer connection: {0}")]
    PeerConnectionCreation(String),

    #[error("Failed to create offer: {0}")]
    CreateOfferFailed(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("Invalid SDP format: {0}")]
    InvalidSdp(String),

    #[error("Failed to set local description: {0}")]
    SetLocalDescriptionFailed(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescriptionFailed(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidateFailed(String),

    #[error("Failed to add track: {0}")]
    AddTrackFailed(String),

    #[error("Peer {0} already exists")]
    PeerAlreadyExists(String),

    /// Authorization errors
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Join denied: {0}")]
    JoinDenied(String),

    #[error("Invalid host command: {0}")]
    InvalidCommand(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Media acquisition errors
    #[error("Media device unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// Transport errors
    #[error("Signaling channel is not connected")]
    NotConnected,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid signaling message: {0}")]
    InvalidSignalingMessage(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Chat errors
    #[error("Chat is disabled for this meeting")]
    ChatDisabled,

    #[error("Invalid chat message: {0}")]
    InvalidMessage(String),

    #[error("Message {0} not found")]
    MessageNotFound(String),

    /// Recording errors
    #[error("Recording already in progress")]
    RecordingInProgress,

    #[error("No recording in progress")]
    NotRecording,

    #[error("Recording pipeline error: {0}")]
    RecordingPipeline(String),

    /// Configuration errors
    #[error("Missing required configuration: {0}")]
    MissingConfiguration(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigurationParseFailed(String),

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    #[error("Failed to register codec: {0}")]
    CodecRegistrationFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using MeetError
pub type Result<T> = std::result::Result<T, MeetError>;

/// Coarse error classes, each with its own handling policy in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Negotiation,
    Authorization,
    MediaAcquisition,
    Transport,
    Chat,
    Recording,
    Configuration,
    Internal,
}

impl MeetError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        MeetError::Internal(msg.into())
    }

    /// Helper to create WebRTC API errors
    pub fn webrtc_api(msg: impl Into<String>) -> Self {
        MeetError::WebRtcApi(msg.into())
    }

    /// Helper to create network errors
    pub fn network(msg: impl Into<String>) -> Self {
        MeetError::NetworkError(msg.into())
    }

    pub fn media(msg: impl Into<String>) -> Self {
        MeetError::MediaUnavailable(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MeetError::PeerConnectionCreation(_)
            | MeetError::CreateOfferFailed(_)
            | MeetError::CreateAnswerFailed(_)
            | MeetError::InvalidSdp(_)
            | MeetError::SetLocalDescriptionFailed(_)
            | MeetError::SetRemoteDescriptionFailed(_)
            | MeetError::AddIceCandidateFailed(_)
            | MeetError::AddTrackFailed(_)
            | MeetError::PeerAlreadyExists(_)
            | MeetError::WebRtcApi(_) => ErrorKind::Negotiation,

            MeetError::Unauthorized(_)
            | MeetError::JoinDenied(_)
            | MeetError::InvalidCommand(_)
            | MeetError::CommandFailed(_) => ErrorKind::Authorization,

            MeetError::MediaUnavailable(_) | MeetError::CaptureFailed(_) => {
                ErrorKind::MediaAcquisition
            }

            MeetError::NotConnected
            | MeetError::NetworkError(_)
            | MeetError::InvalidSignalingMessage(_)
            | MeetError::SerializationFailed(_) => ErrorKind::Transport,

            MeetError::ChatDisabled
            | MeetError::InvalidMessage(_)
            | MeetError::MessageNotFound(_) => ErrorKind::Chat,

            MeetError::RecordingInProgress
            | MeetError::NotRecording
            | MeetError::RecordingPipeline(_) => ErrorKind::Recording,

            MeetError::MissingConfiguration(_)
            | MeetError::ConfigurationParseFailed(_)
            | MeetError::CodecRegistrationFailed(_) => ErrorKind::Configuration,

            MeetError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Convert webrtc::Error to MeetError
impl From<webrtc::Error> for MeetError {
    fn from(err: webrtc::Error) -> Self {
        MeetError::WebRtcApi(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MeetError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MeetError::NetworkError(err.to_string())
    }
}

impl From<reqwest::Error> for MeetError {
    fn from(err: reqwest::Error) -> Self {
        MeetError::NetworkError(err.to_string())
    }
}

impl From<gstreamer::glib::Error> for MeetError {
    fn from(err: gstreamer::glib::Error) -> Self {
        MeetError::CaptureFailed(err.to_string())
    }
}
