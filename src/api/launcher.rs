use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::join_check::check_can_join;
use super::signaling_socket;
use crate::config::Config;
use crate::error::Result;
use crate::media::GstMediaDevices;
use crate::mesh::session::{Backends, NoticeSender};
use crate::mesh::{ClientCommand, MeetingClient, RtcPeerConnector, TeardownReason};
use crate::recording::GstCaptureBackend;

/// Pre-check, connect and run one meeting session with real devices.
///
/// Errors are returned only for failures before the session starts; once running,
/// every ending is reported as a `TeardownReason`.
pub async fn run_meeting(
    config: Config,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    view_closed: oneshot::Receiver<()>,
    notices: NoticeSender,
) -> Result<TeardownReason> {
    let token = config.signaling.token.as_deref();

    check_can_join(&config.signaling.api_base_url, &config.session.meeting_id, token).await?;

    let backends = Backends {
        connector: Arc::new(RtcPeerConnector::new(config.webrtc.clone())?),
        devices: Arc::new(GstMediaDevices::new()?),
        capture: Arc::new(GstCaptureBackend::new()?),
    };

    let connection = signaling_socket::connect(&config.signaling.url, token).await?;

    let client = MeetingClient::new(
        config.session.clone(),
        config.recording.output_dir.clone(),
        connection.sender,
        backends,
        notices,
    );

    tracing::info!(meeting_id = %config.session.meeting_id, "Meeting session starting");
    let reason = client.run(connection.inbound, commands, view_closed).await;
    tracing::info!(reason = %reason, "Meeting session ended");
    Ok(reason)
}
