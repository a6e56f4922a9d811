use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::chat::{ChatMessage, ChatRelay};
use super::connection::PeerConnector;
use super::host::{apply_host_action, Dispatch, HostAction, HostCommand, HostDispatcher, LocalEffect};
use super::peers::PeerManager;
use super::roster::{MeetingSnapshot, Roster};
use super::signaling::{ClientMessage, JoinUser, ServerMessage, SignalingSender};
use super::{MeshEvent, MeshEventReceiver, MeshEventSender};
use crate::config::SessionConfig;
use crate::error::{ErrorKind, MeetError, Result};
use crate::media::{acquire_user_media, LocalStream, LocalTrack, MediaDevices, MediaKind};
use crate::recording::{CaptureBackend, RecordingArtifact, RecordingCoordinator};

/// User intents fed into the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Host { cmd: HostCommand, target: Option<String> },
    Chat { text: String, to: Option<String> },
    DeleteMessage { id: String },
    StartRecording,
    StopRecording,
    ToggleAudio,
    ToggleVideo,
    StartScreenShare,
    StopScreenShare,
    Leave,
}

/// Why the session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    Left,
    Kicked { reason: Option<String> },
    Banned { reason: Option<String> },
    MeetingDeleted,
    ViewClosed,
    TransportLost,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownReason::Left => f.write_str("left the meeting"),
            TeardownReason::Kicked { reason } => match reason {
                Some(reason) => write!(f, "removed by the host: {}", reason),
                None => f.write_str("removed by the host"),
            },
            TeardownReason::Banned { reason } => match reason {
                Some(reason) => write!(f, "banned by the host: {}", reason),
                None => f.write_str("banned by the host"),
            },
            TeardownReason::MeetingDeleted => f.write_str("meeting was deleted"),
            TeardownReason::ViewClosed => f.write_str("meeting view closed"),
            TeardownReason::TransportLost => f.write_str("connection to the meeting server lost"),
        }
    }
}

/// Everything the hosting view needs to render
#[derive(Debug, Clone)]
pub enum Notice {
    Joined { meeting_id: String },
    MediaDegraded { message: String },
    Roster(Arc<MeetingSnapshot>),
    PeerJoined { peer_id: String, display_name: Option<String> },
    PeerLeft { peer_id: String },
    RemoteTrack { peer_id: String, kind: MediaKind },
    HostControls { unlocked: bool },
    HostAction { action: HostAction, reason: Option<String> },
    LocalMedia { audio_on: bool, video_on: bool },
    ScreenShare { active: bool },
    Recording { recording: bool, by: Option<String> },
    RecordingSaved(RecordingArtifact),
    ChatEnabled(bool),
    ChatHistory { count: usize },
    ChatMessage(ChatMessage),
    MessageDeleted { id: String },
    /// Something the user asked for did not happen
    Failed { kind: ErrorKind, message: String },
    ConnectionStatus { connected: bool },
    Ended(TeardownReason),
}

pub type NoticeSender = mpsc::UnboundedSender<Notice>;

/// Pluggable backends for peers, devices and recording
pub struct Backends {
    pub connector: Arc<dyn PeerConnector>,
    pub devices: Arc<dyn MediaDevices>,
    pub capture: Arc<dyn CaptureBackend>,
}

/// One client's view of a meeting. All state is owned here and mutated only from
/// the handlers below, one event at a time.
pub struct MeetingClient {
    session: SessionConfig,
    signaling: SignalingSender,
    roster: Roster,
    peers: PeerManager,
    host: HostDispatcher,
    recording: RecordingCoordinator,
    chat: ChatRelay,
    devices: Arc<dyn MediaDevices>,
    media: LocalStream,
    notices: NoticeSender,
    events_tx: MeshEventSender,
    events_rx: MeshEventReceiver,
    ended: Option<TeardownReason>,
}

impl MeetingClient {
    pub fn new(
        session: SessionConfig,
        recording_dir: PathBuf,
        signaling: SignalingSender,
        backends: Backends,
        notices: NoticeSender,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            roster: Roster::new(&session.meeting_id, &session.user_key),
            peers: PeerManager::new(backends.connector, signaling.clone(), events_tx.clone()),
            host: HostDispatcher::new(&session.meeting_id, signaling.clone()),
            recording: RecordingCoordinator::new(backends.capture, recording_dir),
            chat: ChatRelay::new(&session.meeting_id, &session.user_key, signaling.clone()),
            devices: backends.devices,
            media: LocalStream::default(),
            session,
            signaling,
            notices,
            events_tx,
            events_rx,
            ended: None,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn media(&self) -> &LocalStream {
        &self.media
    }

    pub fn chat(&self) -> &ChatRelay {
        &self.chat
    }

    pub fn recording(&self) -> &RecordingCoordinator {
        &self.recording
    }

    pub fn ended(&self) -> Option<&TeardownReason> {
        self.ended.as_ref()
    }

    fn notify(&self, notice: Notice) {
        // The view may already be gone; nothing to do then
        let _ = self.notices.send(notice);
    }

    fn report(&self, context: &str, error: MeetError) {
        tracing::warn!(context = context, error = %error, "Operation failed");
        self.notify(Notice::Failed {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn publish_status(&self) {
        let audio_on = self.media.audio_on();
        let video_on = self.media.video_on();
        self.notify(Notice::LocalMedia { audio_on, video_on });
        if let Err(e) = self.signaling.send(ClientMessage::Status { audio_on, video_on }) {
            tracing::debug!(error = %e, "Status not published");
        }
    }

    /// Acquire local media (degrading on failure) and announce ourselves
    pub async fn join(&mut self) -> Result<()> {
        let (media, failures) = acquire_user_media(
            self.devices.as_ref(),
            self.session.start_audio,
            self.session.start_video,
            &self.events_tx,
        )
        .await;
        self.media = media;
        for failure in failures {
            self.notify(Notice::MediaDegraded {
                message: failure.to_string(),
            });
        }

        self.signaling.send(ClientMessage::Join {
            meeting_id: self.session.meeting_id.clone(),
            user: JoinUser {
                user_key: self.session.user_key.clone(),
                display_name: self.session.display_name.clone(),
                role: self.session.role.clone(),
            },
        })?;
        tracing::info!(
            meeting_id = %self.session.meeting_id,
            user_key = %self.session.user_key,
            audio = self.media.audio_on(),
            video = self.media.video_on(),
            "Join sent"
        );

        self.publish_status();
        Ok(())
    }

    fn notify_privilege_change(&self, was_privileged: bool) {
        let privileged = self.roster.is_privileged();
        if privileged != was_privileged {
            self.notify(Notice::HostControls { unlocked: privileged });
        }
    }

    /// Returns a teardown reason when the message ends the session
    pub async fn handle_server_message(&mut self, message: ServerMessage) -> Option<TeardownReason> {
        match message {
            ServerMessage::Connected { id } => {
                self.roster.set_local_connection(&id);
                self.notify(Notice::ConnectionStatus { connected: true });
            }

            ServerMessage::Participants(update) => {
                let was_joined = self.roster.is_joined();
                let was_privileged = self.roster.is_privileged();
                let snapshot = self.roster.apply_snapshot(update);
                self.peers.prune_pending_ice(&snapshot);
                if !was_joined {
                    self.notify(Notice::Joined {
                        meeting_id: snapshot.meeting_id.clone(),
                    });
                    self.notify(Notice::ChatEnabled(snapshot.chat_enabled));
                }
                self.notify(Notice::Roster(snapshot));
                self.notify_privilege_change(was_privileged);
            }

            ServerMessage::PeerJoin { id, user } => {
                if self.roster.local_connection_id() == Some(id.as_str()) {
                    return None;
                }
                let tracks = self.media.outgoing_tracks();
                match self.peers.on_peer_join(&id, &tracks).await {
                    Ok(true) => self.notify(Notice::PeerJoined {
                        peer_id: id,
                        display_name: user.map(|u| u.display_name),
                    }),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(peer_id = %id, error = %e, "Could not connect to new peer"),
                }
            }

            ServerMessage::Signal { from, data } => {
                let tracks = self.media.outgoing_tracks();
                if let Err(e) = self.peers.on_signal(&from, data, &tracks).await {
                    tracing::warn!(peer_id = %from, error = %e, "Failed to handle signal");
                }
            }

            ServerMessage::PeerLeft { id } => {
                let was_privileged = self.roster.is_privileged();
                self.peers.on_peer_left(&id).await;
                let snapshot = self.roster.on_connection_left(&id);
                self.notify(Notice::PeerLeft { peer_id: id });
                self.notify(Notice::Roster(snapshot));
                self.notify_privilege_change(was_privileged);
            }

            ServerMessage::HostAssigned { host_id } => {
                let was_privileged = self.roster.is_privileged();
                self.roster.on_host_assigned(&host_id);
                self.notify(Notice::Roster(self.roster.snapshot()));
                self.notify_privilege_change(was_privileged);
            }

            ServerMessage::HostAction { cmd, reason } => {
                self.notify(Notice::HostAction {
                    action: cmd,
                    reason: reason.clone(),
                });
                match apply_host_action(cmd, reason, &self.media) {
                    LocalEffect::MediaChanged { .. } => self.publish_status(),
                    LocalEffect::Evicted { banned: true, reason } => {
                        return Some(TeardownReason::Banned { reason })
                    }
                    LocalEffect::Evicted { banned: false, reason } => {
                        return Some(TeardownReason::Kicked { reason })
                    }
                }
            }

            ServerMessage::Recording { recording, by } => {
                self.recording
                    .on_remote_recording_state_change(&mut self.roster, recording, by.clone());
                self.notify(Notice::Recording { recording, by });
            }

            ServerMessage::ChatToggled { enabled } => {
                self.roster.set_chat_enabled(enabled);
                self.notify(Notice::ChatEnabled(enabled));
            }

            ServerMessage::ChatHistory { messages } => {
                let count = messages.len();
                self.chat.on_history(messages);
                self.notify(Notice::ChatHistory { count });
            }

            ServerMessage::Chat { message } => {
                if self.chat.on_message(message.clone()) {
                    self.notify(Notice::ChatMessage(message));
                }
            }

            ServerMessage::MessageDeleted { id } => {
                if self.chat.on_message_deleted(&id) {
                    self.notify(Notice::MessageDeleted { id });
                }
            }

            ServerMessage::MeetingDeleted { meeting_id } => {
                if meeting_id == self.session.meeting_id {
                    return Some(TeardownReason::MeetingDeleted);
                }
                tracing::debug!(meeting_id = %meeting_id, "Deletion of another meeting ignored");
            }

            ServerMessage::Error { message } => {
                // Coordinator errors are not differentiated by cause
                self.report("coordinator", MeetError::CommandFailed(message));
            }
        }
        None
    }

    pub async fn handle_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::LocalIceCandidate {
                peer_id,
                generation,
                candidate,
            } => {
                if let Err(e) = self.peers.on_local_candidate(&peer_id, generation, candidate) {
                    tracing::debug!(peer_id = %peer_id, error = %e, "Local candidate not sent");
                }
            }

            MeshEvent::ConnectionState {
                peer_id,
                generation,
                state,
            } => {
                if self.peers.on_connection_state(&peer_id, generation, state).await {
                    self.notify(Notice::PeerLeft { peer_id });
                }
            }

            MeshEvent::RemoteTrack {
                peer_id,
                generation,
                track,
            } => {
                let kind = track.kind;
                self.peers.on_remote_track(&peer_id, generation, track);
                if self.peers.is_current(&peer_id, generation) {
                    self.notify(Notice::RemoteTrack { peer_id, kind });
                }
            }

            MeshEvent::CaptureEnded { capture_id, error } => {
                match self
                    .recording
                    .on_capture_ended(capture_id, error, &self.host)
                    .await
                {
                    Some(Ok(artifact)) => self.notify(Notice::RecordingSaved(artifact)),
                    Some(Err(e)) => self.report("recording", e),
                    None => {}
                }
            }

            MeshEvent::LocalSourceEnded { track_id } => {
                let is_screen = self.media.screen().map(|t| t.id() == track_id).unwrap_or(false);
                if is_screen {
                    tracing::info!(track_id = %track_id, "Screen source ended, stopping share");
                    self.stop_screen_share().await;
                    return;
                }

                let lost: Option<Arc<LocalTrack>> = [self.media.audio(), self.media.video()]
                    .into_iter()
                    .flatten()
                    .find(|t| t.id() == track_id && t.is_live())
                    .cloned();
                if let Some(track) = lost {
                    tracing::warn!(track_id = %track_id, kind = %track.kind(), "Capture device lost");
                    track.stop();
                    self.notify(Notice::MediaDegraded {
                        message: format!("{} capture ended unexpectedly", track.kind()),
                    });
                    self.publish_status();
                }
            }
        }
    }

    /// Returns a teardown reason when the command ends the session
    pub async fn handle_command(&mut self, command: ClientCommand) -> Option<TeardownReason> {
        match command {
            ClientCommand::Host {
                cmd: HostCommand::StartRecord,
                ..
            }
            | ClientCommand::StartRecording => {
                if let Err(e) = self
                    .recording
                    .start_local_recording(&self.roster, &self.host, self.events_tx.clone())
                    .await
                {
                    self.report("start recording", e);
                }
            }

            ClientCommand::Host {
                cmd: HostCommand::StopRecord,
                ..
            }
            | ClientCommand::StopRecording => {
                match self.recording.stop_local_recording(&self.host).await {
                    Ok(artifact) => self.notify(Notice::RecordingSaved(artifact)),
                    Err(e) => self.report("stop recording", e),
                }
            }

            ClientCommand::Host { cmd, target } => {
                match self.host.issue(&self.roster, cmd, target.as_deref()) {
                    Ok(Dispatch::Sent) => {}
                    Ok(Dispatch::Dropped) => {
                        self.notify(Notice::ConnectionStatus { connected: false })
                    }
                    Err(e) => self.report("host command", e),
                }
            }

            ClientCommand::Chat { text, to } => {
                if let Err(e) = self.chat.send_message(&self.roster, &text, to.as_deref()) {
                    self.report("chat", e);
                }
            }

            ClientCommand::DeleteMessage { id } => {
                if let Err(e) = self.chat.delete_message(&id) {
                    self.report("delete message", e);
                }
            }

            ClientCommand::ToggleAudio => match self.media.audio() {
                Some(_) => {
                    self.media.set_audio_enabled(!self.media.audio_on());
                    self.publish_status();
                }
                None => self.report("toggle audio", MeetError::media("no microphone in this session")),
            },

            ClientCommand::ToggleVideo => match self.media.video() {
                Some(_) => {
                    self.media.set_video_enabled(!self.media.video_on());
                    self.publish_status();
                }
                None => self.report("toggle video", MeetError::media("no camera in this session")),
            },

            ClientCommand::StartScreenShare => self.start_screen_share().await,

            ClientCommand::StopScreenShare => self.stop_screen_share().await,

            ClientCommand::Leave => return Some(TeardownReason::Left),
        }
        None
    }

    async fn start_screen_share(&mut self) {
        if self.media.screen_share_active() {
            return;
        }
        match self.devices.open_display(self.events_tx.clone()).await {
            Ok(track) => {
                self.media.begin_screen_share(track.clone());
                self.peers.replace_video_track(track).await;
                self.notify(Notice::ScreenShare { active: true });
            }
            Err(e) => self.report("screen share", e),
        }
    }

    async fn stop_screen_share(&mut self) {
        if self.media.end_screen_share().is_none() {
            return;
        }
        if let Some(camera) = self.media.video().cloned() {
            self.peers.replace_video_track(camera).await;
        }
        self.notify(Notice::ScreenShare { active: false });
    }

    /// Release everything the session holds. Safe to call any number of times; only
    /// the first call has an effect.
    pub async fn teardown(&mut self, reason: TeardownReason) -> bool {
        if self.ended.is_some() {
            return false;
        }
        self.ended = Some(reason.clone());
        tracing::info!(meeting_id = %self.session.meeting_id, reason = %reason, "Tearing down meeting session");

        if self.recording.state().is_active() {
            let finished = match self.recording.stop_local_recording(&self.host).await {
                Ok(artifact) => Some(Ok(artifact)),
                Err(MeetError::NotRecording) => self.recording.shutdown().await,
                Err(e) => Some(Err(e)),
            };
            match finished {
                Some(Ok(artifact)) => self.notify(Notice::RecordingSaved(artifact)),
                Some(Err(e)) => self.report("recording", e),
                None => {}
            }
        }

        if reason == TeardownReason::Left {
            if let Err(e) = self.signaling.send(ClientMessage::Leave {}) {
                tracing::debug!(error = %e, "Leave not delivered");
            }
        }
        self.signaling.disconnect();

        let closed = self.peers.close_all().await;
        self.media.stop_all();

        tracing::info!(peers_closed = closed, "Meeting session released");
        self.notify(Notice::Ended(reason));
        true
    }

    /// Drive the session until something ends it. Dropping the `view_closed` sender
    /// counts as the view going away.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
        mut view_closed: oneshot::Receiver<()>,
    ) -> TeardownReason {
        if let Err(e) = self.join().await {
            tracing::error!(error = %e, "Failed to join meeting");
            self.report("join", e);
            self.teardown(TeardownReason::TransportLost).await;
            return TeardownReason::TransportLost;
        }

        let (_, detached) = mpsc::unbounded_channel();
        let mut events = std::mem::replace(&mut self.events_rx, detached);
        let mut commands_open = true;

        loop {
            let outcome = tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle_server_message(message).await,
                    None => {
                        tracing::warn!("Signaling channel closed");
                        self.notify(Notice::ConnectionStatus { connected: false });
                        Some(TeardownReason::TransportLost)
                    }
                },
                Some(event) = events.recv() => {
                    self.handle_mesh_event(event).await;
                    None
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        commands_open = false;
                        None
                    }
                },
                _ = &mut view_closed => Some(TeardownReason::ViewClosed),
            };

            if let Some(reason) = outcome {
                self.teardown(reason.clone()).await;
                return reason;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_events(&mut self) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::roster::{Participant, RosterUpdate};
    use crate::mesh::signaling::SignalData;
    use crate::mesh::testing::{FakeCapture, FakeConnector, FakeDevices};
    use crate::mesh::PeerConnectionState;
    use crate::recording::RecordingState;
    use std::time::Duration;

    struct Harness {
        client: MeetingClient,
        connector: Arc<FakeConnector>,
        capture: Arc<FakeCapture>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        notices: mpsc::UnboundedReceiver<Notice>,
    }

    impl Harness {
        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut sent = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                sent.push(message);
            }
            sent
        }

        fn notices(&mut self) -> Vec<Notice> {
            let mut notices = Vec::new();
            while let Ok(notice) = self.notices.try_recv() {
                notices.push(notice);
            }
            notices
        }

        async fn server(&mut self, message: ServerMessage) -> Option<TeardownReason> {
            self.client.handle_server_message(message).await
        }

        async fn pump_events(&mut self) {
            for event in self.client.pending_events() {
                self.client.handle_mesh_event(event).await;
            }
        }
    }

    fn session(user_key: &str) -> SessionConfig {
        SessionConfig {
            meeting_id: "M".to_string(),
            user_key: user_key.to_string(),
            display_name: user_key.to_uppercase(),
            role: "student".to_string(),
            start_audio: true,
            start_video: true,
        }
    }

    fn harness_with(user_key: &str, devices: FakeDevices) -> Harness {
        let connector = FakeConnector::new();
        let capture = FakeCapture::new();
        let (signaling, outbound) = SignalingSender::channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let client = MeetingClient::new(
            session(user_key),
            std::env::temp_dir().join("meet-mesh-session-tests"),
            signaling,
            Backends {
                connector: connector.clone(),
                devices: Arc::new(devices),
                capture: capture.clone(),
            },
            notice_tx,
        );
        Harness {
            client,
            connector,
            capture,
            outbound,
            notices,
        }
    }

    /// Joined client whose connection id is `conn`
    async fn joined(user_key: &str, conn: &str, roster: RosterUpdate) -> Harness {
        let mut h = harness_with(user_key, FakeDevices::default());
        h.server(ServerMessage::Connected { id: conn.to_string() }).await;
        h.client.join().await.unwrap();
        h.server(ServerMessage::Participants(roster)).await;
        h.sent();
        h.notices();
        h
    }

    fn participant(conn: &str) -> Participant {
        Participant {
            user_key: format!("u-{}", conn),
            sockets: std::iter::once(conn.to_string()).collect(),
            display_name: conn.to_uppercase(),
            role: "student".to_string(),
            audio_on: true,
            video_on: true,
            banned: false,
        }
    }

    fn meeting(conns: &[&str], host: Option<&str>, chat_enabled: bool) -> RosterUpdate {
        RosterUpdate {
            participants: conns.iter().map(|c| participant(c)).collect(),
            total: conns.len(),
            host: host.map(str::to_string),
            owner_id: Some("u-a".to_string()),
            chat_enabled,
            recording: false,
        }
    }

    fn peer_join(id: &str) -> ServerMessage {
        ServerMessage::PeerJoin { id: id.to_string(), user: None }
    }

    #[tokio::test]
    async fn test_join_sends_join_then_status() {
        let mut h = harness_with("u-a", FakeDevices::default());
        h.client.join().await.unwrap();

        let sent = h.sent();
        assert!(matches!(&sent[0], ClientMessage::Join { meeting_id, user } if meeting_id == "M" && user.user_key == "u-a"));
        assert_eq!(
            sent[1],
            ClientMessage::Status {
                audio_on: true,
                video_on: true
            }
        );
    }

    #[tokio::test]
    async fn test_join_degrades_without_camera() {
        let mut h = harness_with("u-a", FakeDevices::without_camera());
        h.client.join().await.unwrap();

        assert!(h.client.media().audio_on());
        assert!(!h.client.media().video_on());
        assert!(h
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::MediaDegraded { .. })));
        assert!(h.sent().iter().any(|m| matches!(m, ClientMessage::Join { .. })));
    }

    // Scenario 1: A (host) mutes everyone; B is muted, A is unaffected
    #[tokio::test]
    async fn test_mute_everyone_scenario() {
        let roster = meeting(&["a", "b", "c"], Some("a"), true);
        let mut a = joined("u-a", "a", roster.clone()).await;
        let mut b = joined("u-b", "b", roster).await;

        a.client
            .handle_command(ClientCommand::Host {
                cmd: HostCommand::MuteEveryone,
                target: None,
            })
            .await;
        let sent = a.sent();
        assert_eq!(
            sent,
            vec![ClientMessage::HostCommand {
                meeting_id: "M".to_string(),
                cmd: HostCommand::MuteEveryone,
                target: None
            }]
        );

        // Coordinator fans out the personal action to B and C only
        b.server(ServerMessage::HostAction {
            cmd: HostAction::Mute,
            reason: None,
        })
        .await;

        assert!(!b.client.media().audio_on());
        assert!(a.client.media().audio_on());
        assert_eq!(
            b.sent(),
            vec![ClientMessage::Status {
                audio_on: false,
                video_on: true
            }]
        );
    }

    #[tokio::test]
    async fn test_unprivileged_host_command_never_dispatched() {
        let mut c = joined("u-c", "c", meeting(&["a", "b", "c"], Some("a"), true)).await;

        c.client
            .handle_command(ClientCommand::Host {
                cmd: HostCommand::Kick,
                target: Some("b".into()),
            })
            .await;

        assert!(c.sent().is_empty());
        assert!(c.notices().iter().any(|n| matches!(
            n,
            Notice::Failed {
                kind: ErrorKind::Authorization,
                ..
            }
        )));
    }

    // Scenario 2: B disconnects; A's connection count drops from 2 to 1
    #[tokio::test]
    async fn test_peer_left_scenario() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.server(peer_join("b")).await;
        a.server(peer_join("c")).await;
        assert_eq!(a.client.peers().count(), 2);

        a.server(ServerMessage::PeerLeft { id: "b".into() }).await;
        assert_eq!(a.client.peers().count(), 1);
        assert!(a.connector.link("b").unwrap().is_closed());
        assert!(!a.client.peers().contains("b"));
    }

    #[tokio::test]
    async fn test_offers_go_to_joining_peer_and_answers_are_applied() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.server(peer_join("b")).await;
        a.server(peer_join("b")).await;

        let offers: Vec<_> = a
            .sent()
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::Signal { data: SignalData::Offer { .. }, .. }))
            .collect();
        assert_eq!(offers.len(), 1);
        assert_eq!(a.connector.created(), 1);

        a.server(ServerMessage::Signal {
            from: "b".into(),
            data: SignalData::Answer { sdp: "answer".into() },
        })
        .await;
        assert!(a
            .connector
            .link("b")
            .unwrap()
            .calls()
            .contains(&"accept_answer:answer".to_string()));
    }

    #[tokio::test]
    async fn test_own_peer_join_is_ignored() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.server(peer_join("a")).await;
        assert_eq!(a.client.peers().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_connection_removes_peer() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.server(peer_join("b")).await;
        let generation = a.connector.link("b").unwrap().generation;

        a.client
            .handle_mesh_event(MeshEvent::ConnectionState {
                peer_id: "b".into(),
                generation,
                state: PeerConnectionState::Failed,
            })
            .await;
        assert_eq!(a.client.peers().count(), 0);
        assert!(a
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::PeerLeft { peer_id } if peer_id == "b")));
    }

    // Scenario 3: every client's indicator flips regardless of who captures
    #[tokio::test]
    async fn test_recording_indicator_scenario() {
        let roster = meeting(&["a", "b", "c"], Some("a"), true);
        let mut a = joined("u-a", "a", roster.clone()).await;
        let mut b = joined("u-b", "b", roster.clone()).await;
        let mut c = joined("u-c", "c", roster).await;

        a.client.handle_command(ClientCommand::StartRecording).await;
        assert_eq!(a.client.recording().state(), RecordingState::Capturing);
        assert!(a.sent().iter().any(|m| matches!(
            m,
            ClientMessage::HostCommand {
                cmd: HostCommand::StartRecord,
                ..
            }
        )));

        let broadcast = ServerMessage::Recording {
            recording: true,
            by: Some("u-a".into()),
        };
        for client in [&mut a, &mut b, &mut c] {
            client.server(broadcast.clone()).await;
            let snapshot = client.client.roster().snapshot();
            assert!(snapshot.recording);
            assert_eq!(snapshot.recording_by.as_deref(), Some("u-a"));
        }
        assert_eq!(b.client.recording().state(), RecordingState::Idle);
    }

    fn stop_record_sent(sent: &[ClientMessage]) -> bool {
        sent.iter().any(|m| {
            matches!(
                m,
                ClientMessage::HostCommand {
                    cmd: HostCommand::StopRecord,
                    ..
                }
            )
        })
    }

    /// `b` is host but not owner; it starts recording and then host moves to `a`
    async fn recording_host_demoted() -> Harness {
        let mut b = joined("u-b", "b", meeting(&["a", "b"], Some("b"), true)).await;
        b.client.handle_command(ClientCommand::StartRecording).await;
        assert_eq!(b.client.recording().state(), RecordingState::Capturing);
        b.sent();

        b.server(ServerMessage::HostAssigned { host_id: "a".into() }).await;
        assert!(!b.client.roster().is_privileged());
        b
    }

    #[tokio::test]
    async fn test_stop_after_host_failover_clears_indicator() {
        let mut b = recording_host_demoted().await;

        b.client.handle_command(ClientCommand::StopRecording).await;
        assert_eq!(b.client.recording().state(), RecordingState::Idle);
        assert!(stop_record_sent(&b.sent()));
    }

    #[tokio::test]
    async fn test_capture_end_after_host_failover_clears_indicator() {
        let mut b = recording_host_demoted().await;

        b.capture.end_externally();
        b.pump_events().await;
        assert_eq!(b.client.recording().state(), RecordingState::Idle);
        assert!(stop_record_sent(&b.sent()));
    }

    #[tokio::test]
    async fn test_teardown_after_host_failover_clears_indicator() {
        let mut b = recording_host_demoted().await;

        b.client
            .teardown(TeardownReason::Kicked { reason: None })
            .await;
        assert_eq!(b.client.recording().state(), RecordingState::Idle);
        assert!(stop_record_sent(&b.sent()));
    }

    #[tokio::test]
    async fn test_capture_ended_out_of_band_broadcasts_stop() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.client.handle_command(ClientCommand::StartRecording).await;
        a.sent();

        a.capture.end_externally();
        a.pump_events().await;

        assert_eq!(a.client.recording().state(), RecordingState::Idle);
        assert!(a.sent().iter().any(|m| matches!(
            m,
            ClientMessage::HostCommand {
                cmd: HostCommand::StopRecord,
                ..
            }
        )));
        assert!(a.notices().iter().any(|n| matches!(n, Notice::RecordingSaved(_))));
    }

    // Scenario 4: late joiner sees chat disabled from the join-time snapshot
    #[tokio::test]
    async fn test_late_joiner_chat_gate_scenario() {
        let mut d = joined("u-d", "d", meeting(&["a", "b", "d"], Some("a"), false)).await;

        d.client
            .handle_command(ClientCommand::Chat {
                text: "hello".into(),
                to: None,
            })
            .await;
        assert!(d.sent().is_empty());
        assert!(d.notices().iter().any(|n| matches!(
            n,
            Notice::Failed {
                kind: ErrorKind::Chat,
                ..
            }
        )));

        d.server(ServerMessage::ChatToggled { enabled: true }).await;
        d.client
            .handle_command(ClientCommand::Chat {
                text: "hello".into(),
                to: None,
            })
            .await;
        assert_eq!(
            d.sent(),
            vec![ClientMessage::Chat {
                to: None,
                text: "hello".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_chat_history_and_dedupe() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        let message = ChatMessage {
            id: "1".into(),
            from: "u-b".into(),
            from_name: "B".into(),
            to: None,
            text: "hi".into(),
            created_at: None,
        };
        a.server(ServerMessage::ChatHistory {
            messages: vec![message.clone()],
        })
        .await;
        a.server(ServerMessage::Chat { message }).await;
        assert_eq!(a.client.chat().messages().len(), 1);

        a.server(ServerMessage::MessageDeleted { id: "1".into() }).await;
        assert!(a.client.chat().messages().is_empty());
    }

    // Scenario 5: host fails over from A to B
    #[tokio::test]
    async fn test_host_failover_scenario() {
        let roster = RosterUpdate {
            owner_id: Some("u-owner".to_string()),
            ..meeting(&["a", "b", "c"], Some("a"), true)
        };
        let mut b = joined("u-b", "b", roster).await;
        assert!(!b.client.roster().is_privileged());

        b.server(ServerMessage::PeerLeft { id: "a".into() }).await;
        assert_eq!(b.client.roster().snapshot().host_connection_id, None);

        b.server(ServerMessage::HostAssigned { host_id: "b".into() }).await;
        assert!(b.client.roster().is_privileged());
        assert!(b
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::HostControls { unlocked: true })));

        // A reconnects with a fresh connection id and is no longer host
        let mut a = joined(
            "u-a",
            "a2",
            RosterUpdate {
                owner_id: Some("u-owner".to_string()),
                ..meeting(&["a2", "b", "c"], Some("b"), true)
            },
        )
        .await;
        assert!(!a.client.roster().is_privileged());
        a.client
            .handle_command(ClientCommand::Host {
                cmd: HostCommand::MuteEveryone,
                target: None,
            })
            .await;
        assert!(a.sent().is_empty());
    }

    #[tokio::test]
    async fn test_screen_share_swaps_video_on_every_peer() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.server(peer_join("b")).await;
        a.server(peer_join("c")).await;

        a.client.handle_command(ClientCommand::StartScreenShare).await;
        assert!(a.client.media().screen_share_active());
        for peer in ["b", "c"] {
            let link = a.connector.link(peer).unwrap();
            assert_eq!(link.video_track.lock().unwrap().as_deref(), Some("screen-0"));
        }

        // Source goes away on its own: camera comes back
        a.client
            .handle_mesh_event(MeshEvent::LocalSourceEnded {
                track_id: "screen-0".into(),
            })
            .await;
        assert!(!a.client.media().screen_share_active());
        let link = a.connector.link("b").unwrap();
        assert_eq!(link.video_track.lock().unwrap().as_deref(), Some("camera"));
    }

    #[tokio::test]
    async fn test_lost_camera_degrades_and_publishes_status() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        let camera = a.client.media().video().cloned().unwrap();

        a.client
            .handle_mesh_event(MeshEvent::LocalSourceEnded {
                track_id: "camera".into(),
            })
            .await;

        assert!(!camera.is_live());
        assert!(a.client.media().audio_on());
        assert_eq!(
            a.sent(),
            vec![ClientMessage::Status {
                audio_on: true,
                video_on: false
            }]
        );
        assert!(a
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::MediaDegraded { .. })));

        // A second end for the same device is ignored
        a.client
            .handle_mesh_event(MeshEvent::LocalSourceEnded {
                track_id: "camera".into(),
            })
            .await;
        assert!(a.sent().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_audio_publishes_status() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.client.handle_command(ClientCommand::ToggleAudio).await;
        assert_eq!(
            a.sent(),
            vec![ClientMessage::Status {
                audio_on: false,
                video_on: true
            }]
        );
    }

    #[tokio::test]
    async fn test_kick_tears_down_everything() {
        let mut b = joined("u-b", "b", meeting(&["a", "b"], Some("a"), true)).await;
        b.server(peer_join("c")).await;
        let camera = b.client.media().video().cloned().unwrap();

        let reason = b
            .server(ServerMessage::HostAction {
                cmd: HostAction::Kick,
                reason: Some("disruptive".into()),
            })
            .await
            .unwrap();
        assert_eq!(
            reason,
            TeardownReason::Kicked {
                reason: Some("disruptive".into())
            }
        );

        assert!(b.client.teardown(reason.clone()).await);
        assert!(!b.client.teardown(reason).await);

        assert_eq!(b.client.peers().count(), 0);
        assert!(b.connector.link("c").unwrap().is_closed());
        assert!(!camera.is_live());
        // Evicted clients do not send leave
        assert!(!b.sent().iter().any(|m| matches!(m, ClientMessage::Leave {})));
    }

    #[tokio::test]
    async fn test_meeting_deleted_only_for_this_meeting() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        assert!(a
            .server(ServerMessage::MeetingDeleted {
                meeting_id: "other".into()
            })
            .await
            .is_none());
        assert_eq!(
            a.server(ServerMessage::MeetingDeleted { meeting_id: "M".into() })
                .await,
            Some(TeardownReason::MeetingDeleted)
        );
    }

    #[tokio::test]
    async fn test_leave_sends_leave_and_finishes_recording() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.client.handle_command(ClientCommand::StartRecording).await;
        a.sent();

        let reason = a.client.handle_command(ClientCommand::Leave).await.unwrap();
        a.client.teardown(reason).await;

        let sent = a.sent();
        assert!(matches!(
            sent[0],
            ClientMessage::HostCommand {
                cmd: HostCommand::StopRecord,
                ..
            }
        ));
        assert_eq!(sent[1], ClientMessage::Leave {});
        assert_eq!(a.client.recording().state(), RecordingState::Idle);
        assert_eq!(a.capture.finished.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_coordinator_error_surfaces_as_notice() {
        let mut a = joined("u-a", "a", meeting(&["a"], Some("a"), true)).await;
        a.server(ServerMessage::Error {
            message: "target not found".into(),
        })
        .await;
        assert!(a.notices().iter().any(|n| matches!(
            n,
            Notice::Failed { message, .. } if message.contains("target not found")
        )));
    }

    #[tokio::test]
    async fn test_run_ends_on_transport_loss() {
        let h = harness_with("u-a", FakeDevices::default());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (_view_tx, view_rx) = oneshot::channel();

        let task = tokio::spawn(h.client.run(inbound_rx, command_rx, view_rx));
        inbound_tx
            .send(ServerMessage::Connected { id: "a".into() })
            .unwrap();
        drop(inbound_tx);

        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, TeardownReason::TransportLost);
    }

    #[tokio::test]
    async fn test_run_ends_when_view_closes() {
        let mut h = harness_with("u-a", FakeDevices::default());
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = oneshot::channel();

        let task = tokio::spawn(h.client.run(inbound_rx, command_rx, view_rx));
        view_tx.send(()).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, TeardownReason::ViewClosed);

        let mut saw_join = false;
        while let Ok(message) = h.outbound.try_recv() {
            saw_join |= matches!(message, ClientMessage::Join { .. });
            assert_ne!(message, ClientMessage::Leave {});
        }
        assert!(saw_join);
    }

    #[tokio::test]
    async fn test_run_leave_command() {
        let mut h = harness_with("u-a", FakeDevices::default());
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (_view_tx, view_rx) = oneshot::channel();

        let task = tokio::spawn(h.client.run(inbound_rx, command_rx, view_rx));
        command_tx.send(ClientCommand::Leave).unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, TeardownReason::Left);

        let mut saw_leave = false;
        while let Ok(message) = h.outbound.try_recv() {
            saw_leave |= message == ClientMessage::Leave {};
        }
        assert!(saw_leave);

        let mut ended = false;
        while let Ok(notice) = h.notices.try_recv() {
            ended |= matches!(notice, Notice::Ended(TeardownReason::Left));
        }
        assert!(ended);
    }
}
