use std::collections::HashMap;
use std::sync::Arc;

use super::connection::{PeerConnectionState, PeerConnector, PeerLink, RemoteTrackInfo};
use super::roster::MeetingSnapshot;
use super::signaling::{ClientMessage, IceCandidate, SignalData, SignalingSender};
use super::MeshEventSender;
use crate::error::{MeetError, Result};
use crate::media::LocalTrack;

/// Upper bound on candidates held for a peer that has no usable connection yet
const MAX_PENDING_ICE: usize = 64;

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    generation: u64,
    state: PeerConnectionState,
    remote_tracks: Vec<RemoteTrackInfo>,
}

/// Owns one connection per remote participant and drives offer/answer/ICE
pub struct PeerManager {
    connector: Arc<dyn PeerConnector>,
    signaling: SignalingSender,
    events: MeshEventSender,
    peers: HashMap<String, PeerEntry>,
    pending_ice: HashMap<String, Vec<IceCandidate>>,
    next_generation: u64,
}

impl PeerManager {
    pub fn new(connector: Arc<dyn PeerConnector>, signaling: SignalingSender, events: MeshEventSender) -> Self {
        Self {
            connector,
            signaling,
            events,
            peers: HashMap::new(),
            pending_ice: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn state(&self, peer_id: &str) -> Option<PeerConnectionState> {
        self.peers.get(peer_id).map(|p| p.state)
    }

    pub fn remote_tracks(&self, peer_id: &str) -> Vec<RemoteTrackInfo> {
        self.peers
            .get(peer_id)
            .map(|p| p.remote_tracks.clone())
            .unwrap_or_default()
    }

    pub fn pending_ice_count(&self, peer_id: &str) -> usize {
        self.pending_ice.get(peer_id).map(Vec::len).unwrap_or(0)
    }

    /// Whether `generation` is the live connection for `peer_id`
    pub fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.peers
            .get(peer_id)
            .map(|p| p.generation == generation)
            .unwrap_or(false)
    }

    async fn create_connection(&mut self, peer_id: &str, tracks: &[Arc<LocalTrack>]) -> Result<Arc<dyn PeerLink>> {
        if self.peers.contains_key(peer_id) {
            return Err(MeetError::PeerAlreadyExists(peer_id.to_string()));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let link = self
            .connector
            .connect(peer_id, generation, tracks, self.events.clone())
            .await?;

        self.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                link: link.clone(),
                generation,
                state: PeerConnectionState::New,
                remote_tracks: Vec::new(),
            },
        );

        tracing::info!(
            peer_id = %peer_id,
            generation = generation,
            tracks = tracks.len(),
            "Peer connection created"
        );
        Ok(link)
    }

    fn send_signal(&self, peer_id: &str, data: SignalData) -> Result<()> {
        let kind = data.kind();
        self.signaling.send(ClientMessage::Signal {
            to: peer_id.to_string(),
            data,
        })?;
        tracing::debug!(peer_id = %peer_id, kind = kind, "Signal sent");
        Ok(())
    }

    /// A new participant joined: we are the offering side.
    ///
    /// Returns false when a connection to `peer_id` already exists.
    pub async fn on_peer_join(&mut self, peer_id: &str, tracks: &[Arc<LocalTrack>]) -> Result<bool> {
        if self.peers.contains_key(peer_id) {
            tracing::warn!(peer_id = %peer_id, "Peer already connected, ignoring duplicate join");
            return Ok(false);
        }

        let link = match self.create_connection(peer_id, tracks).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(peer_id = %peer_id, error = %e, "Failed to create peer connection");
                return Err(e);
            }
        };

        let offer = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.drop_failed(peer_id, &e).await;
                return Err(e);
            }
        };

        // An offer that never left would leave a connection no later join can renegotiate
        if let Err(e) = self.send_signal(peer_id, SignalData::Offer { sdp: offer }) {
            self.drop_failed(peer_id, &e).await;
            return Err(e);
        }
        tracing::info!(peer_id = %peer_id, "Sent offer to new peer");
        Ok(true)
    }

    /// Dispatch a relayed signal. Negotiation failures drop the peer and are not returned.
    pub async fn on_signal(&mut self, from: &str, data: SignalData, tracks: &[Arc<LocalTrack>]) -> Result<()> {
        match data {
            SignalData::Offer { sdp } => self.handle_offer(from, &sdp, tracks).await,
            SignalData::Answer { sdp } => self.handle_answer(from, &sdp).await,
            SignalData::Ice(candidate) => self.handle_ice_candidate(from, candidate).await,
        }
    }

    async fn handle_offer(&mut self, from: &str, sdp: &str, tracks: &[Arc<LocalTrack>]) -> Result<()> {
        let link = match self.peers.get(from) {
            Some(entry) => entry.link.clone(),
            None => match self.create_connection(from, tracks).await {
                Ok(link) => link,
                Err(e) => {
                    tracing::warn!(peer_id = %from, error = %e, "Cannot answer offer, no connection");
                    self.pending_ice.remove(from);
                    return Ok(());
                }
            },
        };

        let answer = match link.accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                self.drop_failed(from, &e).await;
                return Ok(());
            }
        };

        if let Err(e) = self.send_signal(from, SignalData::Answer { sdp: answer }) {
            self.drop_failed(from, &e).await;
            return Err(e);
        }
        tracing::info!(peer_id = %from, "Answered offer from peer");

        self.flush_pending_ice_candidates(from, &link).await;
        Ok(())
    }

    async fn handle_answer(&mut self, from: &str, sdp: &str) -> Result<()> {
        let Some(link) = self.peers.get(from).map(|p| p.link.clone()) else {
            tracing::debug!(peer_id = %from, "Answer for unknown peer ignored");
            return Ok(());
        };

        if let Err(e) = link.accept_answer(sdp).await {
            self.drop_failed(from, &e).await;
            return Ok(());
        }
        tracing::info!(peer_id = %from, "Processed answer from peer");

        // Flush any queued ICE candidates now that remote description is set
        self.flush_pending_ice_candidates(from, &link).await;
        Ok(())
    }

    async fn handle_ice_candidate(&mut self, from: &str, candidate: IceCandidate) -> Result<()> {
        let link = self.peers.get(from).map(|p| p.link.clone());

        let ready = match &link {
            Some(link) => link.has_remote_description().await,
            None => false,
        };

        if !ready {
            let queue = self.pending_ice.entry(from.to_string()).or_default();
            if queue.len() >= MAX_PENDING_ICE {
                tracing::warn!(peer_id = %from, "Pending ICE queue full, dropping candidate");
                return Ok(());
            }
            queue.push(candidate);
            tracing::debug!(
                peer_id = %from,
                queue_size = queue.len(),
                "ICE candidate queued"
            );
            return Ok(());
        }

        if let Some(link) = link {
            // A single bad candidate does not fail the connection
            if let Err(e) = link.add_ice_candidate(candidate).await {
                tracing::warn!(peer_id = %from, error = %e, "Failed to add ICE candidate");
            } else {
                tracing::debug!(peer_id = %from, "Added ICE candidate from peer");
            }
        }
        Ok(())
    }

    async fn flush_pending_ice_candidates(&mut self, peer_id: &str, link: &Arc<dyn PeerLink>) {
        let Some(candidates) = self.pending_ice.remove(peer_id) else {
            return;
        };

        tracing::info!(
            peer_id = %peer_id,
            count = candidates.len(),
            "Flushing queued ICE candidates"
        );

        for candidate in candidates {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                tracing::warn!(peer_id = %peer_id, error = %e, "Failed to add queued ICE candidate");
            }
        }
    }

    /// Forward a locally gathered candidate, unless it belongs to a replaced connection
    pub fn on_local_candidate(&self, peer_id: &str, generation: u64, candidate: IceCandidate) -> Result<()> {
        if !self.is_current(peer_id, generation) {
            tracing::debug!(peer_id = %peer_id, generation = generation, "Stale local ICE candidate dropped");
            return Ok(());
        }
        self.send_signal(peer_id, SignalData::Ice(candidate))
    }

    /// Forget early candidates from senders that are neither connected nor in the
    /// roster. Returns how many senders were discarded.
    pub fn prune_pending_ice(&mut self, snapshot: &MeetingSnapshot) -> usize {
        let before = self.pending_ice.len();
        let peers = &self.peers;
        self.pending_ice
            .retain(|peer_id, _| peers.contains_key(peer_id) || snapshot.has_connection(peer_id));
        let pruned = before - self.pending_ice.len();
        if pruned > 0 {
            tracing::debug!(pruned = pruned, "Discarded ICE buffers of absent senders");
        }
        pruned
    }

    /// Close and forget the connection; returns true if one existed
    pub async fn on_peer_left(&mut self, peer_id: &str) -> bool {
        self.pending_ice.remove(peer_id);

        let Some(entry) = self.peers.remove(peer_id) else {
            return false;
        };

        entry.link.close().await;
        tracing::info!(
            peer_id = %peer_id,
            remote_tracks = entry.remote_tracks.len(),
            remaining = self.peers.len(),
            "Peer connection removed"
        );
        true
    }

    /// Returns true when the transition removed the peer
    pub async fn on_connection_state(&mut self, peer_id: &str, generation: u64, state: PeerConnectionState) -> bool {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return false;
        };
        if entry.generation != generation {
            tracing::debug!(peer_id = %peer_id, generation = generation, "State change for replaced connection ignored");
            return false;
        }

        entry.state = state;
        if state.is_terminal() {
            tracing::info!(peer_id = %peer_id, state = %state, "Peer connection ended, cleaning up");
            return self.on_peer_left(peer_id).await;
        }
        false
    }

    pub fn on_remote_track(&mut self, peer_id: &str, generation: u64, track: RemoteTrackInfo) {
        match self.peers.get_mut(peer_id) {
            Some(entry) if entry.generation == generation => {
                tracing::info!(
                    peer_id = %peer_id,
                    track_id = %track.track_id,
                    kind = %track.kind,
                    "Remote track received"
                );
                if !entry.remote_tracks.contains(&track) {
                    entry.remote_tracks.push(track);
                }
            }
            _ => {
                tracing::debug!(peer_id = %peer_id, "Remote track for unknown connection ignored");
            }
        }
    }

    /// Swap the outgoing video on every connection (screen share on/off)
    pub async fn replace_video_track(&self, track: Arc<LocalTrack>) {
        for (peer_id, entry) in &self.peers {
            if let Err(e) = entry.link.replace_video_track(track.clone()).await {
                tracing::warn!(peer_id = %peer_id, error = %e, "Failed to replace video track");
            }
        }
    }

    /// Close every connection; cancels in-flight negotiations
    pub async fn close_all(&mut self) -> usize {
        self.pending_ice.clear();
        let peers: Vec<(String, PeerEntry)> = self.peers.drain().collect();
        let count = peers.len();
        for (peer_id, entry) in peers {
            tracing::debug!(peer_id = %peer_id, "Closing peer connection on teardown");
            entry.link.close().await;
        }
        count
    }

    async fn drop_failed(&mut self, peer_id: &str, error: &MeetError) {
        tracing::warn!(peer_id = %peer_id, error = %error, "Negotiation failed, dropping peer");
        self.on_peer_left(peer_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::mesh::testing::FakeConnector;
    use tokio::sync::mpsc;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn manager() -> (PeerManager, Arc<FakeConnector>, mpsc::UnboundedReceiver<ClientMessage>) {
        let connector = FakeConnector::new();
        let (signaling, rx) = SignalingSender::channel();
        let (events, _events_rx) = mpsc::unbounded_channel();
        (PeerManager::new(connector.clone(), signaling, events), connector, rx)
    }

    fn tracks() -> Vec<Arc<LocalTrack>> {
        vec![
            LocalTrack::detached(MediaKind::Audio, "mic"),
            LocalTrack::detached(MediaKind::Video, "cam"),
        ]
    }

    #[tokio::test]
    async fn test_peer_join_sends_offer() {
        let (mut peers, connector, mut rx) = manager();

        assert!(peers.on_peer_join("b", &tracks()).await.unwrap());

        assert_eq!(peers.count(), 1);
        let link = connector.link("b").unwrap();
        assert_eq!(link.attached, vec!["mic", "cam"]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::Signal {
                to: "b".to_string(),
                data: SignalData::Offer {
                    sdp: "offer-sdp-b".to_string()
                }
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_join_is_idempotent() {
        let (mut peers, connector, mut rx) = manager();

        assert!(peers.on_peer_join("b", &tracks()).await.unwrap());
        assert!(!peers.on_peer_join("b", &tracks()).await.unwrap());

        assert_eq!(peers.count(), 1);
        assert_eq!(connector.created(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_from_unknown_peer_creates_and_answers() {
        let (mut peers, connector, mut rx) = manager();

        peers
            .on_signal("c", SignalData::Offer { sdp: "remote-offer".into() }, &tracks())
            .await
            .unwrap();

        assert!(peers.contains("c"));
        let link = connector.link("c").unwrap();
        assert_eq!(link.calls(), vec!["accept_offer:remote-offer"]);
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::Signal {
                to: "c".to_string(),
                data: SignalData::Answer {
                    sdp: "answer-sdp-c".to_string()
                }
            }
        );
    }

    #[tokio::test]
    async fn test_answer_sets_remote_description() {
        let (mut peers, connector, _rx) = manager();
        peers.on_peer_join("b", &tracks()).await.unwrap();

        peers
            .on_signal("b", SignalData::Answer { sdp: "remote-answer".into() }, &[])
            .await
            .unwrap();

        let link = connector.link("b").unwrap();
        assert_eq!(link.calls(), vec!["create_offer", "accept_answer:remote-answer"]);
    }

    #[tokio::test]
    async fn test_answer_for_unknown_peer_is_ignored() {
        let (mut peers, connector, _rx) = manager();
        peers
            .on_signal("zz", SignalData::Answer { sdp: "x".into() }, &[])
            .await
            .unwrap();
        assert_eq!(peers.count(), 0);
        assert_eq!(connector.created(), 0);
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered_then_flushed() {
        let (mut peers, connector, _rx) = manager();

        // Candidates before any connection exists
        peers.on_signal("c", SignalData::Ice(candidate(1)), &[]).await.unwrap();
        peers.on_signal("c", SignalData::Ice(candidate(2)), &[]).await.unwrap();
        assert_eq!(peers.pending_ice_count("c"), 2);
        assert_eq!(peers.count(), 0);

        peers
            .on_signal("c", SignalData::Offer { sdp: "o".into() }, &tracks())
            .await
            .unwrap();

        let link = connector.link("c").unwrap();
        assert_eq!(link.candidate_count(), 2);
        assert_eq!(link.candidates.lock().unwrap()[0], candidate(1));
        assert_eq!(peers.pending_ice_count("c"), 0);

        // Later candidates go straight through
        peers.on_signal("c", SignalData::Ice(candidate(3)), &[]).await.unwrap();
        assert_eq!(link.candidate_count(), 3);
    }

    #[tokio::test]
    async fn test_candidates_wait_for_answer_on_offering_side() {
        let (mut peers, connector, _rx) = manager();
        peers.on_peer_join("b", &tracks()).await.unwrap();

        peers.on_signal("b", SignalData::Ice(candidate(1)), &[]).await.unwrap();
        let link = connector.link("b").unwrap();
        assert_eq!(link.candidate_count(), 0);
        assert_eq!(peers.pending_ice_count("b"), 1);

        peers
            .on_signal("b", SignalData::Answer { sdp: "a".into() }, &[])
            .await
            .unwrap();
        assert_eq!(link.candidate_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_candidates_are_bounded() {
        let (mut peers, _connector, _rx) = manager();
        for n in 0..(MAX_PENDING_ICE as u16 + 10) {
            peers.on_signal("x", SignalData::Ice(candidate(n)), &[]).await.unwrap();
        }
        assert_eq!(peers.pending_ice_count("x"), MAX_PENDING_ICE);
    }

    #[tokio::test]
    async fn test_peer_left_closes_and_discards_buffer() {
        let (mut peers, connector, _rx) = manager();
        peers.on_peer_join("b", &tracks()).await.unwrap();
        peers.on_signal("b", SignalData::Ice(candidate(1)), &[]).await.unwrap();

        assert!(peers.on_peer_left("b").await);
        assert!(!peers.on_peer_left("b").await);

        assert_eq!(peers.count(), 0);
        assert_eq!(peers.pending_ice_count("b"), 0);
        assert!(connector.link("b").unwrap().is_closed());
    }

    fn disconnected_manager() -> (PeerManager, Arc<FakeConnector>) {
        let connector = FakeConnector::new();
        let (signaling, _rx) = SignalingSender::channel();
        signaling.disconnect();
        let (events, _events_rx) = mpsc::unbounded_channel();
        (PeerManager::new(connector.clone(), signaling, events), connector)
    }

    #[tokio::test]
    async fn test_unsent_offer_drops_connection() {
        let (mut peers, connector) = disconnected_manager();

        let err = peers.on_peer_join("b", &tracks()).await.unwrap_err();
        assert!(matches!(err, MeetError::NotConnected));
        assert_eq!(peers.count(), 0);
        assert!(connector.link("b").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_unsent_answer_drops_connection() {
        let (mut peers, connector) = disconnected_manager();

        let result = peers
            .on_signal("b", SignalData::Offer { sdp: "offer".into() }, &tracks())
            .await;
        assert!(result.is_err());
        assert!(!peers.contains("b"));
        assert!(connector.link("b").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_roster_prunes_buffers_of_absent_senders() {
        use crate::mesh::roster::{Participant, Roster, RosterUpdate};

        let (mut peers, _connector, _rx) = manager();
        peers.on_peer_join("c", &tracks()).await.unwrap();
        peers.on_signal("c", SignalData::Ice(candidate(1)), &[]).await.unwrap();
        peers.on_signal("b", SignalData::Ice(candidate(2)), &[]).await.unwrap();
        peers.on_signal("ghost", SignalData::Ice(candidate(3)), &[]).await.unwrap();

        let mut roster = Roster::new("m-1", "u-a");
        let snapshot = roster.apply_snapshot(RosterUpdate {
            participants: vec![Participant {
                user_key: "u-b".to_string(),
                sockets: std::iter::once("b".to_string()).collect(),
                display_name: "B".to_string(),
                role: "student".to_string(),
                audio_on: true,
                video_on: true,
                banned: false,
            }],
            total: 1,
            host: None,
            owner_id: None,
            chat_enabled: true,
            recording: false,
        });

        assert_eq!(peers.prune_pending_ice(&snapshot), 1);
        assert_eq!(peers.pending_ice_count("ghost"), 0);
        assert_eq!(peers.pending_ice_count("b"), 1);
        assert_eq!(peers.pending_ice_count("c"), 1);
    }

    #[tokio::test]
    async fn test_failed_state_removes_peer() {
        let (mut peers, connector, _rx) = manager();
        peers.on_peer_join("b", &tracks()).await.unwrap();
        let generation = connector.link("b").unwrap().generation;

        assert!(!peers
            .on_connection_state("b", generation, PeerConnectionState::Connected)
            .await);
        assert_eq!(peers.state("b"), Some(PeerConnectionState::Connected));

        assert!(peers
            .on_connection_state("b", generation, PeerConnectionState::Failed)
            .await);
        assert!(!peers.contains("b"));
    }

    #[tokio::test]
    async fn test_stale_state_event_does_not_remove_new_connection() {
        let (mut peers, connector, _rx) = manager();
        peers.on_peer_join("b", &tracks()).await.unwrap();
        let old_generation = connector.link("b").unwrap().generation;
        peers.on_peer_left("b").await;

        peers.on_peer_join("b", &tracks()).await.unwrap();
        assert!(!peers
            .on_connection_state("b", old_generation, PeerConnectionState::Closed)
            .await);
        assert!(peers.contains("b"));
    }

    #[tokio::test]
    async fn test_negotiation_failure_drops_peer_silently() {
        let (mut peers, connector, mut rx) = manager();
        connector.fail_negotiation_with("c");

        let result = peers
            .on_signal("c", SignalData::Offer { sdp: "o".into() }, &tracks())
            .await;

        assert!(result.is_ok());
        assert!(!peers.contains("c"));
        assert!(connector.link("c").unwrap().is_closed());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_candidates_from_stale_generation_are_dropped() {
        let (mut peers, connector, mut rx) = manager();
        peers.on_peer_join("b", &tracks()).await.unwrap();
        let _offer = rx.try_recv().unwrap();
        let generation = connector.link("b").unwrap().generation;

        peers.on_local_candidate("b", generation + 1, candidate(1)).unwrap();
        assert!(rx.try_recv().is_err());

        peers.on_local_candidate("b", generation, candidate(1)).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::Signal {
                to: "b".to_string(),
                data: SignalData::Ice(candidate(1))
            }
        );
    }

    #[tokio::test]
    async fn test_remote_tracks_are_released_with_peer() {
        let (mut peers, connector, _rx) = manager();
        peers.on_peer_join("b", &tracks()).await.unwrap();
        let generation = connector.link("b").unwrap().generation;
        let track = RemoteTrackInfo {
            track_id: "t1".to_string(),
            stream_id: "s1".to_string(),
            kind: MediaKind::Video,
        };

        peers.on_remote_track("b", generation, track.clone());
        peers.on_remote_track("b", generation, track.clone());
        assert_eq!(peers.remote_tracks("b"), vec![track]);

        peers.on_peer_left("b").await;
        assert!(peers.remote_tracks("b").is_empty());
    }

    #[tokio::test]
    async fn test_connection_count_matches_joined_peers() {
        let (mut peers, _connector, _rx) = manager();
        let script: &[(&str, bool)] = &[
            ("b", true),
            ("c", true),
            ("b", true),
            ("d", true),
            ("c", false),
            ("c", false),
            ("e", true),
            ("b", false),
            ("c", true),
        ];

        let mut joined = std::collections::HashSet::new();
        for (peer, join) in script {
            if *join {
                peers.on_peer_join(peer, &tracks()).await.unwrap();
                joined.insert(*peer);
            } else {
                peers.on_peer_left(peer).await;
                joined.remove(peer);
            }
            assert_eq!(peers.count(), joined.len());
        }
    }

    #[tokio::test]
    async fn test_close_all() {
        let (mut peers, connector, _rx) = manager();
        peers.on_peer_join("b", &tracks()).await.unwrap();
        peers.on_peer_join("c", &tracks()).await.unwrap();

        assert_eq!(peers.close_all().await, 2);
        assert_eq!(peers.count(), 0);
        assert!(connector.link("b").unwrap().is_closed());
        assert!(connector.link("c").unwrap().is_closed());
    }
}
