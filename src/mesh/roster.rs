use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_key: String,
    /// One entry per open tab/device of this user
    #[serde(default)]
    pub sockets: BTreeSet<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub audio_on: bool,
    #[serde(default)]
    pub video_on: bool,
    #[serde(default)]
    pub banned: bool,
}

/// Body of an inbound `participants` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterUpdate {
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default = "default_true")]
    pub chat_enabled: bool,
    #[serde(default)]
    pub recording: bool,
}

/// Immutable meeting-wide state. Every change produces a new snapshot with a higher revision.
#[derive(Debug, Clone, PartialEq)]
pub struct MeetingSnapshot {
    pub revision: u64,
    pub meeting_id: String,
    pub owner_id: Option<String>,
    pub host_connection_id: Option<String>,
    pub chat_enabled: bool,
    pub recording: bool,
    pub recording_by: Option<String>,
    pub total: usize,
    pub participants: Vec<Participant>,
}

impl MeetingSnapshot {
    fn empty(meeting_id: &str) -> Self {
        Self {
            revision: 0,
            meeting_id: meeting_id.to_string(),
            owner_id: None,
            host_connection_id: None,
            chat_enabled: true,
            recording: false,
            recording_by: None,
            total: 0,
            participants: Vec::new(),
        }
    }

    pub fn has_connection(&self, connection_id: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.sockets.contains(connection_id))
    }

    pub fn participant_by_connection(&self, connection_id: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.sockets.contains(connection_id))
    }
}

/// Membership & role tracker: the single writer of the meeting snapshot
pub struct Roster {
    local_user_key: String,
    local_connection_id: Option<String>,
    snapshot: Arc<MeetingSnapshot>,
    joined: bool,
}

impl Roster {
    pub fn new(meeting_id: &str, local_user_key: &str) -> Self {
        Self {
            local_user_key: local_user_key.to_string(),
            local_connection_id: None,
            snapshot: Arc::new(MeetingSnapshot::empty(meeting_id)),
            joined: false,
        }
    }

    pub fn snapshot(&self) -> Arc<MeetingSnapshot> {
        self.snapshot.clone()
    }

    /// True once the first roster snapshot of the meeting has been applied
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn local_user_key(&self) -> &str {
        &self.local_user_key
    }

    pub fn local_connection_id(&self) -> Option<&str> {
        self.local_connection_id.as_deref()
    }

    pub fn set_local_connection(&mut self, connection_id: &str) {
        tracing::debug!(connection_id = %connection_id, "Local connection id assigned");
        self.local_connection_id = Some(connection_id.to_string());
    }

    fn replace(&mut self, next: MeetingSnapshot) -> Arc<MeetingSnapshot> {
        self.snapshot = Arc::new(next);
        self.snapshot.clone()
    }

    /// Host is only kept when it names a connection present in the roster
    fn validated_host(&self, participants: &[Participant], host: Option<String>) -> Option<String> {
        let host = host?;
        let present = participants.iter().any(|p| p.sockets.contains(&host))
            || self.local_connection_id.as_deref() == Some(host.as_str());
        if present {
            Some(host)
        } else {
            tracing::warn!(host = %host, "Host connection not in roster, clearing host");
            None
        }
    }

    /// Replace the whole roster with a fresh snapshot from the coordinator
    pub fn apply_snapshot(&mut self, update: RosterUpdate) -> Arc<MeetingSnapshot> {
        let current = self.snapshot.clone();
        let host_connection_id = self.validated_host(&update.participants, update.host);
        // `recording` events carry who is recording; a snapshot only carries the flag
        let recording_by = if update.recording {
            current.recording_by.clone()
        } else {
            None
        };

        let next = MeetingSnapshot {
            revision: current.revision + 1,
            meeting_id: current.meeting_id.clone(),
            owner_id: update.owner_id,
            host_connection_id,
            chat_enabled: update.chat_enabled,
            recording: update.recording,
            recording_by,
            total: update.total,
            participants: update.participants,
        };

        if !self.joined {
            self.joined = true;
            tracing::info!(meeting_id = %next.meeting_id, "Meeting state created from first roster");
        }

        tracing::debug!(
            revision = next.revision,
            participants = next.participants.len(),
            host = ?next.host_connection_id,
            chat_enabled = next.chat_enabled,
            recording = next.recording,
            "Roster snapshot applied"
        );
        self.replace(next)
    }

    pub fn is_host(&self) -> bool {
        match (&self.local_connection_id, &self.snapshot.host_connection_id) {
            (Some(local), Some(host)) => local == host,
            _ => false,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.snapshot.owner_id.as_deref() == Some(self.local_user_key.as_str())
    }

    /// Owner privilege is permanent; host privilege follows the current host assignment
    pub fn is_privileged(&self) -> bool {
        self.is_host() || self.is_owner()
    }

    /// Returns true when the local connection now holds host controls
    pub fn on_host_assigned(&mut self, host_id: &str) -> bool {
        let current = self.snapshot.clone();
        let host = self.validated_host(&current.participants, Some(host_id.to_string()));
        let next = MeetingSnapshot {
            revision: current.revision + 1,
            host_connection_id: host,
            ..(*current).clone()
        };
        self.replace(next);

        let is_host = self.is_host();
        tracing::info!(host_id = %host_id, local_is_host = is_host, "Host assigned");
        is_host
    }

    pub fn set_chat_enabled(&mut self, enabled: bool) -> Arc<MeetingSnapshot> {
        let current = self.snapshot.clone();
        let next = MeetingSnapshot {
            revision: current.revision + 1,
            chat_enabled: enabled,
            ..(*current).clone()
        };
        self.replace(next)
    }

    pub fn set_recording(&mut self, recording: bool, by: Option<String>) -> Arc<MeetingSnapshot> {
        let current = self.snapshot.clone();
        let next = MeetingSnapshot {
            revision: current.revision + 1,
            recording,
            recording_by: if recording { by } else { None },
            ..(*current).clone()
        };
        self.replace(next)
    }

    /// Derive a snapshot without the departed connection
    pub fn on_connection_left(&mut self, connection_id: &str) -> Arc<MeetingSnapshot> {
        let current = self.snapshot.clone();
        let participants: Vec<Participant> = current
            .participants
            .iter()
            .cloned()
            .filter_map(|mut p| {
                p.sockets.remove(connection_id);
                if p.sockets.is_empty() {
                    None
                } else {
                    Some(p)
                }
            })
            .collect();

        let host_connection_id = match &current.host_connection_id {
            Some(host) if host == connection_id => {
                tracing::info!(host = %host, "Host disconnected, host controls suspended");
                None
            }
            other => other.clone(),
        };

        let removed = current.participants.len() - participants.len();
        let next = MeetingSnapshot {
            revision: current.revision + 1,
            host_connection_id,
            total: current.total.saturating_sub(removed),
            participants,
            ..(*current).clone()
        };
        self.replace(next)
    }
}
