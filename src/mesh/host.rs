use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::roster::Roster;
use super::signaling::{ClientMessage, SignalingSender};
use crate::error::{MeetError, Result};
use crate::media::LocalStream;

/// Privileged commands a host or owner may issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostCommand {
    MuteUser,
    UnmuteUser,
    EnableCameraUser,
    DisableCameraUser,
    Kick,
    BanUser,
    MuteEveryone,
    StartRecord,
    StopRecord,
    EnableChat,
    DisableChat,
}

impl HostCommand {
    pub const ALL: [HostCommand; 11] = [
        HostCommand::MuteUser,
        HostCommand::UnmuteUser,
        HostCommand::EnableCameraUser,
        HostCommand::DisableCameraUser,
        HostCommand::Kick,
        HostCommand::BanUser,
        HostCommand::MuteEveryone,
        HostCommand::StartRecord,
        HostCommand::StopRecord,
        HostCommand::EnableChat,
        HostCommand::DisableChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HostCommand::MuteUser => "mute-user",
            HostCommand::UnmuteUser => "unmute-user",
            HostCommand::EnableCameraUser => "enable-camera-user",
            HostCommand::DisableCameraUser => "disable-camera-user",
            HostCommand::Kick => "kick",
            HostCommand::BanUser => "ban-user",
            HostCommand::MuteEveryone => "mute-everyone",
            HostCommand::StartRecord => "start-record",
            HostCommand::StopRecord => "stop-record",
            HostCommand::EnableChat => "enable-chat",
            HostCommand::DisableChat => "disable-chat",
        }
    }

    /// Commands aimed at a single participant need a target connection id
    pub fn requires_target(&self) -> bool {
        matches!(
            self,
            HostCommand::MuteUser
                | HostCommand::UnmuteUser
                | HostCommand::EnableCameraUser
                | HostCommand::DisableCameraUser
                | HostCommand::Kick
                | HostCommand::BanUser
        )
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostCommand {
    type Err = MeetError;

    fn from_str(s: &str) -> Result<Self> {
        HostCommand::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| MeetError::InvalidCommand(s.to_string()))
    }
}

/// Personal effect delivered to the targeted client in a `host-action` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostAction {
    Mute,
    Unmute,
    EnableCamera,
    DisableCamera,
    Kick,
    Ban,
}

/// Outcome of a dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    /// Signaling channel was down; nothing is queued
    Dropped,
}

/// What the session must do after a host action was applied locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEffect {
    MediaChanged { audio_on: bool, video_on: bool },
    Evicted { banned: bool, reason: Option<String> },
}

pub struct HostDispatcher {
    meeting_id: String,
    signaling: SignalingSender,
}

impl HostDispatcher {
    pub fn new(meeting_id: &str, signaling: SignalingSender) -> Self {
        Self {
            meeting_id: meeting_id.to_string(),
            signaling,
        }
    }

    /// Send a privileged command. The local privilege check only hides controls; the
    /// coordinator enforces the real rule.
    pub fn issue(&self, roster: &Roster, cmd: HostCommand, target: Option<&str>) -> Result<Dispatch> {
        if !roster.is_privileged() {
            tracing::warn!(cmd = %cmd, "Rejected host command from non-privileged client");
            return Err(MeetError::Unauthorized(cmd.to_string()));
        }

        let target = target.map(str::trim).filter(|t| !t.is_empty());
        if cmd.requires_target() && target.is_none() {
            return Err(MeetError::InvalidCommand(format!("{} requires a target", cmd)));
        }

        self.send(cmd, target)
    }

    /// Clear the shared indicator for this device's own capture. Sent whether or not
    /// this client still holds host privilege.
    pub fn release_recording(&self) -> Result<Dispatch> {
        self.send(HostCommand::StopRecord, None)
    }

    fn send(&self, cmd: HostCommand, target: Option<&str>) -> Result<Dispatch> {
        if !self.signaling.is_connected() {
            tracing::warn!(cmd = %cmd, "Signaling disconnected, host command dropped");
            return Ok(Dispatch::Dropped);
        }

        let message = ClientMessage::HostCommand {
            meeting_id: self.meeting_id.clone(),
            cmd,
            target: target.map(str::to_string),
        };

        match self.signaling.send(message) {
            Ok(()) => {
                tracing::info!(cmd = %cmd, target = ?target, "Host command sent");
                Ok(Dispatch::Sent)
            }
            Err(MeetError::NotConnected) => {
                tracing::warn!(cmd = %cmd, "Signaling closed while sending host command");
                Ok(Dispatch::Dropped)
            }
            Err(e) => Err(e),
        }
    }
}

/// Apply a host action to this client's own media
pub fn apply_host_action(action: HostAction, reason: Option<String>, media: &LocalStream) -> LocalEffect {
    tracing::info!(action = ?action, reason = ?reason, "Applying host action");

    match action {
        HostAction::Mute => media.set_audio_enabled(false),
        HostAction::Unmute => media.set_audio_enabled(true),
        HostAction::EnableCamera => media.set_video_enabled(true),
        HostAction::DisableCamera => media.set_video_enabled(false),
        HostAction::Kick => {
            return LocalEffect::Evicted {
                banned: false,
                reason,
            }
        }
        HostAction::Ban => {
            return LocalEffect::Evicted {
                banned: true,
                reason,
            }
        }
    }

    LocalEffect::MediaChanged {
        audio_on: media.audio_on(),
        video_on: media.video_on(),
    }
}
