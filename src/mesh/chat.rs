use serde::{Deserialize, Serialize};

use super::roster::Roster;
use super::signaling::{ClientMessage, SignalingSender};
use crate::error::{MeetError, Result};

/// Longest chat text accepted locally
pub const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    /// Author's user key
    pub from: String,
    #[serde(default)]
    pub from_name: String,
    /// Recipient user key for a private message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ChatMessage {
    pub fn is_private(&self) -> bool {
        self.to.is_some()
    }
}

/// Meeting-scoped chat: gated sends, history replay, author-only deletes
pub struct ChatRelay {
    meeting_id: String,
    local_user_key: String,
    signaling: SignalingSender,
    messages: Vec<ChatMessage>,
}

impl ChatRelay {
    pub fn new(meeting_id: &str, local_user_key: &str, signaling: SignalingSender) -> Self {
        Self {
            meeting_id: meeting_id.to_string(),
            local_user_key: local_user_key.to_string(),
            signaling,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn send_message(&self, roster: &Roster, text: &str, to: Option<&str>) -> Result<()> {
        if !roster.snapshot().chat_enabled {
            tracing::debug!("Chat message rejected, chat disabled");
            return Err(MeetError::ChatDisabled);
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(MeetError::InvalidMessage("message is empty".to_string()));
        }
        if text.chars().count() > MAX_MESSAGE_LEN {
            return Err(MeetError::InvalidMessage(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_LEN
            )));
        }

        self.signaling.send(ClientMessage::Chat {
            to: to.map(str::to_string),
            text: text.to_string(),
        })?;
        tracing::debug!(private = to.is_some(), "Chat message sent");
        Ok(())
    }

    /// Join-time replay replaces whatever was held locally
    pub fn on_history(&mut self, messages: Vec<ChatMessage>) {
        tracing::info!(count = messages.len(), "Chat history received");
        self.messages = messages;
    }

    /// Returns false for a message already held (same id)
    pub fn on_message(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            tracing::debug!(message_id = %message.id, "Duplicate chat message ignored");
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn delete_message(&self, message_id: &str) -> Result<()> {
        let message = self
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| MeetError::MessageNotFound(message_id.to_string()))?;

        if message.from != self.local_user_key {
            return Err(MeetError::Unauthorized(format!(
                "cannot delete message {} from another participant",
                message_id
            )));
        }

        self.signaling.send(ClientMessage::DeleteMessage {
            meeting_id: self.meeting_id.clone(),
            message_id: message_id.to_string(),
        })
    }

    pub fn on_message_deleted(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != message_id);
        before != self.messages.len()
    }
}
