use serde::{Deserialize, Serialize};
use std::fmt;

/// Local capture lifecycle: Idle -> Capturing -> Stopping -> Idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    Idle,
    Capturing,
    Stopping,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RecordingState {
    pub fn is_active(&self) -> bool {
        !matches!(self, RecordingState::Idle)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::Idle => "idle",
            RecordingState::Capturing => "capturing",
            RecordingState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}
