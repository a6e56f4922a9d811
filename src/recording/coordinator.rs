use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::state::RecordingState;
use crate::error::{MeetError, Result};
use crate::mesh::host::{Dispatch, HostCommand, HostDispatcher};
use crate::mesh::roster::{MeetingSnapshot, Roster};
use crate::mesh::MeshEventSender;

/// A running display+audio capture
#[async_trait]
pub trait CaptureSession: Send {
    /// Finalise the encoder, release the capture and return the written file
    async fn finish(&mut self) -> Result<PathBuf>;
}

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Start capturing into `output`. If the capture ends on its own, `events`
    /// receives `CaptureEnded` carrying `capture_id`.
    async fn start(
        &self,
        capture_id: u64,
        output: PathBuf,
        events: MeshEventSender,
    ) -> Result<Box<dyn CaptureSession>>;
}

/// A finished local recording; it stays on this device
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingArtifact {
    pub capture_id: u64,
    pub path: PathBuf,
    pub duration: Duration,
}

struct ActiveCapture {
    capture_id: u64,
    session: Box<dyn CaptureSession>,
    started_at: Instant,
}

pub struct RecordingCoordinator {
    backend: Arc<dyn CaptureBackend>,
    output_dir: PathBuf,
    state: RecordingState,
    active: Option<ActiveCapture>,
    next_capture_id: u64,
}

impl RecordingCoordinator {
    pub fn new(backend: Arc<dyn CaptureBackend>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            output_dir: output_dir.into(),
            state: RecordingState::Idle,
            active: None,
            next_capture_id: 1,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    fn output_path(&self, meeting_id: &str) -> Result<PathBuf> {
        let dir = self.output_dir.join(meeting_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            MeetError::RecordingPipeline(format!("Failed to create recording directory: {}", e))
        })?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        Ok(dir.join(format!("meeting_{}.webm", timestamp)))
    }

    pub async fn start_local_recording(
        &mut self,
        roster: &Roster,
        dispatcher: &HostDispatcher,
        events: MeshEventSender,
    ) -> Result<()> {
        if !roster.is_privileged() {
            return Err(MeetError::Unauthorized(HostCommand::StartRecord.to_string()));
        }
        if self.state != RecordingState::Idle {
            return Err(MeetError::RecordingInProgress);
        }

        let meeting_id = roster.snapshot().meeting_id.clone();
        let output = self.output_path(&meeting_id)?;
        let capture_id = self.next_capture_id;
        self.next_capture_id += 1;

        let session = self.backend.start(capture_id, output.clone(), events).await?;
        self.active = Some(ActiveCapture {
            capture_id,
            session,
            started_at: Instant::now(),
        });
        self.state = RecordingState::Capturing;

        tracing::info!(
            meeting_id = %meeting_id,
            capture_id = capture_id,
            output = %output.display(),
            "Local recording started"
        );

        broadcast(roster, dispatcher, HostCommand::StartRecord);
        Ok(())
    }

    /// Stopping needs no privilege: the capturing device always clears the indicator,
    /// even after host moved to another client.
    pub async fn stop_local_recording(&mut self, dispatcher: &HostDispatcher) -> Result<RecordingArtifact> {
        if self.state != RecordingState::Capturing {
            return Err(MeetError::NotRecording);
        }
        let artifact = self.finalize().await;
        announce_stopped(dispatcher);
        artifact
    }

    /// The capture ended without a stop request (source closed, pipeline error)
    pub async fn on_capture_ended(
        &mut self,
        capture_id: u64,
        error: Option<String>,
        dispatcher: &HostDispatcher,
    ) -> Option<Result<RecordingArtifact>> {
        let current = self.active.as_ref().map(|a| a.capture_id);
        if current != Some(capture_id) || self.state != RecordingState::Capturing {
            tracing::debug!(capture_id = capture_id, "Ended event for inactive capture ignored");
            return None;
        }

        tracing::warn!(capture_id = capture_id, error = ?error, "Capture ended externally, stopping recording");
        let artifact = self.finalize().await;
        announce_stopped(dispatcher);
        Some(artifact)
    }

    /// Finish any capture without broadcasting; used during teardown
    pub async fn shutdown(&mut self) -> Option<Result<RecordingArtifact>> {
        if self.active.is_none() {
            return None;
        }
        Some(self.finalize().await)
    }

    /// Shared indicator update, whoever is capturing
    pub fn on_remote_recording_state_change(
        &self,
        roster: &mut Roster,
        recording: bool,
        by: Option<String>,
    ) -> Arc<MeetingSnapshot> {
        tracing::info!(recording = recording, by = ?by, "Meeting recording indicator changed");
        roster.set_recording(recording, by)
    }

    /// Capturing -> Stopping -> Idle; always ends Idle
    async fn finalize(&mut self) -> Result<RecordingArtifact> {
        let Some(mut active) = self.active.take() else {
            self.state = RecordingState::Idle;
            return Err(MeetError::NotRecording);
        };

        self.state = RecordingState::Stopping;
        let result = active.session.finish().await;
        self.state = RecordingState::Idle;

        match result {
            Ok(path) => {
                let artifact = RecordingArtifact {
                    capture_id: active.capture_id,
                    path,
                    duration: active.started_at.elapsed(),
                };
                tracing::info!(
                    capture_id = artifact.capture_id,
                    path = %artifact.path.display(),
                    duration_secs = artifact.duration.as_secs(),
                    "Recording saved"
                );
                Ok(artifact)
            }
            Err(e) => {
                tracing::error!(capture_id = active.capture_id, error = %e, "Failed to finalise recording");
                Err(e)
            }
        }
    }
}

fn log_dispatch(cmd: HostCommand, result: Result<Dispatch>) {
    match result {
        Ok(Dispatch::Sent) => {}
        Ok(Dispatch::Dropped) => {
            tracing::warn!(cmd = %cmd, "Recording indicator not broadcast, signaling down");
        }
        Err(e) => {
            tracing::warn!(cmd = %cmd, error = %e, "Recording indicator not broadcast");
        }
    }
}

fn broadcast(roster: &Roster, dispatcher: &HostDispatcher, cmd: HostCommand) {
    log_dispatch(cmd, dispatcher.issue(roster, cmd, None));
}

fn announce_stopped(dispatcher: &HostDispatcher) {
    log_dispatch(HostCommand::StopRecord, dispatcher.release_recording());
}

/// Human readable location of an artifact, relative to `base` when possible
pub fn display_path(artifact: &RecordingArtifact, base: &Path) -> String {
    artifact
        .path
        .strip_prefix(base)
        .unwrap_or(&artifact.path)
        .display()
        .to_string()
}
