mod coordinator;
mod pipeline;
mod state;

pub use coordinator::{display_path, CaptureBackend, CaptureSession, RecordingArtifact, RecordingCoordinator};
pub use pipeline::GstCaptureBackend;
pub use state::RecordingState;
