use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::coordinator::{CaptureBackend, CaptureSession};
use crate::error::{MeetError, Result};
use crate::mesh::{MeshEvent, MeshEventSender};

const EOS_TIMEOUT: Duration = Duration::from_secs(5);
const BUS_POLL_MS: u64 = 200;

/// Display + microphone capture encoded to a local WebM file
pub struct GstCaptureBackend {
    display_source: String,
    audio_source: String,
}

impl GstCaptureBackend {
    pub fn new() -> Result<Self> {
        gst::init().map_err(|e| MeetError::RecordingPipeline(format!("GStreamer init failed: {}", e)))?;
        Ok(Self {
            display_source: "ximagesrc".to_string(),
            audio_source: "autoaudiosrc".to_string(),
        })
    }
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to create {}: {}", factory, e)))
}

fn build_pipeline(display_source: &str, audio_source: &str, output: &PathBuf) -> Result<gst::Pipeline> {
    let location = output
        .to_str()
        .ok_or_else(|| MeetError::RecordingPipeline(format!("Non UTF-8 path: {}", output.display())))?;

    let pipeline = gst::Pipeline::new();

    // Video branch: display -> videoconvert -> vp8enc
    let display = make(display_source)?;
    if display_source == "ximagesrc" {
        display.set_property("use-damage", false);
    }
    let videoconvert = make("videoconvert")?;
    let vp8enc = gst::ElementFactory::make("vp8enc")
        .property("deadline", 1i64)
        .property("cpu-used", 4i32)
        .build()
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to create vp8enc: {}", e)))?;

    // Audio branch: mic -> audioconvert -> audioresample -> opusenc
    let audio = make(audio_source)?;
    let audioconvert = make("audioconvert")?;
    let audioresample = make("audioresample")?;
    let opusenc = make("opusenc")?;

    let webmmux = make("webmmux")?;
    let filesink = gst::ElementFactory::make("filesink")
        .property("location", location)
        .build()
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to create filesink: {}", e)))?;

    pipeline
        .add_many([
            &display,
            &videoconvert,
            &vp8enc,
            &audio,
            &audioconvert,
            &audioresample,
            &opusenc,
            &webmmux,
            &filesink,
        ])
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to add elements: {}", e)))?;

    gst::Element::link_many([&display, &videoconvert, &vp8enc])
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to link video elements: {}", e)))?;
    gst::Element::link_many([&audio, &audioconvert, &audioresample, &opusenc])
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to link audio elements: {}", e)))?;

    // Encoders join the muxer through request pads
    let video_pad = webmmux
        .request_pad_simple("video_%u")
        .ok_or_else(|| MeetError::RecordingPipeline("Failed to get video pad".into()))?;
    let vp8enc_src = vp8enc
        .static_pad("src")
        .ok_or_else(|| MeetError::RecordingPipeline("Failed to get vp8enc src pad".into()))?;
    vp8enc_src
        .link(&video_pad)
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to link video to mux: {}", e)))?;

    let audio_pad = webmmux
        .request_pad_simple("audio_%u")
        .ok_or_else(|| MeetError::RecordingPipeline("Failed to get audio pad".into()))?;
    let opusenc_src = opusenc
        .static_pad("src")
        .ok_or_else(|| MeetError::RecordingPipeline("Failed to get opusenc src pad".into()))?;
    opusenc_src
        .link(&audio_pad)
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to link audio to mux: {}", e)))?;

    webmmux
        .link(&filesink)
        .map_err(|e| MeetError::RecordingPipeline(format!("Failed to link mux to sink: {}", e)))?;

    Ok(pipeline)
}

#[async_trait]
impl CaptureBackend for GstCaptureBackend {
    async fn start(
        &self,
        capture_id: u64,
        output: PathBuf,
        events: MeshEventSender,
    ) -> Result<Box<dyn CaptureSession>> {
        let pipeline = build_pipeline(&self.display_source, &self.audio_source, &output)?;
        let bus = pipeline
            .bus()
            .ok_or_else(|| MeetError::RecordingPipeline("Pipeline has no bus".into()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| MeetError::CaptureFailed(format!("Failed to start capture: {}", e)))?;

        let stopping = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let (drained_tx, drained_rx) = oneshot::channel();
        watch_bus(bus, capture_id, stopping.clone(), closed.clone(), drained_tx, events);

        tracing::info!(capture_id = capture_id, output = %output.display(), "Capture pipeline playing");

        Ok(Box::new(GstCaptureSession {
            capture_id,
            pipeline,
            output,
            stopping,
            closed,
            drained: Some(drained_rx),
        }))
    }
}

struct GstCaptureSession {
    capture_id: u64,
    pipeline: gst::Pipeline,
    output: PathBuf,
    stopping: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    drained: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl CaptureSession for GstCaptureSession {
    async fn finish(&mut self) -> Result<PathBuf> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(self.output.clone());
        }
        self.stopping.store(true, Ordering::SeqCst);

        // EOS lets webmmux write its index before the file is closed
        if !self.pipeline.send_event(gst::event::Eos::new()) {
            tracing::debug!(capture_id = self.capture_id, "Pipeline refused EOS, already ended");
        }

        if let Some(drained) = self.drained.take() {
            if tokio::time::timeout(EOS_TIMEOUT, drained).await.is_err() {
                tracing::warn!(capture_id = self.capture_id, "Timed out waiting for EOS, file may be truncated");
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| MeetError::RecordingPipeline(format!("Failed to stop pipeline: {}", e)))?;

        tracing::info!(capture_id = self.capture_id, output = %self.output.display(), "Capture pipeline stopped");
        Ok(self.output.clone())
    }
}

impl Drop for GstCaptureSession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

/// Reports EOS/error to the stop request if one is pending, otherwise as an external end
fn watch_bus(
    bus: gst::Bus,
    capture_id: u64,
    stopping: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    drained: oneshot::Sender<()>,
    events: MeshEventSender,
) {
    std::thread::spawn(move || {
        while !closed.load(Ordering::SeqCst) {
            let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(BUS_POLL_MS)) else {
                continue;
            };

            let error = match message.view() {
                gst::MessageView::Eos(..) => None,
                gst::MessageView::Error(err) => Some(err.error().to_string()),
                _ => continue,
            };

            if stopping.load(Ordering::SeqCst) {
                let _ = drained.send(());
            } else {
                tracing::warn!(capture_id = capture_id, error = ?error, "Capture ended on its own");
                let _ = events.send(MeshEvent::CaptureEnded { capture_id, error });
            }
            break;
        }
    });
}
