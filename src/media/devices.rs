use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::media::Sample;

use super::track::{LocalTrack, MediaKind, TrackSource};
use super::MediaDevices;
use crate::error::{MeetError, Result};
use crate::mesh::{MeshEvent, MeshEventSender};

const VIDEO_FRAME: Duration = Duration::from_millis(33);
const AUDIO_FRAME: Duration = Duration::from_millis(20);
const BUS_POLL: u64 = 250;

/// Camera, microphone and display capture backed by GStreamer pipelines
pub struct GstMediaDevices {
    camera_source: String,
    microphone_source: String,
    display_source: String,
}

impl GstMediaDevices {
    pub fn new() -> Result<Self> {
        gst::init().map_err(|e| MeetError::media(format!("GStreamer init failed: {}", e)))?;

        Ok(Self {
            camera_source: "autovideosrc".to_string(),
            microphone_source: "autoaudiosrc".to_string(),
            display_source: "ximagesrc".to_string(),
        })
    }

    fn open(&self, kind: MediaKind, factory: &str, track_id: &str, ended: MeshEventSender) -> Result<Arc<LocalTrack>> {
        let track = Arc::new(LocalTrack::new(kind, track_id));
        let source = CapturePipeline::build(kind, factory, &track, ended)?;
        track.attach_source(Box::new(source));

        tracing::info!(track_id = %track_id, kind = %kind, source = %factory, "Local capture started");
        Ok(track)
    }
}

#[async_trait]
impl MediaDevices for GstMediaDevices {
    async fn open_microphone(&self, events: MeshEventSender) -> Result<Arc<LocalTrack>> {
        self.open(MediaKind::Audio, &self.microphone_source, "microphone", events)
    }

    async fn open_camera(&self, events: MeshEventSender) -> Result<Arc<LocalTrack>> {
        self.open(MediaKind::Video, &self.camera_source, "camera", events)
    }

    async fn open_display(&self, events: MeshEventSender) -> Result<Arc<LocalTrack>> {
        self.open(MediaKind::Video, &self.display_source, "screen", events)
    }
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| MeetError::media(format!("Failed to create {}: {}", factory, e)))
}

/// Encoded sample handed from the GStreamer streaming thread to the async writer
struct EncodedFrame {
    data: Vec<u8>,
    duration: Duration,
}

struct CapturePipeline {
    pipeline: gst::Pipeline,
    stopped: Arc<AtomicBool>,
}

impl CapturePipeline {
    /// source -> convert -> encoder -> appsink, with samples pushed into the track
    fn build(kind: MediaKind, factory: &str, track: &LocalTrack, ended: MeshEventSender) -> Result<Self> {
        let pipeline = gst::Pipeline::new();

        let source = make(factory)?;
        if factory == "ximagesrc" {
            source.set_property("use-damage", false);
        }

        let (chain, frame) = match kind {
            MediaKind::Video => {
                let convert = make("videoconvert")?;
                let encoder = gst::ElementFactory::make("vp8enc")
                    .property("deadline", 1i64)
                    .property("cpu-used", 4i32)
                    .build()
                    .map_err(|e| MeetError::media(format!("Failed to create vp8enc: {}", e)))?;
                (vec![source, convert, encoder], VIDEO_FRAME)
            }
            MediaKind::Audio => {
                let convert = make("audioconvert")?;
                let resample = make("audioresample")?;
                let encoder = make("opusenc")?;
                (vec![source, convert, resample, encoder], AUDIO_FRAME)
            }
        };

        let appsink = gst_app::AppSink::builder().build();
        appsink.set_property("sync", false);

        pipeline
            .add_many(chain.iter())
            .and_then(|_| pipeline.add(&appsink))
            .map_err(|e| MeetError::media(format!("Failed to assemble pipeline: {}", e)))?;
        gst::Element::link_many(chain.iter())
            .and_then(|_| match chain.last() {
                Some(last) => last.link(&appsink),
                None => Ok(()),
            })
            .map_err(|e| MeetError::media(format!("Failed to link pipeline: {}", e)))?;

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<EncodedFrame>();
        let enabled = track.enabled_flag();

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    // Disabled tracks keep the encoder running but send nothing
                    if enabled.load(Ordering::Relaxed) {
                        let duration = buffer
                            .duration()
                            .map(|d| Duration::from_nanos(d.nseconds()))
                            .unwrap_or(frame);
                        if frame_tx
                            .send(EncodedFrame {
                                data: map.as_slice().to_vec(),
                                duration,
                            })
                            .is_err()
                        {
                            return Err(gst::FlowError::Eos);
                        }
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let sample_track = track.sample_track();
        let track_id = track.id().to_string();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let sample = Sample {
                    data: frame.data.into(),
                    duration: frame.duration,
                    ..Default::default()
                };
                if let Err(e) = sample_track.write_sample(&sample).await {
                    tracing::debug!(track_id = %track_id, error = %e, "Dropped local sample");
                }
            }
        });

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            // A partial state change can leave the device open
            if let Err(reset) = pipeline.set_state(gst::State::Null) {
                tracing::debug!(error = %reset, "Failed to reset capture pipeline");
            }
            return Err(MeetError::media(format!("Failed to start {}: {}", factory, e)));
        }

        let stopped = Arc::new(AtomicBool::new(false));
        watch_for_end(&pipeline, stopped.clone(), track.id().to_string(), ended);

        Ok(Self { pipeline, stopped })
    }
}

impl TrackSource for CapturePipeline {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            tracing::warn!(error = %e, "Failed to stop capture pipeline");
        }
    }
}

/// Drain the pipeline bus and report a source that stopped on its own
/// (window closed, device unplugged)
fn watch_for_end(pipeline: &gst::Pipeline, stopped: Arc<AtomicBool>, track_id: String, events: MeshEventSender) {
    let bus = match pipeline.bus() {
        Some(bus) => bus,
        None => return,
    };

    std::thread::spawn(move || {
        while !stopped.load(Ordering::SeqCst) {
            let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(BUS_POLL)) else {
                continue;
            };

            let ended = match message.view() {
                gst::MessageView::Eos(..) => true,
                gst::MessageView::Error(err) => {
                    tracing::warn!(track_id = %track_id, error = %err.error(), "Capture source failed");
                    true
                }
                gst::MessageView::Warning(warning) => {
                    tracing::debug!(track_id = %track_id, warning = %warning.error(), "Capture warning");
                    false
                }
                _ => false,
            };

            if ended {
                if !stopped.load(Ordering::SeqCst) {
                    let _ = events.send(MeshEvent::LocalSourceEnded {
                        track_id: track_id.clone(),
                    });
                }
                break;
            }
        }
    });
}
