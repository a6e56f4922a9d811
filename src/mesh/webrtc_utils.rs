use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::error::{MeetError, Result};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// One STUN or TURN entry handed to every peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    /// TURN credentials; STUN entries carry none
    pub credentials: Option<(String, String)>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            credentials: None,
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            credentials: Some((username.into(), credential.into())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebRTCConfig {
    pub ice_servers: Vec<IceServer>,
    /// Gather IPv4 candidates only
    pub ipv4_only: bool,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_SERVER)],
            ipv4_only: false,
        }
    }
}

struct Codec {
    mime_type: &'static str,
    kind: RTPCodecType,
    clock_rate: u32,
    channels: u16,
    fmtp: &'static str,
    payload_type: u8,
}

// Same payload types the capture pipelines packetize for
const CODECS: [Codec; 2] = [
    Codec {
        mime_type: MIME_TYPE_OPUS,
        kind: RTPCodecType::Audio,
        clock_rate: 48000,
        channels: 2,
        fmtp: "minptime=10;useinbandfec=1",
        payload_type: 111,
    },
    Codec {
        mime_type: MIME_TYPE_VP8,
        kind: RTPCodecType::Video,
        clock_rate: 90000,
        channels: 0,
        fmtp: "",
        payload_type: 96,
    },
];

/// Keyframe recovery and bandwidth feedback for video
fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

fn media_engine() -> Result<MediaEngine> {
    let mut engine = MediaEngine::default();
    for codec in CODECS {
        let rtcp_feedback = match codec.kind {
            RTPCodecType::Video => video_feedback(),
            _ => vec![],
        };
        engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: codec.mime_type.to_string(),
                        clock_rate: codec.clock_rate,
                        channels: codec.channels,
                        sdp_fmtp_line: codec.fmtp.to_string(),
                        rtcp_feedback,
                    },
                    payload_type: codec.payload_type,
                    ..Default::default()
                },
                codec.kind,
            )
            .map_err(|e| MeetError::CodecRegistrationFailed(format!("{}: {}", codec.mime_type, e)))?;
    }
    Ok(engine)
}

/// Shared API object all peer connections of a session are created from
pub fn create_webrtc_api(config: &WebRTCConfig) -> Result<Arc<API>> {
    let mut media_engine = media_engine()?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| MeetError::webrtc_api(format!("Failed to register interceptors: {}", e)))?;

    let mut setting_engine = SettingEngine::default();
    if config.ipv4_only {
        setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
    }
    setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    Ok(Arc::new(api))
}

pub fn rtc_ice_servers(config: &WebRTCConfig) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|server| match &server.credentials {
            Some((username, credential)) => RTCIceServer {
                urls: server.urls.clone(),
                username: username.clone(),
                credential: credential.clone(),
                credential_type: RTCIceCredentialType::Password,
            },
            None => RTCIceServer {
                urls: server.urls.clone(),
                ..Default::default()
            },
        })
        .collect()
}
