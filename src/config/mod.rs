use std::env;
use std::path::PathBuf;

use crate::error::{MeetError, Result};
use crate::mesh::webrtc_utils::{IceServer, WebRTCConfig, DEFAULT_STUN_SERVER};

pub struct Config {
    pub signaling: SignalingConfig,
    pub session: SessionConfig,
    pub recording: RecordingConfig,
    pub webrtc: WebRTCConfig,
}

pub struct SignalingConfig {
    pub url: String,
    pub api_base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub meeting_id: String,
    pub user_key: String,
    pub display_name: String,
    pub role: String,
    pub start_audio: bool,
    pub start_video: bool,
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./recordings"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let meeting_id = required("MEETING_ID")?;
        let user_key = required("USER_KEY")?;

        Ok(Self {
            signaling: SignalingConfig {
                url: env::var("SIGNALING_URL")
                    .unwrap_or_else(|_| "ws://127.0.0.1:5000/meet".to_string()),
                api_base_url: env::var("API_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:5000/api".to_string()),
                token: env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            },
            session: SessionConfig {
                display_name: env::var("DISPLAY_NAME").unwrap_or_else(|_| user_key.clone()),
                role: env::var("USER_ROLE").unwrap_or_else(|_| "student".to_string()),
                start_audio: flag("START_AUDIO", true)?,
                start_video: flag("START_VIDEO", true)?,
                meeting_id,
                user_key,
            },
            recording: RecordingConfig {
                output_dir: env::var("RECORDING_OUTPUT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| RecordingConfig::default().output_dir),
            },
            webrtc: webrtc_from_env()?,
        })
    }
}

/// STUN_SERVER_URL may list several servers separated by commas
fn webrtc_from_env() -> Result<WebRTCConfig> {
    let stun = env::var("STUN_SERVER_URL").unwrap_or_else(|_| DEFAULT_STUN_SERVER.to_string());
    let mut ice_servers: Vec<IceServer> = split_urls(&stun).map(IceServer::stun).collect();

    if let Ok(turn_url) = env::var("TURN_SERVER_URL") {
        if !turn_url.trim().is_empty() {
            ice_servers.push(IceServer::turn(
                turn_url.trim(),
                required("TURN_USERNAME")?,
                required("TURN_CREDENTIAL")?,
            ));
        }
    }

    Ok(WebRTCConfig {
        ice_servers,
        ipv4_only: flag("ICE_IPV4_ONLY", false)?,
    })
}

fn split_urls(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|url| !url.is_empty())
}

fn required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(MeetError::MissingConfiguration(key.to_string())),
    }
}

fn flag(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => parse_flag(key, &value),
        Err(_) => Ok(default),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(MeetError::ConfigurationParseFailed(format!(
            "{}={} is not a boolean",
            key, other
        ))),
    }
}
