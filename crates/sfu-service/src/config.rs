//! SFU configuration.
//!
//! Configuration is loaded from environment variables. Every option has a
//! default, so an empty environment yields a working single-host setup.

use crate::engine::{
    ListenIp, MediaSettings, RouterOptions, RtpCodecCapability, WebRtcTransportOptions, WorkerLogLevel,
    WorkerSettings,
};
use common::types::MediaKind;
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4000";

/// Default engine worker log level.
pub const DEFAULT_WORKER_LOG_LEVEL: WorkerLogLevel = WorkerLogLevel::Warn;

/// Default engine worker log tags.
pub const DEFAULT_WORKER_LOG_TAGS: &[&str] = &["info", "ice", "dtls", "rtp", "srtp", "rtcp"];

/// Default lower bound of the media port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;

/// Default upper bound of the media port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default transport listen address.
pub const DEFAULT_LISTEN_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default initial available outgoing bitrate (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default `x-google-start-bitrate` hint (kbps) for video codecs.
pub const DEFAULT_VIDEO_START_BITRATE: u32 = 1000;

/// Default HTTP drain period on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 10;

const VIDEO_START_BITRATE_PARAM: &str = "x-google-start-bitrate";

/// SFU configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address (default: "0.0.0.0:4000").
    pub bind_address: String,

    /// Number of engine workers (default: host parallelism, at least 1).
    pub num_workers: usize,

    /// Settings applied to every engine worker.
    pub worker_settings: WorkerSettings,

    /// Router codec list. Always holds at least one audio and one video codec.
    pub media_codecs: Vec<RtpCodecCapability>,

    /// Options for every WebRTC transport.
    pub webrtc_transport: WebRtcTransportOptions,

    /// Seconds to drain in-flight HTTP requests on shutdown (default: 10).
    pub shutdown_timeout_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

fn parse_bool_or(
    vars: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue(format!("{key}={v}"))),
    }
}

/// Host parallelism, floor 1.
pub fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Opus 48kHz stereo and VP8 with the given start bitrate.
pub fn default_media_codecs(video_start_bitrate: u32) -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = serde_json::Map::new();
    vp8_parameters.insert(
        VIDEO_START_BITRATE_PARAM.to_string(),
        Value::from(video_start_bitrate),
    );

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
        },
    ]
}

fn validate_codecs(
    mut codecs: Vec<RtpCodecCapability>,
    video_start_bitrate: u32,
) -> Result<Vec<RtpCodecCapability>, ConfigError> {
    if !codecs.iter().any(|c| c.kind == MediaKind::Audio) {
        return Err(ConfigError::InvalidValue(
            "SFU_MEDIA_CODECS must include an audio codec".to_string(),
        ));
    }
    if !codecs.iter().any(|c| c.kind == MediaKind::Video) {
        return Err(ConfigError::InvalidValue(
            "SFU_MEDIA_CODECS must include a video codec".to_string(),
        ));
    }
    if let Some(codec) = codecs.iter().find(|c| c.clock_rate == 0) {
        return Err(ConfigError::InvalidValue(format!(
            "codec {} has no clock rate",
            codec.mime_type
        )));
    }

    for codec in codecs.iter_mut().filter(|c| c.kind == MediaKind::Video) {
        codec
            .parameters
            .entry(VIDEO_START_BITRATE_PARAM)
            .or_insert_with(|| Value::from(video_start_bitrate));
    }
    Ok(codecs)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("SFU_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let num_workers = parse_or(vars, "SFU_NUM_WORKERS", default_num_workers())?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let log_level = parse_or(vars, "SFU_WORKER_LOG_LEVEL", DEFAULT_WORKER_LOG_LEVEL)?;
        let log_tags = match vars.get("SFU_WORKER_LOG_TAGS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_WORKER_LOG_TAGS
                .iter()
                .map(|t| (*t).to_string())
                .collect(),
        };

        let rtc_min_port = parse_or(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_or(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) greater than SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let video_start_bitrate =
            parse_or(vars, "SFU_VIDEO_START_BITRATE", DEFAULT_VIDEO_START_BITRATE)?;
        let media_codecs = match vars.get("SFU_MEDIA_CODECS") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                ConfigError::InvalidValue(format!("SFU_MEDIA_CODECS is not a codec list: {e}"))
            })?,
            None => default_media_codecs(video_start_bitrate),
        };
        let media_codecs = validate_codecs(media_codecs, video_start_bitrate)?;

        let listen_ip = parse_or(vars, "SFU_LISTEN_IP", DEFAULT_LISTEN_IP)?;
        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let enable_udp = parse_bool_or(vars, "SFU_ENABLE_UDP", true)?;
        let enable_tcp = parse_bool_or(vars, "SFU_ENABLE_TCP", false)?;
        if !enable_udp && !enable_tcp {
            return Err(ConfigError::InvalidValue(
                "at least one of SFU_ENABLE_UDP or SFU_ENABLE_TCP must be true".to_string(),
            ));
        }

        let webrtc_transport = WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: listen_ip,
                announced_ip,
            }],
            initial_available_outgoing_bitrate: parse_or(
                vars,
                "SFU_INITIAL_OUTGOING_BITRATE",
                DEFAULT_INITIAL_OUTGOING_BITRATE,
            )?,
            enable_udp,
            enable_tcp,
            prefer_udp: parse_bool_or(vars, "SFU_PREFER_UDP", true)?,
        };

        let shutdown_timeout_seconds = parse_or(
            vars,
            "SFU_SHUTDOWN_TIMEOUT_SECONDS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
        )?;

        Ok(Config {
            bind_address,
            num_workers,
            worker_settings: WorkerSettings {
                log_level,
                log_tags,
                rtc_min_port,
                rtc_max_port,
            },
            media_codecs,
            webrtc_transport,
            shutdown_timeout_seconds,
        })
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            media_codecs: self.media_codecs.clone(),
        }
    }

    /// Router and transport options handed to every room.
    pub fn media_settings(&self) -> MediaSettings {
        MediaSettings {
            router: self.router_options(),
            webrtc_transport: self.webrtc_transport.clone(),
        }
    }
}
