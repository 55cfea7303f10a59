//! Pre-configured test data fixtures for SFU testing.
//!
//! Provides:
//! - Service configuration with test-friendly defaults
//! - DTLS parameters, RTP parameters and RTP capabilities payloads

use serde_json::{json, Value};
use sfu_service::config::Config;
use std::collections::HashMap;
use uuid::Uuid;

/// Address announced in ICE candidates by test configurations.
pub const TEST_ANNOUNCED_IP: &str = "203.0.113.10";

/// Environment variables for a test configuration with `num_workers` workers.
#[must_use]
pub fn test_vars(num_workers: usize) -> HashMap<String, String> {
    HashMap::from([
        ("SFU_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ("SFU_NUM_WORKERS".to_string(), num_workers.to_string()),
        ("SFU_ANNOUNCED_IP".to_string(), TEST_ANNOUNCED_IP.to_string()),
        ("SFU_RTC_MIN_PORT".to_string(), "41000".to_string()),
        ("SFU_RTC_MAX_PORT".to_string(), "41999".to_string()),
    ])
}

/// Test configuration with `num_workers` workers.
#[must_use]
pub fn test_config(num_workers: usize) -> Config {
    Config::from_vars(&test_vars(num_workers)).expect("test configuration should be valid")
}

/// Random room id.
#[must_use]
pub fn random_room_id() -> String {
    format!("room-{}", Uuid::new_v4())
}

/// DTLS parameters as a browser client sends them on connect.
#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{
            "algorithm": "sha-256",
            "value": "82:5A:68:3D:36:C3:0A:DE:AF:E7:32:43:D2:88:83:57:AC:2D:65:E5:80:C4:B6:FB:AF:1A:A0:21:9F:6D:0C:AD"
        }]
    })
}

/// RTP parameters sending a single codec.
#[must_use]
pub fn rtp_parameters(mime_type: &str) -> Value {
    let clock_rate = if mime_type.starts_with("audio/") { 48000 } else { 90000 };
    json!({
        "mid": "0",
        "codecs": [{ "mimeType": mime_type, "clockRate": clock_rate, "payloadType": 100 }],
        "encodings": [{ "ssrc": 11111111 }]
    })
}

/// Receiver RTP capabilities supporting the given codecs.
#[must_use]
pub fn rtp_capabilities(mime_types: &[&str]) -> Value {
    let codecs: Vec<Value> = mime_types
        .iter()
        .map(|mime_type| json!({ "mimeType": mime_type }))
        .collect();
    json!({ "codecs": codecs })
}

/// Capabilities of a client supporting the default codec list.
#[must_use]
pub fn default_rtp_capabilities() -> Value {
    rtp_capabilities(&["audio/opus", "video/VP8"])
}
