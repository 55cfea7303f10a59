//! Shared helpers for actor unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::config::Config;
use crate::engine::local::LocalEngine;
use crate::engine::{EngineRouter, EngineWorker, MediaEngine, MediaSettings};

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) fn test_config() -> Config {
    let mut vars = HashMap::new();
    vars.insert("SFU_NUM_WORKERS".to_string(), "2".to_string());
    vars.insert("SFU_ANNOUNCED_IP".to_string(), "203.0.113.7".to_string());
    Config::from_vars(&vars).unwrap()
}

pub(crate) async fn local_worker(engine: &LocalEngine) -> Arc<dyn EngineWorker> {
    engine
        .create_worker(&test_config().worker_settings)
        .await
        .unwrap()
}

pub(crate) async fn local_router(
    engine: &LocalEngine,
) -> (Arc<dyn EngineRouter>, Arc<MediaSettings>) {
    let media = Arc::new(test_config().media_settings());
    let router = local_worker(engine)
        .await
        .create_router(&media.router)
        .await
        .unwrap();
    (router, media)
}

pub(crate) fn dtls() -> Value {
    json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }] })
}

pub(crate) fn rtp(mime: &str) -> Value {
    json!({ "codecs": [{ "mimeType": mime, "clockRate": 90000, "payloadType": 101 }] })
}

pub(crate) fn caps(mimes: &[&str]) -> Value {
    let codecs: Vec<Value> = mimes.iter().map(|m| json!({ "mimeType": m })).collect();
    json!({ "codecs": codecs })
}
