//! Media engine boundary.
//!
//! The orchestration layer never forwards media itself. It drives an engine
//! through the traits below and reacts to the close and death signals the
//! engine emits. Parameters the orchestrator only relays (ICE/DTLS/SCTP
//! material, RTP parameters and capabilities) stay opaque JSON values.
//!
//! [`mediasoup::MediasoupEngine`] drives native mediasoup workers and is what
//! the binary runs. [`local::LocalEngine`] is an in-process stand-in for the
//! test suites, compiled under `cfg(test)` or the `test-utils` feature.

#[cfg(any(test, feature = "test-utils"))]
pub mod local;
pub mod mediasoup;

use async_trait::async_trait;
use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors reported by the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine refused the call (malformed parameters, duplicate connect...).
    #[error("{0}")]
    Rejected(String),

    /// The target entity is already closed.
    #[error("{0} closed")]
    Closed(&'static str),

    /// The worker cannot host new routers.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Why an engine entity closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called on the entity itself.
    Explicit,
    /// The owning transport closed (`transportclose`).
    TransportClosed,
    /// The consumed producer closed (`producerclose`).
    ProducerClosed,
    /// The owning router closed.
    RouterClosed,
    /// The router's worker closed or died (`workerclose`).
    WorkerClosed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Explicit => "explicit",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::ProducerClosed => "producer_closed",
            CloseReason::RouterClosed => "router_closed",
            CloseReason::WorkerClosed => "worker_closed",
        }
    }
}

/// Sending side of a close event. Transitions to closed at most once.
#[derive(Debug)]
pub struct CloseNotifier {
    tx: watch::Sender<Option<CloseReason>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Marks the entity closed. Returns `true` only for the first call.
    pub fn notify(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a close event.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<CloseReason>>,
}

impl CloseSignal {
    pub fn is_closed(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolves once the entity closes.
    ///
    /// Returns `None` if the entity was dropped without ever closing.
    pub async fn closed(mut self) -> Option<CloseReason> {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return Some(reason);
            }
            if self.rx.changed().await.is_err() {
                return *self.rx.borrow();
            }
        }
    }
}

/// Fatal worker death event, carrying the engine's description.
#[derive(Debug, Clone)]
pub struct DeathSignal {
    rx: watch::Receiver<Option<String>>,
}

impl DeathSignal {
    pub fn new(rx: watch::Receiver<Option<String>>) -> Self {
        Self { rx }
    }

    pub fn is_dead(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolves with the death reason. `None` means the worker was dropped
    /// while still alive (normal shutdown).
    pub async fn died(mut self) -> Option<String> {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return Some(reason);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

/// Engine worker log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl FromStr for WorkerLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(WorkerLogLevel::Debug),
            "warn" => Ok(WorkerLogLevel::Warn),
            "error" => Ok(WorkerLogLevel::Error),
            "none" => Ok(WorkerLogLevel::None),
            other => Err(format!("unknown worker log level: {other}")),
        }
    }
}

/// Settings applied to every engine worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// One entry of the router's media codec list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterOptions {
    pub media_codecs: Vec<RtpCodecCapability>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenIp {
    pub ip: IpAddr,
    /// Public address advertised in ICE candidates instead of `ip`.
    pub announced_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

/// Router and transport options applied to every room.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSettings {
    pub router: RouterOptions,
    pub webrtc_transport: WebRtcTransportOptions,
}

/// Connection parameters the client relays to its media endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub sctp_parameters: Option<Value>,
}

/// Creates engine workers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings)
        -> EngineResult<Arc<dyn EngineWorker>>;
}

/// A process-like unit hosting routers.
#[async_trait]
pub trait EngineWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Fires if the worker dies unexpectedly.
    fn died(&self) -> DeathSignal;

    async fn create_router(&self, options: &RouterOptions) -> EngineResult<Arc<dyn EngineRouter>>;

    /// Closes the worker and all its routers without signalling death.
    fn close(&self);
}

#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> Value;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>>;

    fn close(&self);

    fn closed(&self) -> bool;

    fn on_close(&self) -> CloseSignal;
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn parameters(&self) -> TransportParameters;

    async fn connect(&self, dtls_parameters: &Value) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> EngineResult<Arc<dyn EngineProducer>>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>>;

    fn close(&self);

    fn closed(&self) -> bool;

    fn on_close(&self) -> CloseSignal;
}

pub trait EngineProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn paused(&self) -> bool;

    fn close(&self);

    fn closed(&self) -> bool;

    /// Fires with `Explicit` or `TransportClosed`.
    fn on_close(&self) -> CloseSignal;
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> Value;

    fn paused(&self) -> bool;

    /// Pause state of the consumed producer as seen by this consumer.
    fn producer_paused(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;

    fn close(&self);

    fn closed(&self) -> bool;

    /// Fires with `Explicit`, `TransportClosed` or `ProducerClosed`.
    fn on_close(&self) -> CloseSignal;
}
