//! Media engine backed by native mediasoup workers.
//!
//! Each trait object wraps the corresponding `mediasoup` handle. Native
//! entities close when their last handle is dropped, so `close()` marks the
//! wrapper closed and releases the handle it owns. A transport (or router)
//! that still has live children closes natively once those are released.
//!
//! mediasoup events are mapped onto [`CloseSignal`] and [`DeathSignal`]:
//!
//! | mediasoup event | `CloseReason` |
//! |-----------------|---------------|
//! | worker `on_dead` | death signal |
//! | router `on_worker_close` | `WorkerClosed` |
//! | transport `on_router_close` | `RouterClosed` |
//! | producer/consumer `on_transport_close` | `TransportClosed` |
//! | consumer `on_producer_close` | `ProducerClosed` |
//! | `on_close` without a prior cause | `Explicit` |
//!
//! Identifiers and relayed parameters cross the boundary through serde: the
//! mediasoup types use the same camelCase JSON as the browser client.

use super::{
    CloseNotifier, CloseReason, CloseSignal, DeathSignal, EngineConsumer, EngineError,
    EngineProducer, EngineResult, EngineRouter, EngineTransport, EngineWorker, ListenIp,
    MediaEngine, RouterOptions, RtpCodecCapability, TransportParameters, WebRtcTransportOptions,
    WorkerLogLevel, WorkerSettings,
};
use ::mediasoup::consumer::{Consumer, ConsumerOptions};
use ::mediasoup::data_structures::{DtlsParameters, ListenInfo, Protocol};
use ::mediasoup::producer::{Producer, ProducerOptions};
use ::mediasoup::router::{Router, RouterOptions as NativeRouterOptions};
use ::mediasoup::rtp_parameters::{
    MediaKind as NativeMediaKind, RtpCapabilities, RtpCodecCapability as NativeCodec,
    RtpParameters,
};
use ::mediasoup::transport::Transport;
use ::mediasoup::webrtc_transport::{
    WebRtcTransport, WebRtcTransportListenInfos, WebRtcTransportOptions as NativeTransportOptions,
    WebRtcTransportRemoteParameters,
};
use ::mediasoup::worker::{
    Worker, WorkerLogLevel as NativeLogLevel, WorkerLogTag, WorkerSettings as NativeWorkerSettings,
};
use ::mediasoup::worker_manager::WorkerManager;
use async_trait::async_trait;
use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts between structurally identical serde representations.
fn convert<T: DeserializeOwned>(value: impl Serialize, what: &str) -> EngineResult<T> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|e| EngineError::Rejected(format!("invalid {what}: {e}")))
}

fn parse<T: DeserializeOwned>(value: &Value, what: &str) -> EngineResult<T> {
    T::deserialize(value).map_err(|e| EngineError::Rejected(format!("invalid {what}: {e}")))
}

fn to_json(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn native_kind(kind: MediaKind) -> NativeMediaKind {
    match kind {
        MediaKind::Audio => NativeMediaKind::Audio,
        MediaKind::Video => NativeMediaKind::Video,
    }
}

fn local_kind(kind: NativeMediaKind) -> MediaKind {
    match kind {
        NativeMediaKind::Audio => MediaKind::Audio,
        NativeMediaKind::Video => MediaKind::Video,
    }
}

fn native_log_level(level: WorkerLogLevel) -> NativeLogLevel {
    match level {
        WorkerLogLevel::Debug => NativeLogLevel::Debug,
        WorkerLogLevel::Warn => NativeLogLevel::Warn,
        WorkerLogLevel::Error => NativeLogLevel::Error,
        WorkerLogLevel::None => NativeLogLevel::None,
    }
}

fn native_log_tag(tag: &str) -> Option<WorkerLogTag> {
    let tag = match tag.trim().to_ascii_lowercase().as_str() {
        "info" => WorkerLogTag::Info,
        "ice" => WorkerLogTag::Ice,
        "dtls" => WorkerLogTag::Dtls,
        "rtp" => WorkerLogTag::Rtp,
        "srtp" => WorkerLogTag::Srtp,
        "rtcp" => WorkerLogTag::Rtcp,
        "rtx" => WorkerLogTag::Rtx,
        "bwe" => WorkerLogTag::Bwe,
        "score" => WorkerLogTag::Score,
        "simulcast" => WorkerLogTag::Simulcast,
        "svc" => WorkerLogTag::Svc,
        "sctp" => WorkerLogTag::Sctp,
        "message" => WorkerLogTag::Message,
        _ => return None,
    };
    Some(tag)
}

fn native_worker_settings(settings: &WorkerSettings) -> NativeWorkerSettings {
    let mut native = NativeWorkerSettings::default();
    native.log_level = native_log_level(settings.log_level);
    native.log_tags = settings
        .log_tags
        .iter()
        .filter_map(|tag| {
            let parsed = native_log_tag(tag);
            if parsed.is_none() {
                warn!(target: "sfu.engine.mediasoup", tag = %tag, "Ignoring unknown worker log tag");
            }
            parsed
        })
        .collect();
    native
}

/// Router codec list in mediasoup's form.
///
/// Fills the fields our configuration leaves implicit: an empty
/// `rtcpFeedback` list and mono audio when `channels` is unset.
fn native_codecs(codecs: &[RtpCodecCapability]) -> EngineResult<Vec<NativeCodec>> {
    codecs
        .iter()
        .map(|codec| {
            let mut value = to_json(codec);
            if let Value::Object(map) = &mut value {
                map.entry("rtcpFeedback")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if codec.kind == MediaKind::Audio {
                    map.entry("channels").or_insert_with(|| Value::from(1));
                }
            }
            parse(&value, "media codec")
        })
        .collect()
}

/// One listen info per enabled protocol. The preferred protocol comes first,
/// which gives its candidates the higher ICE priority.
fn listen_infos(
    options: &WebRtcTransportOptions,
    port_range: &RangeInclusive<u16>,
) -> Vec<ListenInfo> {
    let mut protocols = Vec::new();
    if options.enable_udp {
        protocols.push(Protocol::Udp);
    }
    if options.enable_tcp {
        if options.prefer_udp {
            protocols.push(Protocol::Tcp);
        } else {
            protocols.insert(0, Protocol::Tcp);
        }
    }

    protocols
        .into_iter()
        .flat_map(|protocol| {
            options
                .listen_ips
                .iter()
                .map(move |listen_ip| listen_info(protocol, listen_ip, port_range))
        })
        .collect()
}

fn listen_info(
    protocol: Protocol,
    listen_ip: &ListenIp,
    port_range: &RangeInclusive<u16>,
) -> ListenInfo {
    ListenInfo {
        protocol,
        ip: listen_ip.ip,
        announced_address: listen_ip.announced_ip.clone(),
        port: None,
        port_range: Some(port_range.clone()),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    }
}

/// Engine over a mediasoup [`WorkerManager`].
pub struct MediasoupEngine {
    manager: WorkerManager,
}

impl MediasoupEngine {
    pub fn new() -> Self {
        Self {
            manager: WorkerManager::new(),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> EngineResult<Arc<dyn EngineWorker>> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::Rejected(format!(
                "rtcMinPort {} greater than rtcMaxPort {}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let worker = self
            .manager
            .create_worker(native_worker_settings(settings))
            .await
            .map_err(|e| EngineError::Rejected(format!("failed to spawn worker: {e}")))?;
        let id: WorkerId = convert(worker.id(), "worker id")?;

        let (death_tx, _) = watch::channel(None);
        let death_tx = Arc::new(death_tx);
        {
            let death_tx = Arc::clone(&death_tx);
            worker
                .on_dead(move |exit| {
                    let reason = match exit {
                        Ok(()) => "worker exited".to_string(),
                        Err(e) => format!("{e:?}"),
                    };
                    error!(target: "sfu.engine.mediasoup", worker_id = %id, reason = %reason, "Worker died");
                    death_tx.send_replace(Some(reason));
                })
                .detach();
        }

        debug!(
            target: "sfu.engine.mediasoup",
            worker_id = %id,
            log_level = ?settings.log_level,
            "Worker created"
        );

        Ok(Arc::new(MediasoupWorker {
            id,
            worker: Mutex::new(Some(worker)),
            death_tx,
            port_range: settings.rtc_min_port..=settings.rtc_max_port,
        }))
    }
}

/// A native worker process.
pub struct MediasoupWorker {
    id: WorkerId,
    worker: Mutex<Option<Worker>>,
    death_tx: Arc<watch::Sender<Option<String>>>,
    port_range: RangeInclusive<u16>,
}

#[async_trait]
impl EngineWorker for MediasoupWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn died(&self) -> DeathSignal {
        DeathSignal::new(self.death_tx.subscribe())
    }

    async fn create_router(&self, options: &RouterOptions) -> EngineResult<Arc<dyn EngineRouter>> {
        let worker = lock(&self.worker)
            .clone()
            .ok_or_else(|| EngineError::WorkerUnavailable(self.id.to_string()))?;

        let codecs = native_codecs(&options.media_codecs)?;
        let router = worker
            .create_router(NativeRouterOptions::new(codecs))
            .await
            .map_err(|e| EngineError::Rejected(e.to_string()))?;
        let id: RouterId = convert(router.id(), "router id")?;

        let close = Arc::new(CloseNotifier::new());
        {
            let close = Arc::clone(&close);
            router
                .on_worker_close(move || {
                    close.notify(CloseReason::WorkerClosed);
                })
                .detach();
        }
        {
            let close = Arc::clone(&close);
            router
                .on_close(move || {
                    close.notify(CloseReason::Explicit);
                })
                .detach();
        }

        Ok(Arc::new(MediasoupRouter {
            id,
            rtp_capabilities: to_json(router.rtp_capabilities()),
            router: Mutex::new(Some(router)),
            close,
            port_range: self.port_range.clone(),
        }))
    }

    fn close(&self) {
        drop(lock(&self.worker).take());
    }
}

/// A native router.
pub struct MediasoupRouter {
    id: RouterId,
    rtp_capabilities: Value,
    router: Mutex<Option<Router>>,
    close: Arc<CloseNotifier>,
    port_range: RangeInclusive<u16>,
}

impl MediasoupRouter {
    fn router(&self) -> EngineResult<Router> {
        lock(&self.router).clone().ok_or(EngineError::Closed("router"))
    }
}

#[async_trait]
impl EngineRouter for MediasoupRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &Value) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let Ok(producer_id) = convert(producer_id, "producer id") else {
            return false;
        };
        let Ok(capabilities) = parse::<RtpCapabilities>(rtp_capabilities, "rtpCapabilities") else {
            return false;
        };
        router.can_consume(&producer_id, &capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>> {
        let router = self.router()?;

        let mut infos = listen_infos(options, &self.port_range).into_iter();
        let first = infos
            .next()
            .ok_or_else(|| EngineError::Rejected("no listen address enabled".to_string()))?;
        let listen = infos.fold(WebRtcTransportListenInfos::new(first), |acc, info| {
            acc.insert(info)
        });
        let mut native_options = NativeTransportOptions::new(listen);
        native_options.initial_available_outgoing_bitrate =
            options.initial_available_outgoing_bitrate;

        let transport = router
            .create_webrtc_transport(native_options)
            .await
            .map_err(|e| EngineError::Rejected(e.to_string()))?;
        let id: TransportId = convert(transport.id(), "transport id")?;

        let close = Arc::new(CloseNotifier::new());
        {
            let close = Arc::clone(&close);
            transport
                .on_router_close(Box::new(move || {
                    close.notify(CloseReason::RouterClosed);
                }))
                .detach();
        }
        {
            let close = Arc::clone(&close);
            transport
                .on_close(Box::new(move || {
                    close.notify(CloseReason::Explicit);
                }))
                .detach();
        }

        let parameters = TransportParameters {
            id,
            ice_parameters: to_json(transport.ice_parameters()),
            ice_candidates: to_json(transport.ice_candidates()),
            dtls_parameters: to_json(transport.dtls_parameters()),
            sctp_parameters: transport.sctp_parameters().map(to_json),
        };

        Ok(Arc::new(MediasoupTransport {
            id,
            parameters,
            transport: Mutex::new(Some(transport)),
            close,
        }))
    }

    fn close(&self) {
        self.close.notify(CloseReason::Explicit);
        drop(lock(&self.router).take());
    }

    fn closed(&self) -> bool {
        self.close.is_closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.close.signal()
    }
}

/// A native WebRTC transport.
pub struct MediasoupTransport {
    id: TransportId,
    parameters: TransportParameters,
    transport: Mutex<Option<WebRtcTransport>>,
    close: Arc<CloseNotifier>,
}

impl MediasoupTransport {
    fn transport(&self) -> EngineResult<WebRtcTransport> {
        lock(&self.transport)
            .clone()
            .ok_or(EngineError::Closed("transport"))
    }
}

#[async_trait]
impl EngineTransport for MediasoupTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: &Value) -> EngineResult<()> {
        let transport = self.transport()?;
        let dtls_parameters: DtlsParameters = parse(dtls_parameters, "dtlsParameters")?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| EngineError::Rejected(e.to_string()))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> EngineResult<Arc<dyn EngineProducer>> {
        let transport = self.transport()?;
        let rtp_parameters: RtpParameters = parse(rtp_parameters, "rtpParameters")?;
        let producer = transport
            .produce(ProducerOptions::new(native_kind(kind), rtp_parameters))
            .await
            .map_err(|e| EngineError::Rejected(e.to_string()))?;
        let id: ProducerId = convert(producer.id(), "producer id")?;

        let close = Arc::new(CloseNotifier::new());
        {
            let close = Arc::clone(&close);
            producer
                .on_transport_close(move || {
                    close.notify(CloseReason::TransportClosed);
                })
                .detach();
        }
        {
            let close = Arc::clone(&close);
            producer
                .on_close(move || {
                    close.notify(CloseReason::Explicit);
                })
                .detach();
        }

        Ok(Arc::new(MediasoupProducer {
            id,
            kind,
            producer: Mutex::new(Some(producer)),
            close,
        }))
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>> {
        let transport = self.transport()?;
        let rtp_capabilities: RtpCapabilities = parse(rtp_capabilities, "rtpCapabilities")?;
        let mut options = ConsumerOptions::new(convert(producer_id, "producer id")?, rtp_capabilities);
        options.paused = paused;

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| EngineError::Rejected(e.to_string()))?;
        let id: ConsumerId = convert(consumer.id(), "consumer id")?;

        let close = Arc::new(CloseNotifier::new());
        {
            let close = Arc::clone(&close);
            consumer
                .on_transport_close(move || {
                    close.notify(CloseReason::TransportClosed);
                })
                .detach();
        }
        {
            let close = Arc::clone(&close);
            consumer
                .on_producer_close(move || {
                    close.notify(CloseReason::ProducerClosed);
                })
                .detach();
        }
        {
            let close = Arc::clone(&close);
            consumer
                .on_close(move || {
                    close.notify(CloseReason::Explicit);
                })
                .detach();
        }

        Ok(Arc::new(MediasoupConsumer {
            id,
            producer_id,
            kind: local_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            consumer: Mutex::new(Some(consumer)),
            close,
        }))
    }

    fn close(&self) {
        self.close.notify(CloseReason::Explicit);
        drop(lock(&self.transport).take());
    }

    fn closed(&self) -> bool {
        self.close.is_closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.close.signal()
    }
}

/// A native producer.
pub struct MediasoupProducer {
    id: ProducerId,
    kind: MediaKind,
    producer: Mutex<Option<Producer>>,
    close: Arc<CloseNotifier>,
}

impl EngineProducer for MediasoupProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        lock(&self.producer).as_ref().is_some_and(Producer::paused)
    }

    fn close(&self) {
        self.close.notify(CloseReason::Explicit);
        drop(lock(&self.producer).take());
    }

    fn closed(&self) -> bool {
        self.close.is_closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.close.signal()
    }
}

/// A native consumer.
pub struct MediasoupConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer: Mutex<Option<Consumer>>,
    close: Arc<CloseNotifier>,
}

#[async_trait]
impl EngineConsumer for MediasoupConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        lock(&self.consumer).as_ref().is_some_and(Consumer::paused)
    }

    fn producer_paused(&self) -> bool {
        lock(&self.consumer)
            .as_ref()
            .is_some_and(Consumer::producer_paused)
    }

    async fn resume(&self) -> EngineResult<()> {
        let consumer = lock(&self.consumer)
            .clone()
            .ok_or(EngineError::Closed("consumer"))?;
        consumer
            .resume()
            .await
            .map_err(|e| EngineError::Rejected(e.to_string()))
    }

    fn close(&self) {
        self.close.notify(CloseReason::Explicit);
        drop(lock(&self.consumer).take());
    }

    fn closed(&self) -> bool {
        self.close.is_closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.close.signal()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use std::net::{IpAddr, Ipv4Addr};

    fn transport_options(enable_udp: bool, enable_tcp: bool, prefer_udp: bool) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_ip: Some("203.0.113.7".to_string()),
            }],
            initial_available_outgoing_bitrate: 1_000_000,
            enable_udp,
            enable_tcp,
            prefer_udp,
        }
    }

    #[test]
    fn test_ids_convert_both_ways() {
        let producer_id = ProducerId::new();
        let native: ::mediasoup::producer::ProducerId = convert(producer_id, "producer id").unwrap();
        let back: ProducerId = convert(native, "producer id").unwrap();
        assert_eq!(back, producer_id);
    }

    #[test]
    fn test_default_codecs_are_accepted() {
        let codecs = native_codecs(&default_media_codecs(1000)).unwrap();
        assert_eq!(codecs.len(), 2);
    }

    #[test]
    fn test_unknown_codec_kind_is_rejected() {
        let result = parse::<NativeCodec>(&serde_json::json!({"kind": "text"}), "media codec");
        assert!(matches!(result, Err(EngineError::Rejected(ref m)) if m.starts_with("invalid media codec")));
    }

    #[test]
    fn test_listen_infos_put_preferred_protocol_first() {
        let ports = 40000..=40100;

        let infos = listen_infos(&transport_options(true, true, true), &ports);
        let protocols: Vec<Protocol> = infos.iter().map(|i| i.protocol).collect();
        assert_eq!(protocols, vec![Protocol::Udp, Protocol::Tcp]);

        let infos = listen_infos(&transport_options(true, true, false), &ports);
        let protocols: Vec<Protocol> = infos.iter().map(|i| i.protocol).collect();
        assert_eq!(protocols, vec![Protocol::Tcp, Protocol::Udp]);

        let first = infos.first().unwrap();
        assert_eq!(first.announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(first.port_range, Some(ports.clone()));

        assert!(listen_infos(&transport_options(false, false, true), &ports).is_empty());
    }

    #[test]
    fn test_worker_settings_skip_unknown_log_tags() {
        let settings = WorkerSettings {
            log_level: WorkerLogLevel::Debug,
            log_tags: vec!["ice".to_string(), "bogus".to_string(), "DTLS".to_string()],
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        };
        let native = native_worker_settings(&settings);
        assert_eq!(native.log_tags.len(), 2);
        assert!(matches!(native.log_level, NativeLogLevel::Debug));
    }
}
