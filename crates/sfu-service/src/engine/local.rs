//! In-process media engine for tests.
//!
//! Implements the full engine contract without forwarding real media:
//! workers, routers, WebRTC transports, producers and consumers keep the
//! same lifecycle rules as a native SFU worker (single connect, cascading
//! close events, codec based `can_consume`). Parents hold weak references to
//! their children so that dropping a handle releases it.

use super::{
    CloseNotifier, CloseReason, CloseSignal, DeathSignal, EngineConsumer, EngineError,
    EngineProducer, EngineResult, EngineRouter, EngineTransport, EngineWorker, MediaEngine,
    RouterOptions, RtpCodecCapability, TransportParameters, WebRtcTransportOptions,
    WorkerSettings,
};
use async_trait::async_trait;
use common::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const TCP_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn upgrade_all<T>(weak: Vec<Weak<T>>) -> impl Iterator<Item = Arc<T>> {
    weak.into_iter().filter_map(|w| w.upgrade())
}

/// Counters for engine activity.
#[derive(Debug, Default)]
pub struct EngineStats {
    workers_created: AtomicU64,
    routers_created: AtomicU64,
    transports_created: AtomicU64,
    producers_created: AtomicU64,
    consumers_created: AtomicU64,
    connect_calls: AtomicU64,
    resume_calls: AtomicU64,
    router_closes: AtomicU64,
    transport_closes: AtomicU64,
    producer_closes: AtomicU64,
    consumer_closes: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStatsSnapshot {
    pub workers_created: u64,
    pub routers_created: u64,
    pub transports_created: u64,
    pub producers_created: u64,
    pub consumers_created: u64,
    pub connect_calls: u64,
    pub resume_calls: u64,
    pub router_closes: u64,
    pub transport_closes: u64,
    pub producer_closes: u64,
    pub consumer_closes: u64,
}

impl EngineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            workers_created: self.workers_created.load(Ordering::Relaxed),
            routers_created: self.routers_created.load(Ordering::Relaxed),
            transports_created: self.transports_created.load(Ordering::Relaxed),
            producers_created: self.producers_created.load(Ordering::Relaxed),
            consumers_created: self.consumers_created.load(Ordering::Relaxed),
            connect_calls: self.connect_calls.load(Ordering::Relaxed),
            resume_calls: self.resume_calls.load(Ordering::Relaxed),
            router_closes: self.router_closes.load(Ordering::Relaxed),
            transport_closes: self.transport_closes.load(Ordering::Relaxed),
            producer_closes: self.producer_closes.load(Ordering::Relaxed),
            consumer_closes: self.consumer_closes.load(Ordering::Relaxed),
        }
    }
}

/// The in-process engine.
#[derive(Debug, Default)]
pub struct LocalEngine {
    stats: Arc<EngineStats>,
    workers: Mutex<Vec<Arc<LocalWorker>>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Workers created so far, in creation order.
    pub fn workers(&self) -> Vec<Arc<LocalWorker>> {
        lock(&self.workers).clone()
    }

    /// Looks up a live producer on any router of any worker.
    pub fn find_producer(&self, producer_id: ProducerId) -> Option<Arc<LocalProducer>> {
        self.workers()
            .iter()
            .flat_map(|worker| worker.routers())
            .find_map(|router| router.producer(producer_id))
    }

    /// Looks up a live transport on any router of any worker.
    pub fn find_transport(&self, transport_id: TransportId) -> Option<Arc<LocalTransport>> {
        self.workers()
            .iter()
            .flat_map(|worker| worker.routers())
            .find_map(|router| router.transport(transport_id))
    }

    /// Looks up a live consumer on any router of any worker.
    pub fn find_consumer(&self, consumer_id: ConsumerId) -> Option<Arc<LocalConsumer>> {
        self.workers()
            .iter()
            .flat_map(|worker| worker.routers())
            .find_map(|router| router.consumer(consumer_id))
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
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

        let (death_tx, _) = watch::channel(None);
        let worker = Arc::new(LocalWorker {
            id: WorkerId::new(),
            settings: settings.clone(),
            stats: Arc::clone(&self.stats),
            death_tx,
            closed: AtomicBool::new(false),
            routers: Mutex::new(Vec::new()),
            ports: Arc::new(PortRange::new(settings.rtc_min_port, settings.rtc_max_port)),
        });
        EngineStats::bump(&self.stats.workers_created);
        lock(&self.workers).push(Arc::clone(&worker));

        debug!(
            target: "sfu.engine.local",
            worker_id = %worker.id,
            log_level = ?settings.log_level,
            "Worker created"
        );
        Ok(worker)
    }
}

#[derive(Debug)]
struct PortRange {
    min: u16,
    span: u32,
    next: AtomicU32,
}

impl PortRange {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            span: u32::from(max) - u32::from(min) + 1,
            next: AtomicU32::new(0),
        }
    }

    fn allocate(&self) -> u32 {
        u32::from(self.min) + self.next.fetch_add(1, Ordering::Relaxed) % self.span
    }
}

/// Simulated worker process.
#[derive(Debug)]
pub struct LocalWorker {
    id: WorkerId,
    settings: WorkerSettings,
    stats: Arc<EngineStats>,
    death_tx: watch::Sender<Option<String>>,
    closed: AtomicBool,
    routers: Mutex<Vec<Weak<LocalRouter>>>,
    ports: Arc<PortRange>,
}

impl LocalWorker {
    /// Simulates an unexpected worker exit: fires the death signal and
    /// closes every router with `WorkerClosed`.
    pub fn kill(&self, reason: &str) {
        let first = self.death_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        });
        if first {
            warn!(target: "sfu.engine.local", worker_id = %self.id, reason, "Worker died");
            self.close_routers();
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Live routers hosted by this worker.
    pub fn routers(&self) -> Vec<Arc<LocalRouter>> {
        let mut routers = lock(&self.routers);
        routers.retain(|r| r.upgrade().is_some_and(|r| !r.closed()));
        routers.iter().filter_map(Weak::upgrade).collect()
    }

    fn close_routers(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let routers = std::mem::take(&mut *lock(&self.routers));
        for router in upgrade_all(routers) {
            router.close_with(CloseReason::WorkerClosed);
        }
    }
}

#[async_trait]
impl EngineWorker for LocalWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn died(&self) -> DeathSignal {
        DeathSignal::new(self.death_tx.subscribe())
    }

    async fn create_router(&self, options: &RouterOptions) -> EngineResult<Arc<dyn EngineRouter>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::WorkerUnavailable(self.id.to_string()));
        }
        if options.media_codecs.is_empty() {
            return Err(EngineError::Rejected("mediaCodecs must not be empty".to_string()));
        }

        let router = Arc::new_cyclic(|self_ref| LocalRouter {
            id: RouterId::new(),
            self_ref: self_ref.clone(),
            codecs: options.media_codecs.clone(),
            stats: Arc::clone(&self.stats),
            ports: Arc::clone(&self.ports),
            close: CloseNotifier::new(),
            transports: Mutex::new(Vec::new()),
            producers: Mutex::new(HashMap::new()),
        });
        EngineStats::bump(&self.stats.routers_created);
        lock(&self.routers).push(Arc::downgrade(&router));

        debug!(
            target: "sfu.engine.local",
            worker_id = %self.id,
            router_id = %router.id,
            "Router created"
        );
        Ok(router)
    }

    fn close(&self) {
        self.close_routers();
    }
}

/// Simulated router.
#[derive(Debug)]
pub struct LocalRouter {
    id: RouterId,
    self_ref: Weak<LocalRouter>,
    codecs: Vec<RtpCodecCapability>,
    stats: Arc<EngineStats>,
    ports: Arc<PortRange>,
    close: CloseNotifier,
    transports: Mutex<Vec<Weak<LocalTransport>>>,
    producers: Mutex<HashMap<ProducerId, Weak<LocalProducer>>>,
}

impl LocalRouter {
    fn close_with(&self, reason: CloseReason) {
        if !self.close.notify(reason) {
            return;
        }
        EngineStats::bump(&self.stats.router_closes);
        let transports = std::mem::take(&mut *lock(&self.transports));
        for transport in upgrade_all(transports) {
            transport.close_with(CloseReason::RouterClosed);
        }
        lock(&self.producers).clear();
        debug!(target: "sfu.engine.local", router_id = %self.id, reason = reason.as_str(), "Router closed");
    }

    pub fn producer(&self, producer_id: ProducerId) -> Option<Arc<LocalProducer>> {
        lock(&self.producers)
            .get(&producer_id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.closed())
    }

    pub fn transport(&self, transport_id: TransportId) -> Option<Arc<LocalTransport>> {
        let transports: Vec<_> = lock(&self.transports).clone();
        upgrade_all(transports).find(|t| t.id == transport_id && !t.closed())
    }

    pub fn consumer(&self, consumer_id: ConsumerId) -> Option<Arc<LocalConsumer>> {
        let transports: Vec<_> = lock(&self.transports).clone();
        upgrade_all(transports).find_map(|t| t.consumer(consumer_id))
    }

    fn supports(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }

    fn register_producer(&self, producer: &Arc<LocalProducer>) {
        lock(&self.producers).insert(producer.id, Arc::downgrade(producer));
    }

    fn unregister_producer(&self, producer_id: ProducerId) {
        lock(&self.producers).remove(&producer_id);
    }

    fn build_transport_parameters(
        &self,
        id: TransportId,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<TransportParameters> {
        if options.listen_ips.is_empty() {
            return Err(EngineError::Rejected("listenIps must not be empty".to_string()));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Rejected(
                "at least one of enableUdp or enableTcp must be true".to_string(),
            ));
        }

        let port = self.ports.allocate();
        let udp_priority = if options.prefer_udp {
            UDP_CANDIDATE_PRIORITY
        } else {
            TCP_CANDIDATE_PRIORITY
        };

        let mut candidates = Vec::new();
        for listen_ip in &options.listen_ips {
            let address = listen_ip
                .announced_ip
                .clone()
                .unwrap_or_else(|| listen_ip.ip.to_string());
            if options.enable_udp {
                candidates.push(json!({
                    "foundation": "udpcandidate",
                    "priority": udp_priority,
                    "ip": address,
                    "address": address,
                    "protocol": "udp",
                    "port": port,
                    "type": "host",
                }));
            }
            if options.enable_tcp {
                candidates.push(json!({
                    "foundation": "tcpcandidate",
                    "priority": TCP_CANDIDATE_PRIORITY,
                    "ip": address,
                    "address": address,
                    "protocol": "tcp",
                    "port": port,
                    "type": "host",
                    "tcpType": "passive",
                }));
            }
        }

        let ufrag = Uuid::new_v4().simple().to_string();
        let fingerprint = Uuid::new_v4()
            .into_bytes()
            .iter()
            .chain(Uuid::new_v4().into_bytes().iter())
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");

        Ok(TransportParameters {
            id,
            ice_parameters: json!({
                "usernameFragment": ufrag.get(..16).unwrap_or(ufrag.as_str()),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            }),
            ice_candidates: Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint }],
            }),
            sctp_parameters: None,
        })
    }
}

/// Finds the first codec in `rtp_capabilities` compatible with `mime_type`.
fn matching_capability(rtp_capabilities: &Value, mime_type: &str) -> Option<Value> {
    rtp_capabilities
        .get("codecs")?
        .as_array()?
        .iter()
        .find(|codec| {
            codec
                .get("mimeType")
                .and_then(Value::as_str)
                .is_some_and(|m| m.eq_ignore_ascii_case(mime_type))
        })
        .cloned()
}

#[async_trait]
impl EngineRouter for LocalRouter {
    fn id(&self) -> RouterId {
        self.id
    }

    fn rtp_capabilities(&self) -> Value {
        let codecs: Vec<Value> = self
            .codecs
            .iter()
            .zip(100u32..)
            .map(|(codec, payload_type)| {
                let mut entry = json!({
                    "kind": codec.kind,
                    "mimeType": codec.mime_type,
                    "clockRate": codec.clock_rate,
                    "preferredPayloadType": payload_type,
                    "parameters": codec.parameters,
                    "rtcpFeedback": [],
                });
                if let (Some(channels), Some(obj)) = (codec.channels, entry.as_object_mut()) {
                    obj.insert("channels".to_string(), json!(channels));
                }
                entry
            })
            .collect();

        json!({ "codecs": codecs, "headerExtensions": [] })
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &Value) -> bool {
        self.producer(producer_id)
            .is_some_and(|p| matching_capability(rtp_capabilities, &p.mime_type).is_some())
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>> {
        if self.close.is_closed() {
            return Err(EngineError::Closed("router"));
        }

        let id = TransportId::new();
        let parameters = self.build_transport_parameters(id, options)?;

        let transport = Arc::new(LocalTransport {
            id,
            parameters,
            stats: Arc::clone(&self.stats),
            connected: AtomicBool::new(false),
            close: CloseNotifier::new(),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            router: self.self_ref.clone(),
        });
        lock(&self.transports).push(Arc::downgrade(&transport));
        EngineStats::bump(&self.stats.transports_created);
        Ok(transport)
    }

    fn close(&self) {
        self.close_with(CloseReason::Explicit);
    }

    fn closed(&self) -> bool {
        self.close.is_closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.close.signal()
    }
}

/// Simulated WebRTC transport.
#[derive(Debug)]
pub struct LocalTransport {
    id: TransportId,
    parameters: TransportParameters,
    stats: Arc<EngineStats>,
    connected: AtomicBool,
    close: CloseNotifier,
    producers: Mutex<Vec<Weak<LocalProducer>>>,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
    router: Weak<LocalRouter>,
}

impl LocalTransport {
    fn close_with(&self, reason: CloseReason) {
        if !self.close.notify(reason) {
            return;
        }
        EngineStats::bump(&self.stats.transport_closes);
        let producers = std::mem::take(&mut *lock(&self.producers));
        for producer in upgrade_all(producers) {
            producer.close_with(CloseReason::TransportClosed);
        }
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in upgrade_all(consumers) {
            consumer.close_with(CloseReason::TransportClosed);
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn consumer(&self, consumer_id: ConsumerId) -> Option<Arc<LocalConsumer>> {
        let consumers: Vec<_> = lock(&self.consumers).clone();
        upgrade_all(consumers).find(|c| c.id == consumer_id)
    }

    fn router(&self) -> EngineResult<Arc<LocalRouter>> {
        self.router
            .upgrade()
            .filter(|r| !r.closed())
            .ok_or(EngineError::Closed("router"))
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, dtls_parameters: &Value) -> EngineResult<()> {
        EngineStats::bump(&self.stats.connect_calls);
        if self.close.is_closed() {
            return Err(EngineError::Closed("transport"));
        }

        let has_fingerprints = dtls_parameters
            .get("fingerprints")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if !has_fingerprints {
            return Err(EngineError::Rejected(
                "invalid dtlsParameters: missing fingerprints".to_string(),
            ));
        }

        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Rejected("connect() already called".to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> EngineResult<Arc<dyn EngineProducer>> {
        if self.close.is_closed() {
            return Err(EngineError::Closed("transport"));
        }
        let router = self.router()?;

        let mime_type = rtp_parameters
            .get("codecs")
            .and_then(Value::as_array)
            .and_then(|codecs| codecs.first())
            .and_then(|codec| codec.get("mimeType"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Rejected("invalid rtpParameters: missing codecs".to_string())
            })?
            .to_string();

        let kind_prefix = format!("{}/", kind.as_str());
        if !mime_type.to_ascii_lowercase().starts_with(&kind_prefix) {
            return Err(EngineError::Rejected(format!(
                "codec {mime_type} does not match kind {kind}"
            )));
        }
        if !router.supports(&mime_type) {
            return Err(EngineError::Rejected(format!("unsupported codec {mime_type}")));
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(),
            kind,
            mime_type,
            rtp_parameters: rtp_parameters.clone(),
            stats: Arc::clone(&self.stats),
            paused: AtomicBool::new(false),
            close: CloseNotifier::new(),
            consumers: Mutex::new(Vec::new()),
            router: Arc::downgrade(&router),
        });
        router.register_producer(&producer);
        lock(&self.producers).push(Arc::downgrade(&producer));
        if self.close.is_closed() {
            producer.close_with(CloseReason::TransportClosed);
        }
        EngineStats::bump(&self.stats.producers_created);
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>> {
        if self.close.is_closed() {
            return Err(EngineError::Closed("transport"));
        }
        let router = self.router()?;
        let producer = router.producer(producer_id).ok_or_else(|| {
            EngineError::Rejected(format!("Producer with id \"{producer_id}\" not found"))
        })?;
        let codec = matching_capability(rtp_capabilities, &producer.mime_type).ok_or_else(|| {
            EngineError::Rejected(format!("cannot consume producer {producer_id}"))
        })?;

        let ssrc = Uuid::new_v4().as_fields().0;
        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            producer_id,
            kind: producer.kind,
            rtp_parameters: json!({
                "codecs": [codec],
                "encodings": [{ "ssrc": ssrc }],
                "rtcp": { "cname": Uuid::new_v4().simple().to_string(), "reducedSize": true },
                "headerExtensions": [],
            }),
            stats: Arc::clone(&self.stats),
            paused: AtomicBool::new(paused),
            producer_paused: AtomicBool::new(producer.paused()),
            close: CloseNotifier::new(),
        });

        lock(&self.consumers).push(Arc::downgrade(&consumer));
        lock(&producer.consumers).push(Arc::downgrade(&consumer));
        if producer.closed() {
            consumer.close_with(CloseReason::ProducerClosed);
        } else if self.close.is_closed() {
            consumer.close_with(CloseReason::TransportClosed);
        }
        EngineStats::bump(&self.stats.consumers_created);
        Ok(consumer)
    }

    fn close(&self) {
        self.close_with(CloseReason::Explicit);
    }

    fn closed(&self) -> bool {
        self.close.is_closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.close.signal()
    }
}

/// Simulated producer.
#[derive(Debug)]
pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    mime_type: String,
    rtp_parameters: Value,
    stats: Arc<EngineStats>,
    paused: AtomicBool,
    close: CloseNotifier,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
    router: Weak<LocalRouter>,
}

impl LocalProducer {
    fn close_with(&self, reason: CloseReason) {
        if !self.close.notify(reason) {
            return;
        }
        EngineStats::bump(&self.stats.producer_closes);
        if let Some(router) = self.router.upgrade() {
            router.unregister_producer(self.id);
        }
        let consumers = std::mem::take(&mut *lock(&self.consumers));
        for consumer in upgrade_all(consumers) {
            consumer.close_with(CloseReason::ProducerClosed);
        }
    }

    /// Pauses the producer. Existing consumers observe it as
    /// `producer_paused`, new consumers start with it set.
    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn resume(&self) {
        self.set_paused(false);
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        let consumers: Vec<_> = lock(&self.consumers).clone();
        for consumer in upgrade_all(consumers) {
            consumer.producer_paused.store(paused, Ordering::SeqCst);
        }
    }

    pub fn rtp_parameters(&self) -> &Value {
        &self.rtp_parameters
    }
}

impl EngineProducer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.close_with(CloseReason::Explicit);
    }

    fn closed(&self) -> bool {
        self.close.is_closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.close.signal()
    }
}

/// Simulated consumer.
#[derive(Debug)]
pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: Value,
    stats: Arc<EngineStats>,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    close: CloseNotifier,
}

impl LocalConsumer {
    fn close_with(&self, reason: CloseReason) {
        if self.close.notify(reason) {
            EngineStats::bump(&self.stats.consumer_closes);
        }
    }
}

#[async_trait]
impl EngineConsumer for LocalConsumer {
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
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> EngineResult<()> {
        EngineStats::bump(&self.stats.resume_calls);
        if self.close.is_closed() {
            return Err(EngineError::Closed("consumer"));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.close_with(CloseReason::Explicit);
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
    use crate::engine::{ListenIp, WorkerLogLevel};
    use std::net::{IpAddr, Ipv4Addr};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            log_level: WorkerLogLevel::Warn,
            log_tags: vec!["ice".to_string()],
            rtc_min_port: 40000,
            rtc_max_port: 40001,
        }
    }

    fn router_options() -> RouterOptions {
        RouterOptions {
            media_codecs: vec![
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
                    parameters: serde_json::Map::new(),
                },
            ],
        }
    }

    fn transport_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_ip: Some("203.0.113.7".to_string()),
            }],
            initial_available_outgoing_bitrate: 1_000_000,
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: true,
        }
    }

    fn dtls() -> Value {
        json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AA" }] })
    }

    fn rtp(mime: &str) -> Value {
        json!({ "codecs": [{ "mimeType": mime, "clockRate": 90000, "payloadType": 101 }] })
    }

    fn caps(mimes: &[&str]) -> Value {
        let codecs: Vec<Value> = mimes.iter().map(|m| json!({ "mimeType": m })).collect();
        json!({ "codecs": codecs })
    }

    async fn router(engine: &LocalEngine) -> Arc<dyn EngineRouter> {
        let worker = engine.create_worker(&settings()).await.unwrap();
        worker.create_router(&router_options()).await.unwrap()
    }

    #[tokio::test]
    async fn test_router_capabilities_list_configured_codecs() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;

        let caps = router.rtp_capabilities();
        assert_eq!(caps["codecs"].as_array().unwrap().len(), 2);
        assert_eq!(caps["codecs"][0]["mimeType"], "audio/opus");
        assert_eq!(caps["codecs"][0]["channels"], 2);
        assert!(caps["codecs"][1].get("channels").is_none());
    }

    #[tokio::test]
    async fn test_transport_parameters_use_announced_ip_and_port_range() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;

        let first = router.create_webrtc_transport(&transport_options()).await.unwrap();
        let second = router.create_webrtc_transport(&transport_options()).await.unwrap();
        let third = router.create_webrtc_transport(&transport_options()).await.unwrap();

        let params = first.parameters();
        assert_eq!(params.ice_candidates[0]["ip"], "203.0.113.7");
        assert_eq!(params.ice_candidates[0]["protocol"], "udp");
        assert_eq!(params.ice_candidates[0]["port"], 40000);
        assert_eq!(second.parameters().ice_candidates[0]["port"], 40001);
        assert_eq!(third.parameters().ice_candidates[0]["port"], 40000);
        assert!(params.sctp_parameters.is_none());
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_transport_requires_a_protocol() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;

        let mut options = transport_options();
        options.enable_udp = false;
        let result = router.create_webrtc_transport(&options).await;
        assert!(matches!(result, Err(EngineError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_connect_validates_and_rejects_second_call() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let transport = router.create_webrtc_transport(&transport_options()).await.unwrap();

        let bad = transport.connect(&json!({})).await;
        assert!(matches!(bad, Err(EngineError::Rejected(_))));

        transport.connect(&dtls()).await.unwrap();
        let again = transport.connect(&dtls()).await;
        assert_eq!(
            again,
            Err(EngineError::Rejected("connect() already called".to_string()))
        );
        assert_eq!(engine.stats().snapshot().connect_calls, 3);
    }

    #[tokio::test]
    async fn test_produce_rejects_unsupported_codec_and_kind_mismatch() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let transport = router.create_webrtc_transport(&transport_options()).await.unwrap();

        let unsupported = transport.produce(MediaKind::Video, &rtp("video/H265")).await;
        assert!(matches!(unsupported, Err(EngineError::Rejected(ref m)) if m.contains("unsupported")));

        let mismatch = transport.produce(MediaKind::Audio, &rtp("video/VP8")).await;
        assert!(matches!(mismatch, Err(EngineError::Rejected(_))));

        let missing = transport.produce(MediaKind::Video, &json!({})).await;
        assert!(matches!(missing, Err(EngineError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_can_consume_matches_mime_type() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let transport = router.create_webrtc_transport(&transport_options()).await.unwrap();
        let producer = transport.produce(MediaKind::Video, &rtp("video/VP8")).await.unwrap();

        assert!(router.can_consume(producer.id(), &caps(&["video/vp8"])));
        assert!(!router.can_consume(producer.id(), &caps(&["audio/opus"])));
        assert!(!router.can_consume(producer.id(), &json!(null)));
        assert!(!router.can_consume(ProducerId::new(), &caps(&["video/VP8"])));
    }

    #[tokio::test]
    async fn test_consume_honours_paused_flag_and_producer_pause() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router.create_webrtc_transport(&transport_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&transport_options()).await.unwrap();
        let producer = send.produce(MediaKind::Audio, &rtp("audio/opus")).await.unwrap();

        let consumer = recv.consume(producer.id(), &caps(&["audio/opus"]), false).await.unwrap();
        assert!(!consumer.paused());
        assert!(!consumer.producer_paused());
        assert_eq!(consumer.producer_id(), producer.id());
        assert_eq!(consumer.kind(), MediaKind::Audio);

        engine.find_producer(producer.id()).unwrap().pause();
        assert!(consumer.producer_paused());

        let paused = recv.consume(producer.id(), &caps(&["audio/opus"]), true).await.unwrap();
        assert!(paused.paused());
        paused.resume().await.unwrap();
        assert!(!paused.paused());
    }

    #[tokio::test]
    async fn test_transport_close_cascades_once() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router.create_webrtc_transport(&transport_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&transport_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, &rtp("video/VP8")).await.unwrap();
        let consumer = recv.consume(producer.id(), &caps(&["video/VP8"]), true).await.unwrap();

        let producer_signal = producer.on_close();
        let consumer_signal = consumer.on_close();

        send.close();
        send.close();
        producer.close();

        assert_eq!(producer_signal.closed().await, Some(CloseReason::TransportClosed));
        assert_eq!(consumer_signal.closed().await, Some(CloseReason::ProducerClosed));

        let stats = engine.stats().snapshot();
        assert_eq!(stats.transport_closes, 1);
        assert_eq!(stats.producer_closes, 1);
        assert_eq!(stats.consumer_closes, 1);
        assert!(engine.find_producer(producer.id()).is_none());
    }

    #[tokio::test]
    async fn test_resume_on_closed_consumer_fails() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router.create_webrtc_transport(&transport_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, &rtp("video/VP8")).await.unwrap();
        let consumer = send.consume(producer.id(), &caps(&["video/VP8"]), true).await.unwrap();

        consumer.close();
        assert_eq!(consumer.resume().await, Err(EngineError::Closed("consumer")));
    }

    #[tokio::test]
    async fn test_kill_fires_death_and_workerclose() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = worker.create_router(&router_options()).await.unwrap();
        let transport = router.create_webrtc_transport(&transport_options()).await.unwrap();

        let death = worker.died();
        let router_signal = router.on_close();

        engine.workers().first().unwrap().kill("segfault");

        assert_eq!(death.died().await.as_deref(), Some("segfault"));
        assert_eq!(router_signal.closed().await, Some(CloseReason::WorkerClosed));
        assert!(transport.closed());

        let again = worker.create_router(&router_options()).await;
        assert!(matches!(again, Err(EngineError::WorkerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_create_worker_rejects_inverted_port_range() {
        let engine = LocalEngine::new();
        let mut bad = settings();
        bad.rtc_min_port = 50000;
        assert!(engine.create_worker(&bad).await.is_err());
    }
}
