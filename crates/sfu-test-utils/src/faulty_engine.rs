//! Engine wrapper injecting failures and latency.
//!
//! Wraps [`LocalEngine`] and delegates everything except the faults it was
//! built with. Useful for exercising the orchestrator's failure paths.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::FaultyEngine;
//!
//! let engine = FaultyEngine::builder()
//!     .fail_router_creation("out of memory")
//!     .build();
//! ```

use async_trait::async_trait;
use common::types::{MediaKind, ProducerId, RouterId, TransportId, WorkerId};
use serde_json::Value;
use sfu_service::engine::local::LocalEngine;
use sfu_service::engine::{
    CloseSignal, DeathSignal, EngineConsumer, EngineError, EngineProducer, EngineResult,
    EngineRouter, EngineTransport, EngineWorker, MediaEngine, RouterOptions, TransportParameters,
    WebRtcTransportOptions, WorkerSettings,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Faults applied by a [`FaultyEngine`].
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Every router creation fails with this message.
    pub router_failure: Option<String>,
    /// Router creation is delayed by this long.
    pub router_delay: Option<Duration>,
    /// Every transport connect fails with this message.
    pub connect_failure: Option<String>,
}

/// Builder for [`FaultyEngine`].
#[derive(Debug, Default)]
pub struct FaultyEngineBuilder {
    faults: Faults,
}

impl FaultyEngineBuilder {
    /// Fail every router creation.
    #[must_use]
    pub fn fail_router_creation(mut self, message: impl Into<String>) -> Self {
        self.faults.router_failure = Some(message.into());
        self
    }

    /// Delay every router creation.
    #[must_use]
    pub fn delay_router_creation(mut self, delay: Duration) -> Self {
        self.faults.router_delay = Some(delay);
        self
    }

    /// Fail every transport connect.
    #[must_use]
    pub fn fail_connect(mut self, message: impl Into<String>) -> Self {
        self.faults.connect_failure = Some(message.into());
        self
    }

    #[must_use]
    pub fn build(self) -> FaultyEngine {
        FaultyEngine {
            inner: LocalEngine::new(),
            faults: Arc::new(self.faults),
            router_attempts: Arc::new(AtomicU32::new(0)),
        }
    }
}

/// [`LocalEngine`] with injected faults.
pub struct FaultyEngine {
    inner: LocalEngine,
    faults: Arc<Faults>,
    router_attempts: Arc<AtomicU32>,
}

impl FaultyEngine {
    #[must_use]
    pub fn builder() -> FaultyEngineBuilder {
        FaultyEngineBuilder::default()
    }

    /// The wrapped engine, for stats and worker kills.
    #[must_use]
    pub fn local(&self) -> &LocalEngine {
        &self.inner
    }

    /// Router creations attempted, including failed ones.
    #[must_use]
    pub fn router_attempts(&self) -> u32 {
        self.router_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for FaultyEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
    ) -> EngineResult<Arc<dyn EngineWorker>> {
        let inner = self.inner.create_worker(settings).await?;
        Ok(Arc::new(FaultyWorker {
            inner,
            faults: Arc::clone(&self.faults),
            router_attempts: Arc::clone(&self.router_attempts),
        }))
    }
}

struct FaultyWorker {
    inner: Arc<dyn EngineWorker>,
    faults: Arc<Faults>,
    router_attempts: Arc<AtomicU32>,
}

#[async_trait]
impl EngineWorker for FaultyWorker {
    fn id(&self) -> WorkerId {
        self.inner.id()
    }

    fn died(&self) -> DeathSignal {
        self.inner.died()
    }

    async fn create_router(&self, options: &RouterOptions) -> EngineResult<Arc<dyn EngineRouter>> {
        self.router_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.faults.router_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.faults.router_failure {
            return Err(EngineError::Rejected(message.clone()));
        }
        let inner = self.inner.create_router(options).await?;
        Ok(Arc::new(FaultyRouter {
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn close(&self) {
        self.inner.close();
    }
}

struct FaultyRouter {
    inner: Arc<dyn EngineRouter>,
    faults: Arc<Faults>,
}

#[async_trait]
impl EngineRouter for FaultyRouter {
    fn id(&self) -> RouterId {
        self.inner.id()
    }

    fn rtp_capabilities(&self) -> Value {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &Value) -> bool {
        self.inner.can_consume(producer_id, rtp_capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn EngineTransport>> {
        let inner = self.inner.create_webrtc_transport(options).await?;
        Ok(Arc::new(FaultyTransport {
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }

    fn close(&self) {
        self.inner.close();
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.inner.on_close()
    }
}

struct FaultyTransport {
    inner: Arc<dyn EngineTransport>,
    faults: Arc<Faults>,
}

#[async_trait]
impl EngineTransport for FaultyTransport {
    fn id(&self) -> TransportId {
        self.inner.id()
    }

    fn parameters(&self) -> TransportParameters {
        self.inner.parameters()
    }

    async fn connect(&self, dtls_parameters: &Value) -> EngineResult<()> {
        if let Some(message) = &self.faults.connect_failure {
            return Err(EngineError::Rejected(message.clone()));
        }
        self.inner.connect(dtls_parameters).await
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> EngineResult<Arc<dyn EngineProducer>> {
        self.inner.produce(kind, rtp_parameters).await
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &Value,
        paused: bool,
    ) -> EngineResult<Arc<dyn EngineConsumer>> {
        self.inner.consume(producer_id, rtp_capabilities, paused).await
    }

    fn close(&self) {
        self.inner.close();
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }

    fn on_close(&self) -> CloseSignal {
        self.inner.on_close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{dtls_parameters, test_config};

    #[tokio::test]
    async fn test_router_failure_is_injected() {
        let engine = FaultyEngine::builder().fail_router_creation("boom").build();
        let config = test_config(1);
        let worker = engine.create_worker(&config.worker_settings).await.unwrap();

        let result = worker.create_router(&config.media_settings().router).await;
        assert!(matches!(result, Err(EngineError::Rejected(ref m)) if m == "boom"));
        assert_eq!(engine.router_attempts(), 1);
        assert_eq!(engine.local().stats().snapshot().routers_created, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_injected() {
        let engine = FaultyEngine::builder().fail_connect("dtls failure").build();
        let config = test_config(1);
        let media = config.media_settings();
        let worker = engine.create_worker(&config.worker_settings).await.unwrap();
        let router = worker.create_router(&media.router).await.unwrap();
        let transport = router
            .create_webrtc_transport(&media.webrtc_transport)
            .await
            .unwrap();

        let result = transport.connect(&dtls_parameters()).await;
        assert!(matches!(result, Err(EngineError::Rejected(_))));
        assert_eq!(engine.local().stats().snapshot().connect_calls, 0);
    }

    #[tokio::test]
    async fn test_no_faults_delegates() {
        let engine = FaultyEngine::builder().build();
        let config = test_config(1);
        let media = config.media_settings();
        let worker = engine.create_worker(&config.worker_settings).await.unwrap();
        let router = worker.create_router(&media.router).await.unwrap();
        let transport = router
            .create_webrtc_transport(&media.webrtc_transport)
            .await
            .unwrap();

        transport.connect(&dtls_parameters()).await.unwrap();
        assert_eq!(engine.local().stats().snapshot().connect_calls, 1);
    }
}
