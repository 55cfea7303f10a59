//! Full orchestration stack for integration tests.
//!
//! [`TestHarness`] starts a worker pool on a [`FaultyEngine`], the room
//! controller and a [`SessionOrchestrator`], plus the HTTP router on demand.

use crate::faulty_engine::FaultyEngine;
use crate::fixtures::{dtls_parameters, rtp_parameters, test_config};
use axum::Router;
use common::types::{MediaKind, ProducerId, TransportId};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use sfu_service::actors::{ActorMetrics, RoomControllerActorHandle};
use sfu_service::engine::local::LocalEngine;
use sfu_service::observability::HealthState;
use sfu_service::orchestrator::SessionOrchestrator;
use sfu_service::pool::WorkerPool;
use sfu_service::routes::{build_routes, AppState};
use std::sync::Arc;

/// Running controller and orchestrator over an in-process engine.
///
/// # Example
/// ```rust,ignore
/// let harness = TestHarness::start(2).await;
/// let transport = harness.connected_transport("room-1", "alice").await;
/// harness.shutdown().await;
/// ```
pub struct TestHarness {
    pub engine: Arc<FaultyEngine>,
    pub pool: Arc<WorkerPool>,
    pub controller: RoomControllerActorHandle,
    pub orchestrator: SessionOrchestrator,
}

impl TestHarness {
    /// Start with `num_workers` fault-free workers.
    pub async fn start(num_workers: usize) -> Self {
        Self::with_engine(FaultyEngine::builder().build(), num_workers).await
    }

    /// Start on an engine built with faults.
    pub async fn with_engine(engine: FaultyEngine, num_workers: usize) -> Self {
        let engine = Arc::new(engine);
        let config = test_config(num_workers);
        let pool = Arc::new(
            WorkerPool::start(engine.as_ref(), num_workers, &config.worker_settings)
                .await
                .expect("worker pool should start"),
        );
        let controller = RoomControllerActorHandle::new(
            Arc::clone(&pool),
            Arc::new(config.media_settings()),
            ActorMetrics::new(),
        );
        let orchestrator = SessionOrchestrator::new(controller.clone());

        Self {
            engine,
            pool,
            controller,
            orchestrator,
        }
    }

    /// The in-process engine behind the fault wrapper.
    #[must_use]
    pub fn local(&self) -> &LocalEngine {
        self.engine.local()
    }

    /// HTTP router over this harness's orchestrator.
    #[must_use]
    pub fn app(&self) -> Router {
        let state = Arc::new(AppState {
            orchestrator: self.orchestrator.clone(),
            health: Arc::new(HealthState::new()),
        });
        build_routes(state, PrometheusBuilder::new().build_recorder().handle())
    }

    /// Create and connect a transport for `client_id`.
    pub async fn connected_transport(&self, room_id: &str, client_id: &str) -> TransportId {
        let transport = self
            .orchestrator
            .create_transport(room_id, client_id)
            .await
            .expect("create_transport should succeed");
        self.orchestrator
            .connect_transport(room_id, client_id, transport.id, dtls_parameters())
            .await
            .expect("connect_transport should succeed");
        transport.id
    }

    /// Produce with the default codec of `kind` on a connected transport.
    pub async fn produce(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: TransportId,
        kind: MediaKind,
    ) -> ProducerId {
        let mime_type = match kind {
            MediaKind::Audio => "audio/opus",
            MediaKind::Video => "video/VP8",
        };
        self.orchestrator
            .produce(
                room_id,
                client_id,
                transport_id,
                kind,
                rtp_parameters(mime_type),
                json!({}),
            )
            .await
            .expect("produce should succeed")
            .producer_id
    }

    /// Kill the engine worker created `index`-th.
    pub fn kill_worker(&self, index: usize, reason: &str) {
        self.local()
            .workers()
            .get(index)
            .expect("worker index out of range")
            .kill(reason);
    }

    /// Stop the controller and close all workers.
    pub async fn shutdown(self) {
        let _ = self.controller.shutdown().await;
        self.pool.close_all();
    }
}
