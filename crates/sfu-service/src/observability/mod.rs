//! Observability for the SFU service.
//!
//! Actor run loops and HTTP handlers use `#[instrument(skip_all)]` with an
//! explicit allow-list of fields (room id, client id, resource ids). Metric
//! labels never carry ids.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Registered rooms |
//! | `sfu_sessions_active` | Gauge | none | Client sessions across rooms |
//! | `sfu_workers_active` | Gauge | none | Engine workers started at boot |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure per actor type |
//! | `sfu_operations_total` | Counter | `operation`, `status` | Signaling operations |
//! | `sfu_operation_duration_seconds` | Histogram | `operation` | Operation latency |
//! | `sfu_operation_errors_total` | Counter | `operation`, `error_type` | Failures by kind |
//! | `sfu_room_creation_duration_seconds` | Histogram | none | Router setup time |
//! | `sfu_resources_retired_total` | Counter | `resource`, `reason` | Transport/producer/consumer removals |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Bugs |
//! | `sfu_worker_deaths_total` | Counter | none | Fatal engine failures |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
