//! HTTP request handlers for the SFU signaling surface.

pub mod metrics;
pub mod rooms;

pub use metrics::metrics_handler;
pub use rooms::{
    connect_transport, consume, create_transport, disconnect, get_router_rtp_capabilities,
    list_producers, produce, resume_consumer,
};
