//! SFU Service Library
//!
//! Room, worker and session orchestration in front of a media engine.
//! Clients signal over HTTP; media flows between clients and the engine.
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/rooms.rs -> orchestrator.rs -> actors/* -> engine (workers from pool.rs)
//! ```
//!
//! # Modules
//!
//! - `actors` - Controller, room and client session actors
//! - `config` - Service configuration from environment
//! - `engine` - Media engine boundary and the in-process engine
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `observability` - Metrics and health checks
//! - `orchestrator` - The eight signaling operations
//! - `pool` - Engine worker pool
//! - `routes` - Axum router setup

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod observability;
pub mod orchestrator;
pub mod pool;
pub mod routes;
