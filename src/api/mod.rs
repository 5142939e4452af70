//! HTTP API using Axum.
//!
//! Provides endpoints for:
//! - Listing the whitelist (`GET /`)
//! - Adding an entry (`POST /`)
//! - Removing an entry (`DELETE /:dest_port/:source_ip_range`, `DELETE /:dest_port`)
//! - Health checks (`GET /healthz`)

mod handlers;
mod server;

pub use handlers::{ApiError, HealthResponse};
pub use server::{AppState, build_router, serve, shutdown_signal};
