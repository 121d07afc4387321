//! HTTP proxy server module.
//!
//! This module provides the OpenAI-compatible HTTP API that accepts
//! requests and forwards them across the endpoint pool.

mod handlers;
pub mod retry;
mod server;
pub mod stream;
pub mod usage;

pub use handlers::{upstream_url, SERVICE_NAME};
pub use server::{
    build_http_client, create_router, run_server, spawn_config_watcher, spawn_health_sweeper,
    spawn_ledger_pruner, spawn_ledger_writer, AppState, RELOAD_POLL_INTERVAL,
};
pub use stream::{observe_usage, UsageExtractor};
pub use usage::{extract_usage, is_empty_response, TokenUsage};
