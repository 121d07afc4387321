//! llmpool - load-balancing reverse proxy for OpenAI-compatible APIs
//!
//! This library provides the core functionality for the llmpool proxy:
//! configuration, endpoint health and quota tracking, failover dispatch
//! and token accounting.

pub mod config;
pub mod error;
pub mod proxy;
pub mod router;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
