//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use http::Request;
use serde_json::Value;
use tower::ServiceExt;

use llmpool::config::{DispatchConfig, EndpointConfig, UNLIMITED};
use llmpool::proxy::{build_http_client, create_router, AppState};
use llmpool::router::EndpointRegistry;
use llmpool::storage::TokenLedger;

/// An enabled, unlimited endpoint serving the models the tests request.
pub fn endpoint(id: &str, base_url: &str) -> EndpointConfig {
    EndpointConfig {
        id: id.to_string(),
        name: format!("{}-name", id),
        base_url: base_url.to_string(),
        api_key: format!("sk-{}", id).into(),
        enabled: true,
        rpm: UNLIMITED,
        rpd: UNLIMITED,
        models: vec!["gpt-4".to_string(), "text-embedding-3-small".to_string()],
        model_mapping: HashMap::new(),
    }
}

/// Dispatch settings with no backoff so failover tests run instantly.
pub fn fast_dispatch() -> DispatchConfig {
    DispatchConfig {
        max_attempts: 10,
        backoff_ms: 0,
        upstream_timeout_secs: 5,
    }
}

pub fn state_with(endpoints: Vec<EndpointConfig>, ledger: TokenLedger) -> AppState {
    AppState {
        registry: Arc::new(EndpointRegistry::new(endpoints)),
        ledger: Arc::new(ledger),
        http_client: build_http_client().expect("http client"),
        dispatch: fast_dispatch(),
    }
}

pub fn state(endpoints: Vec<EndpointConfig>) -> AppState {
    state_with(endpoints, TokenLedger::ephemeral())
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Send one request through a fresh router and return status and raw body.
pub async fn send(state: &AppState, request: Request<Body>) -> (http::StatusCode, bytes::Bytes) {
    let response = create_router(state.clone())
        .oneshot(request)
        .await
        .expect("router is infallible");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    (status, body)
}

pub async fn send_json(state: &AppState, request: Request<Body>) -> (http::StatusCode, Value) {
    let (status, body) = send(state, request).await;
    let json = serde_json::from_slice(&body).unwrap_or_default();
    (status, json)
}
