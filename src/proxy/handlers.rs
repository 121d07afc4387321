//! HTTP request handlers.
//!
//! [`dispatch`] serves every OpenAI-compatible route: it picks an endpoint,
//! forwards the request, classifies the outcome and fails over until an
//! endpoint answers usefully. The remaining handlers expose health, quota
//! and token accounting.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::Instrument;

use super::retry::{format_attempts, retry_with_failover, AttemptFailure, RetryError, RetryPolicy};
use super::server::AppState;
use super::stream::observe_usage;
use super::usage::{extract_usage, is_empty_response};
use crate::config::EndpointConfig;
use crate::error::Error;
use crate::router::CircuitBreakerRegistry;

/// Service name reported by the status and health routes.
pub const SERVICE_NAME: &str = "llmpool";

/// Upstream response headers never relayed to the client.
fn is_stripped_header(name: &HeaderName) -> bool {
    *name == header::CONTENT_ENCODING
        || *name == header::TRANSFER_ENCODING
        || *name == header::CONNECTION
}

/// The parts of an inbound request needed to forward it.
#[derive(Debug)]
struct InboundRequest {
    method: Method,
    path: String,
    query: Option<String>,
    body: Option<Value>,
    model: Option<String>,
    stream: bool,
}

impl InboundRequest {
    /// Decode the body of a non-GET request. An empty body is treated as `{}`.
    fn parse(method: Method, uri: &Uri, body: &[u8]) -> Result<Self, Error> {
        let body = if method == Method::GET {
            None
        } else if body.iter().all(u8::is_ascii_whitespace) {
            Some(Value::Object(Default::default()))
        } else {
            let value = serde_json::from_slice::<Value>(body)
                .map_err(|e| Error::BadRequest(format!("Invalid JSON body: {}", e)))?;
            Some(value)
        };

        let model = body
            .as_ref()
            .and_then(|b| b.get("model"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let stream = body
            .as_ref()
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            body,
            model,
            stream,
        })
    }

    /// The body to send to `api`, with the model renamed if it maps it.
    fn body_for(&self, api: &EndpointConfig) -> Option<Value> {
        let mut body = self.body.clone()?;
        let requested = self.model.as_deref();
        if let Some(mapped) = requested.and_then(|m| api.mapped_model(m)) {
            tracing::info!(
                endpoint = %api.name,
                model = ?requested,
                mapped_model = %mapped,
                "Applying model mapping"
            );
            if let Some(object) = body.as_object_mut() {
                object.insert("model".to_string(), Value::from(mapped));
            }
        }
        Some(body)
    }
}

/// Join an endpoint base URL and an inbound path so exactly one `/v1`
/// segment precedes the route. The query string is appended verbatim.
pub fn upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let relative = path.strip_prefix("/v1").unwrap_or(path);
    let relative = relative.trim_start_matches('/');
    let base = base_url.trim_end_matches('/');

    let mut url = if base.contains("/v1") {
        format!("{}/{}", base, relative)
    } else {
        format!("{}/v1/{}", base, relative)
    };
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Why one forwarding attempt did not produce a usable response.
#[derive(Debug)]
enum ForwardFailure {
    /// No response reached us.
    Transport(String),
    /// A successful status carrying nothing useful.
    Empty(String),
    /// An upstream error response, kept so it can be relayed.
    Upstream {
        status: StatusCode,
        content_type: Option<HeaderValue>,
        body: Bytes,
        retryable: bool,
    },
}

impl AttemptFailure for ForwardFailure {
    fn is_retryable(&self) -> bool {
        match self {
            ForwardFailure::Upstream { retryable, .. } => *retryable,
            _ => true,
        }
    }

    fn has_response(&self) -> bool {
        matches!(self, ForwardFailure::Upstream { .. })
    }

    fn reason(&self) -> String {
        match self {
            ForwardFailure::Transport(message) => format!("transport: {}", message),
            ForwardFailure::Empty(message) => format!("empty: {}", message),
            ForwardFailure::Upstream { status, .. } => format!("status {}", status.as_u16()),
        }
    }
}

impl IntoResponse for ForwardFailure {
    fn into_response(self) -> Response {
        match self {
            ForwardFailure::Transport(message) => Error::Gateway(message).into_response(),
            ForwardFailure::Empty(message) => Error::Internal(message).into_response(),
            ForwardFailure::Upstream {
                status,
                content_type,
                body,
                ..
            } => {
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    content_type.unwrap_or(HeaderValue::from_static("application/json")),
                );
                response
            }
        }
    }
}

/// Handle every proxied OpenAI-compatible route.
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, Error> {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("dispatch", request_id = %request_id, path = %uri.path());

    let request = InboundRequest::parse(method, &uri, &body)?;
    run_dispatch(&state, request).instrument(span).await
}

async fn run_dispatch(state: &AppState, request: InboundRequest) -> Result<Response, Error> {
    let model = request.model.as_deref();
    tracing::info!(
        method = %request.method,
        model = ?model,
        stream = request.stream,
        "Received proxy request"
    );

    let no_endpoints = || Error::NoEndpoints {
        model: model.unwrap_or("any").to_string(),
    };

    if state.registry.available_endpoints(model).is_empty() {
        tracing::error!(model = ?model, "No available endpoint for request");
        return Err(no_endpoints());
    }

    let request = &request;
    let outcome = retry_with_failover(
        RetryPolicy::from(&state.dispatch),
        |tried| state.registry.pick(model, tried),
        move |api, attempt| forward_once(state, request, api, attempt),
    )
    .await;

    match outcome.result {
        Ok(response) => Ok(response),
        Err(RetryError::Rejected(failure)) => {
            tracing::warn!(reason = %failure.reason(), "Client error relayed without retry");
            Ok(failure.into_response())
        }
        Err(RetryError::Exhausted(failure)) => {
            tracing::error!(
                attempts = %format_attempts(&outcome.attempts).unwrap_or_default(),
                reason = %failure.reason(),
                "Proxy request failed after all attempts"
            );
            Ok(failure.into_response())
        }
        Err(RetryError::NoCandidates) => {
            tracing::error!(model = ?model, "Endpoints became unavailable before the first attempt");
            Err(no_endpoints())
        }
    }
}

/// Forward one attempt to `api` and classify what came back.
async fn forward_once(
    state: &AppState,
    request: &InboundRequest,
    api: Arc<EndpointConfig>,
    attempt: u32,
) -> Result<Response, ForwardFailure> {
    let url = upstream_url(&api.base_url, &request.path, request.query.as_deref());
    let body = request.body_for(&api);

    state.registry.rate_limiter().record_use(&api.id);
    tracing::info!(attempt, endpoint = %api.name, url = %url, "Forwarding request");

    let mut builder = state
        .http_client
        .request(request.method.clone(), &url)
        .bearer_auth(api.api_key.expose_secret());
    if let Some(body) = &body {
        builder = builder.json(body);
    }

    if request.stream {
        forward_streaming(state, api, builder).await
    } else {
        let builder = builder.timeout(state.dispatch.upstream_timeout());
        forward_buffered(state, &api, builder).await
    }
}

fn transport_failure(
    breakers: &CircuitBreakerRegistry,
    api: &EndpointConfig,
    error: reqwest::Error,
) -> ForwardFailure {
    let message = format!("{}: {}", api.name, error);
    breakers.record_error(&api.id, "transport", &message);
    ForwardFailure::Transport(message)
}

fn content_type(headers: &HeaderMap) -> Option<HeaderValue> {
    headers.get(header::CONTENT_TYPE).cloned()
}

async fn forward_buffered(
    state: &AppState,
    api: &EndpointConfig,
    builder: RequestBuilder,
) -> Result<Response, ForwardFailure> {
    let breakers = state.registry.breakers();
    let response = builder
        .send()
        .await
        .map_err(|e| transport_failure(breakers, api, e))?;

    let status = response.status();
    let headers = response.headers().clone();
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response
        .bytes()
        .await
        .map_err(|e| transport_failure(breakers, api, e))?;

    if status.is_server_error() {
        breakers.record_error(&api.id, "5xx", &format!("status {}", status.as_u16()));
        return Err(ForwardFailure::Upstream {
            status,
            content_type: content_type(&headers),
            body,
            retryable: true,
        });
    }

    if status == StatusCode::OK && is_empty_response(content_length, &body) {
        let message = format!("Empty response from {} (status {})", api.name, status.as_u16());
        breakers.record_error(&api.id, "empty", &message);
        return Err(ForwardFailure::Empty(message));
    }

    if status.is_client_error() {
        return Err(ForwardFailure::Upstream {
            status,
            content_type: content_type(&headers),
            body,
            retryable: false,
        });
    }

    breakers.record_success(&api.id);
    let usage = serde_json::from_slice::<Value>(&body)
        .ok()
        .as_ref()
        .and_then(extract_usage);
    if let Some(usage) = usage {
        state.ledger.record(
            &api.id,
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
        );
    }

    tracing::info!(endpoint = %api.name, status = status.as_u16(), "Request succeeded");
    Ok(build_response(status, &headers, Body::from(body)))
}

/// Forward a streaming request. Only a 200 is piped through; anything else
/// is drained and reported as a retryable failure.
async fn forward_streaming(
    state: &AppState,
    api: Arc<EndpointConfig>,
    builder: RequestBuilder,
) -> Result<Response, ForwardFailure> {
    let breakers = state.registry.breakers();
    let timeout = state.dispatch.upstream_timeout();

    let response = match tokio::time::timeout(timeout, builder.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(transport_failure(breakers, &api, e)),
        Err(_) => {
            let message = format!("{}: no response within {}s", api.name, timeout.as_secs());
            breakers.record_error(&api.id, "transport", &message);
            return Err(ForwardFailure::Transport(message));
        }
    };

    let status = response.status();
    let headers = response.headers().clone();

    if status != StatusCode::OK {
        let body = response.bytes().await.unwrap_or_default();
        if status.is_server_error() {
            breakers.record_error(&api.id, "5xx", &format!("status {}", status.as_u16()));
        }
        return Err(ForwardFailure::Upstream {
            status,
            content_type: content_type(&headers),
            body,
            retryable: true,
        });
    }

    tracing::info!(endpoint = %api.name, "Streaming response started");

    let endpoint_name = api.name.clone();
    let upstream = response.bytes_stream().map(move |chunk| {
        if let Err(e) = &chunk {
            tracing::warn!(endpoint = %endpoint_name, error = %e, "Upstream stream error");
        }
        chunk
    });

    let registry = state.registry.clone();
    let ledger = state.ledger.clone();
    let body = observe_usage(upstream, move |usage| {
        registry.breakers().record_success(&api.id);
        ledger.record(
            &api.id,
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
        );
    });

    Ok(build_response(status, &headers, Body::from_stream(body)))
}

/// Copy status and headers from the upstream, minus hop-specific ones.
fn build_response(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in upstream_headers {
        if !is_stripped_header(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    response
}

fn render_limit(limit: i64) -> Value {
    if limit < 0 {
        Value::from("unlimited")
    } else {
        Value::from(limit)
    }
}

/// Handle GET /v1/status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let apis: Vec<Value> = state
        .registry
        .status()
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "enabled": s.enabled,
                "available": s.available,
                "temporarily_disabled": s.temporarily_disabled,
                "circuit": s.circuit.as_str(),
                "error_count": s.error_count,
                "trip_count": s.trip_count,
                "last_error": s.last_error,
                "disabled_for_secs": s.disabled_for_secs,
                "limits": {
                    "rpm": render_limit(s.rpm_limit),
                    "rpd": render_limit(s.rpd_limit),
                },
                "usage": {
                    "rpm": s.rpm_used,
                    "rpd": s.rpd_used,
                },
            })
        })
        .collect();

    Json(json!({
        "service": SERVICE_NAME,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "apis": apis,
    }))
}

/// Handle GET /v1/token/stats
pub async fn token_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "summary": state.ledger.summary(),
        "details": state.ledger.details(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ResetRequest {
    #[serde(default, rename = "apiId", alias = "api_id")]
    api_id: Option<String>,
}

/// Handle POST /v1/token/reset
pub async fn token_reset(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ResetRequest::default()
    } else {
        serde_json::from_slice::<ResetRequest>(&body)
            .map_err(|e| Error::BadRequest(format!("Invalid JSON body: {}", e)))?
    };

    state.ledger.reset(request.api_id.as_deref())?;

    let message = match &request.api_id {
        Some(id) => format!("Token stats for '{}' reset", id),
        None => "All token stats reset".to_string(),
    };
    Ok(Json(json!({ "success": true, "message": message })))
}

/// JSON 404 for unrouted paths.
pub async fn not_found(uri: Uri) -> Error {
    Error::NotFound(format!("route {} does not exist", uri.path()))
}

/// Handle GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
    }))
}
