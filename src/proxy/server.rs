//! HTTP server setup and background maintenance tasks.

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::config::{Config, DispatchConfig};
use crate::error::Error;
use crate::router::EndpointRegistry;
use crate::storage::TokenLedger;

/// How often the config file's modification time is checked.
pub const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How often idle rate counters and expired circuits are tidied.
const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EndpointRegistry>,
    pub ledger: Arc<TokenLedger>,
    pub http_client: Client,
    pub dispatch: DispatchConfig,
}

impl AppState {
    /// Build state from a loaded config, opening the ledger at its configured path.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            registry: Arc::new(EndpointRegistry::new(config.apis.clone())),
            ledger: Arc::new(TokenLedger::open(&config.ledger.path)),
            http_client: build_http_client()?,
            dispatch: config.dispatch.clone(),
        })
    }
}

/// Upstream HTTP client. Timeouts are applied per request.
pub fn build_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("llmpool/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::dispatch))
        .route("/v1/completions", post(handlers::dispatch))
        .route("/v1/embeddings", post(handlers::dispatch))
        .route("/v1/moderations", post(handlers::dispatch))
        .route("/v1/models", get(handlers::dispatch))
        .route("/v1/models/:model", get(handlers::dispatch))
        // Pool extensions
        .route("/v1/status", get(handlers::status))
        .route("/v1/token/stats", get(handlers::token_stats))
        .route("/v1/token/reset", post(handlers::token_reset))
        .route("/health", get(handlers::health))
        .fallback(handlers::not_found)
        .with_state(state);

    with_boundaries(router)
}

/// Tracing, CORS and the panic boundary shared by every route.
fn with_boundaries(router: Router) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(CatchPanicLayer::custom(panic_response)),
    )
}

/// A handler panic becomes a generic 500; the detail only reaches the log.
fn panic_response(payload: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    Error::Internal(format!("handler panicked: {}", detail)).into_response()
}

/// Run the HTTP server until Ctrl-C or SIGTERM.
///
/// When `config_path` is given the file is watched and endpoint changes are
/// applied without a restart.
pub async fn run_server(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let state = AppState::from_config(&config)?;

    let endpoints = state.registry.endpoints();
    let usable = endpoints.iter().filter(|e| e.is_structurally_valid()).count();
    if usable < endpoints.len() {
        tracing::warn!(
            skipped = endpoints.len() - usable,
            "Some endpoints are missing id, name, baseUrl or apiKey and will never be selected"
        );
    }

    spawn_ledger_pruner(
        state.ledger.clone(),
        Duration::from_secs(config.ledger.prune_interval_secs.max(1)),
    );
    spawn_health_sweeper(state.registry.clone());
    if let Some(path) = config_path {
        spawn_config_watcher(path, state.registry.clone(), RELOAD_POLL_INTERVAL);
    }

    spawn_ledger_writer(state.ledger.clone());
    let ledger = state.ledger.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(
        address = %listen_addr,
        endpoints = usable,
        "Starting llmpool proxy server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Changes recorded after the writer's last pass
    tokio::task::spawn_blocking(move || ledger.flush()).await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Persist ledger changes off the request path.
pub fn spawn_ledger_writer(ledger: Arc<TokenLedger>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(ledger.run_writer())
}

/// Periodically drop stale hourly and daily ledger buckets.
pub fn spawn_ledger_pruner(ledger: Arc<TokenLedger>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            ledger.prune();
        }
    })
}

/// Periodically roll idle rate counters and close expired circuits.
pub fn spawn_health_sweeper(registry: Arc<EndpointRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            registry.rate_limiter().sweep();
            registry.breakers().sweep();
        }
    })
}

async fn modified_at(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Poll `path` and swap the registry's endpoints whenever the file changes.
///
/// A file that fails to parse leaves the current endpoints in place.
pub fn spawn_config_watcher(
    path: PathBuf,
    registry: Arc<EndpointRegistry>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = modified_at(&path).await;
        let mut interval = tokio::time::interval(every);
        interval.tick().await;

        loop {
            interval.tick().await;
            let current = modified_at(&path).await;
            if current.is_none() || current == last_seen {
                continue;
            }
            last_seen = current;

            tracing::info!(path = %path.display(), "Config file changed, reloading endpoints");
            match Config::from_file(&path) {
                Ok(config) => registry.reload(config.apis),
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "Config reload failed, keeping previous endpoints"
                    );
                }
            }
        }
    })
}
