mod api;
mod auth;
mod broker;
mod config;
mod cors;
mod db;
mod error;
mod flush;
mod queue;
mod recurring;
mod state;
mod store;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::capability::CapabilityTokenService;
use crate::config::RelayConfig;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::state::AppState;
use crate::store::{DocumentStore, PendingStore, SearchIndex};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const FLUSH_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using the development capability token secret; set FORMSYNC_RELAY_JWT_SECRET");
    }

    let tokens = CapabilityTokenService::new(&config.jwt_secret)
        .context("invalid capability token secret")?;

    let (documents, search, pending) = match &config.database_url {
        Some(url) => {
            let pool = db::pool::connect(url, &config).await?;
            db::pool::ping(&pool).await?;
            db::migrations::run_migrations(&pool).await?;
            (
                DocumentStore::Postgres(pool.clone()),
                SearchIndex::Postgres(pool.clone()),
                PendingStore::Postgres(pool),
            )
        }
        None => {
            warn!("FORMSYNC_RELAY_DATABASE_URL unset; running with in-memory stores");
            (DocumentStore::memory(), SearchIndex::memory(), PendingStore::memory())
        }
    };

    let state = AppState::new(tokens, documents, search, pending, config.autosave_debounce);

    // Catch-all behind the per-document debounce timers.
    state.flush.spawn_sweep(FLUSH_SWEEP_INTERVAL);

    let app = build_router(state, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting formsync relay");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/v1/subscriptions", get(ws::subscriptions_route))
            .route("/v1/forms/{form_id}/edits", post(api::submit_edit))
            .with_state(state)
            .layer(cors::cors_layer(cors_origins)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response =
        with_request_id_scope(request_id.clone(), async move { next.run(request).await }).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
