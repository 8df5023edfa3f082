use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{delete, get, post},
    Extension, Router,
};
use tower_http::{
    services::ServeDir,
    trace::TraceLayer,
    compression::CompressionLayer,
    limit::RequestBodyLimitLayer,
    cors::{AllowOrigin, CorsLayer},
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::handlers::{
    check_upload, discard_chunks, get_stats, health_check, list_files, merge_chunks, upload_chunk,
};
use crate::middleware::{add_security_headers, validate_api_key};
use crate::state::AppState;
use crate::utils::shutdown_signal;
use crate::config::Config;

// build public router serving merged artifacts under /files
pub fn build_public_router(files_dir: &Path) -> Router {
    tracing::debug!("Building public router for directory: {:?}", files_dir);
    Router::new()
        .nest_service("/files", ServeDir::new(files_dir))
        .layer(axum::middleware::from_fn(add_security_headers))
        .layer(CompressionLayer::new()
            .gzip(true)
            .br(true)
            .zstd(true)
        )
        .layer(TraceLayer::new_for_http())
}

/// upload api routes, without rate limiting or cors
pub fn build_upload_routes(state: Arc<AppState>, config: &Config) -> Router {
    Router::new()
        .route("/api/upload/check", post(check_upload))
        .route("/api/upload/chunk", post(upload_chunk))
        .route("/api/upload/merge", post(merge_chunks))
        .route("/api/upload/chunks/:fingerprint", delete(discard_chunks))
        .route("/api/files", get(list_files))
        .route("/api/stats", get(get_stats))
        .route("/api/health", get(health_check))
        .layer(axum::middleware::from_fn(validate_api_key))
        .layer(Extension(config.api_key_hash.clone()))
        // the multipart extractor has its own 2MB cap; the tower limit below replaces it
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_size))
        .with_state(state)
}

/// build upload api router
pub fn build_api_router(state: Arc<AppState>, config: &Config) -> Router {
    tracing::debug!("Building api router with max request size: {} bytes", config.max_upload_size);

    // configure rate limiting
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            // governor takes the refill interval, not a rate
            .period(config.rate_limit_period())
            .burst_size(config.rate_limit_burst.max(1))
            .finish()
            .expect("rate limit values are non-zero"),
    );

    // configure cors
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_origin(AllowOrigin::list(origins))
        .allow_headers(tower_http::cors::Any);
    // vroom vroom
    build_upload_routes(state, config)
        .layer(GovernorLayer { config: governor_conf })
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// periodically remove abandoned partial chunk sets
pub fn spawn_chunk_sweeper(state: Arc<AppState>, ttl: Duration, every: Duration) -> tokio::task::JoinHandle<()> {
    tracing::debug!("Chunk sweeper: ttl {:?}, interval {:?}", ttl, every);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = state.assembler.sweep_stale(ttl).await {
                tracing::error!("Chunk sweep failed: {}", e);
            }
        }
    })
}

/// Start both public and api servers
pub async fn start_servers(
    public_app: Router,
    api_app: Router,
    public_addr: SocketAddr,
    api_addr: SocketAddr,
) -> std::io::Result<()> {
    tracing::info!("Starting servers...");

    // create listeners
    let public_listener = tokio::net::TcpListener::bind(public_addr).await?;
    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;

    tracing::debug!("Public listener bound to {}", public_addr);
    tracing::debug!("API listener bound to {}", api_addr);

    // start servers
    let public_server = axum::serve(
        public_listener,
        public_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .tcp_nodelay(true);

    let api_server = axum::serve(
        api_listener,
        api_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .tcp_nodelay(true);

    // run servers
    tracing::info!("Servers running and ready to accept connections");
    let _ = tokio::join!(
        async {
            if let Err(e) = public_server.await {
                tracing::error!("Public server error: {}", e);
            }
        },
        async {
            if let Err(e) = api_server.await {
                tracing::error!("API server error: {}", e);
            }
        }
    );
    Ok(())
}

/// print startup banner with server info
pub fn print_startup_banner(config: &Config) {
    tracing::info!("Chunkbox starting...");
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("📡 PUBLIC FILE SERVER: http://{}:{}/files", config.public_host, config.public_port);
    tracing::info!("🔐 UPLOAD API SERVER: http://{}:{}/api", config.api_host, config.api_port);
    tracing::info!("📁 Storage root: {:?}", config.storage_dir.canonicalize().unwrap_or(config.storage_dir.clone()));
    tracing::info!("🧹 Abandoned chunk sets expire after {:?}", config.chunk_ttl);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
