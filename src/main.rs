use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use chunkbox::config::Config;
use chunkbox::state::AppState;
use chunkbox::store::FsChunkStore;
use chunkbox::server::{build_api_router, build_public_router, print_startup_banner, spawn_chunk_sweeper, start_servers};

// use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> ExitCode {
    // load .env file if it exists (fails silently if not found)
    let _ = dotenvy::dotenv();

    // load configuration from environment variables
    let config = Config::from_env();

    // build tokio runtime with configured worker threads
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        // initialize tracing
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();

        match run(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("Fatal: {}", e);
                ExitCode::FAILURE
            }
        }
    })
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // open (and create) the storage layout
    let store = FsChunkStore::open(&config.storage_dir).await?;
    let files_dir = store.files_dir();

    // create shared state
    let state = Arc::new(AppState::new(Arc::new(store), config.verify_chunk_hash));
    let _sweeper = spawn_chunk_sweeper(state.clone(), config.chunk_ttl, config.sweep_interval);

    // build routers
    let public_app = build_public_router(&files_dir);
    let api_app = build_api_router(state, &config);

    // define addresses from config
    let public_addr = SocketAddr::from((
        config.public_host.parse::<std::net::IpAddr>()
            .map_err(|e| format!("Invalid PUBLIC_HOST {}: {}", config.public_host, e))?,
        config.public_port,
    ));
    let api_addr = SocketAddr::from((
        config.api_host.parse::<std::net::IpAddr>()
            .map_err(|e| format!("Invalid API_HOST {}: {}", config.api_host, e))?,
        config.api_port,
    ));

    // print startup information
    print_startup_banner(&config);

    start_servers(public_app, api_app, public_addr, api_addr).await?;
    Ok(())
}
