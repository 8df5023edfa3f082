use std::path::PathBuf;
use std::time::Duration;
use sha2::{Sha256, Digest};

use crate::plan::DEFAULT_CHUNK_SIZE;

// parse an env var, falling back to a default when unset or malformed
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

// booleans accept 1/0, true/false, yes/no, on/off
fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key).map(|v| v.trim().to_ascii_lowercase()) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

/// server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// root of the chunk store (chunks, artifacts, manifests)
    pub storage_dir: PathBuf,
    /// public server address (artifact serving)
    pub public_host: String,
    /// public server port
    pub public_port: u16,
    /// upload api address
    pub api_host: String,
    /// upload api port
    pub api_port: u16,
    /// maximum request body in bytes (one chunk plus form overhead)
    pub max_upload_size: usize,
    /// number of tokio worker threads
    pub worker_threads: usize,
    /// api key for upload authentication (hashed)
    pub api_key_hash: String,
    /// cors allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// rate limit: sustained requests per second per client
    pub rate_limit_per_second: u64,
    /// rate limit: burst size per client
    pub rate_limit_burst: u32,
    /// verify `chunkHash` against received bytes
    pub verify_chunk_hash: bool,
    /// idle time after which a partial chunk set is swept
    pub chunk_ttl: Duration,
    /// how often the sweeper runs
    pub sweep_interval: Duration,
}

impl Config {
    /// load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        // get api key from env and hash it
        let api_key = std::env::var("API_KEY")
            .unwrap_or_else(|_| {
                tracing::warn!("⚠️  No API_KEY set! Using default 'changeme' - CHANGE THIS IN PRODUCTION!");
                "changeme".to_string()
            });

        let api_key_hash = Self::hash_api_key(&api_key);

        // parse cors origins
        let cors_origins = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            storage_dir: std::env::var("STORAGE_DIR")
                .unwrap_or_else(|_| "./storage".to_string())
                .into(),
            public_host: std::env::var("PUBLIC_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            public_port: env_or("PUBLIC_PORT", 4848),
            api_host: std::env::var("API_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            api_port: env_or("API_PORT", 4849),
            max_upload_size: env_or("MAX_UPLOAD_SIZE", 64 * 1024 * 1024), // 64MB default
            worker_threads: env_or("WORKER_THREADS", 8usize).max(1),
            api_key_hash,
            cors_origins,
            rate_limit_per_second: env_or("RATE_LIMIT_PER_SECOND", 50u64).max(1),
            rate_limit_burst: env_or("RATE_LIMIT_BURST", 100u32).max(1),
            verify_chunk_hash: env_flag("VERIFY_CHUNK_HASH", true),
            chunk_ttl: Duration::from_secs(env_or("CHUNK_TTL_SECS", 24 * 60 * 60)),
            sweep_interval: Duration::from_secs(env_or("SWEEP_INTERVAL_SECS", 60 * 60u64).max(1)),
        }
    }

    /// time for one request of the rate-limit quota to refill
    pub fn rate_limit_period(&self) -> Duration {
        let per_second = self.rate_limit_per_second.max(1);
        Duration::from_nanos((1_000_000_000 / per_second).max(1))
    }

    // hash api key using sha256
    pub fn hash_api_key(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// uploader configuration: chunking, concurrency and the three endpoints
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// base url of the upload api, e.g. `http://127.0.0.1:4849`
    pub server_url: String,
    pub check_url: String,
    pub chunk_url: String,
    pub merge_url: String,
    /// sent as `X-API-Key` when present
    pub api_key: Option<String>,
    pub chunk_size: u64,
    pub concurrency: usize,
    /// send a per-chunk MD5 for server-side verification
    pub chunk_hash: bool,
}

impl ClientConfig {
    /// endpoints derived from a server base url
    pub fn for_server(server_url: &str) -> Self {
        let base = server_url.trim_end_matches('/').to_string();
        Self {
            check_url: format!("{}/api/upload/check", base),
            chunk_url: format!("{}/api/upload/chunk", base),
            merge_url: format!("{}/api/upload/merge", base),
            server_url: base,
            api_key: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 3,
            chunk_hash: true,
        }
    }

    /// load client configuration from `CHUNKBOX_*` environment variables
    pub fn from_env() -> Self {
        let server = std::env::var("CHUNKBOX_SERVER")
            .unwrap_or_else(|_| "http://127.0.0.1:4849".to_string());
        let mut config = Self::for_server(&server);

        if let Ok(url) = std::env::var("CHUNKBOX_CHECK_URL") {
            config.check_url = url;
        }
        if let Ok(url) = std::env::var("CHUNKBOX_CHUNK_URL") {
            config.chunk_url = url;
        }
        if let Ok(url) = std::env::var("CHUNKBOX_MERGE_URL") {
            config.merge_url = url;
        }
        config.api_key = std::env::var("CHUNKBOX_API_KEY").ok().filter(|k| !k.is_empty());
        config.chunk_size = env_or("CHUNKBOX_CHUNK_SIZE", DEFAULT_CHUNK_SIZE).max(1);
        config.concurrency = env_or("CHUNKBOX_CONCURRENCY", 3usize).max(1);
        config.chunk_hash = env_flag("CHUNKBOX_CHUNK_HASH", true);
        config
    }
}
