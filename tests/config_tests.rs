use chunkbox::config::{ClientConfig, Config};
use std::env;
use std::time::Duration;

const SERVER_VARS: &[&str] = &[
    "STORAGE_DIR",
    "PUBLIC_HOST",
    "PUBLIC_PORT",
    "API_HOST",
    "API_PORT",
    "MAX_UPLOAD_SIZE",
    "WORKER_THREADS",
    "API_KEY",
    "CORS_ORIGINS",
    "RATE_LIMIT_PER_SECOND",
    "RATE_LIMIT_BURST",
    "VERIFY_CHUNK_HASH",
    "CHUNK_TTL_SECS",
    "SWEEP_INTERVAL_SECS",
];

const CLIENT_VARS: &[&str] = &[
    "CHUNKBOX_SERVER",
    "CHUNKBOX_CHECK_URL",
    "CHUNKBOX_CHUNK_URL",
    "CHUNKBOX_MERGE_URL",
    "CHUNKBOX_API_KEY",
    "CHUNKBOX_CHUNK_SIZE",
    "CHUNKBOX_CONCURRENCY",
    "CHUNKBOX_CHUNK_HASH",
];

// helper to clear env vars
fn clear_env() {
    for var in SERVER_VARS.iter().chain(CLIENT_VARS) {
        env::remove_var(var);
    }
}

#[test]
fn test_hash_api_key() {
    let key = "secret";
    let hash = Config::hash_api_key(key);
    // sha256 hex string is 64 chars
    assert_eq!(hash.len(), 64);

    // deterministic
    assert_eq!(hash, Config::hash_api_key(key));

    // different keys produce different hashes
    assert_ne!(hash, Config::hash_api_key("other"));
}

#[test]
fn test_client_endpoints_from_base_url() {
    let config = ClientConfig::for_server("http://uploads.example.com:8080/");
    assert_eq!(config.server_url, "http://uploads.example.com:8080");
    assert_eq!(config.check_url, "http://uploads.example.com:8080/api/upload/check");
    assert_eq!(config.chunk_url, "http://uploads.example.com:8080/api/upload/chunk");
    assert_eq!(config.merge_url, "http://uploads.example.com:8080/api/upload/merge");
    assert_eq!(config.chunk_size, 2 * 1024 * 1024);
    assert_eq!(config.concurrency, 3);
    assert!(config.api_key.is_none());
}

#[test]
fn test_config_behavior() {
    // everything touching the environment runs in this one test

    // 1. server defaults
    clear_env();

    let config = Config::from_env();

    assert_eq!(config.storage_dir.to_str().unwrap(), "./storage");
    assert_eq!(config.public_host, "127.0.0.1");
    assert_eq!(config.public_port, 4848);
    assert_eq!(config.api_port, 4849);
    assert_eq!(config.worker_threads, 8);
    assert_eq!(config.rate_limit_per_second, 50);
    assert!(config.verify_chunk_hash);
    assert_eq!(config.chunk_ttl, Duration::from_secs(24 * 60 * 60));
    assert_eq!(config.api_key_hash, Config::hash_api_key("changeme"));

    // 2. server from env
    clear_env();

    env::set_var("STORAGE_DIR", "/tmp/chunkbox_test");
    env::set_var("API_PORT", "9090");
    env::set_var("WORKER_THREADS", "4");
    env::set_var("API_KEY", "supersecret");
    env::set_var("VERIFY_CHUNK_HASH", "off");
    env::set_var("CHUNK_TTL_SECS", "60");
    env::set_var("PUBLIC_PORT", "not-a-port");

    let config = Config::from_env();

    assert_eq!(config.storage_dir.to_str().unwrap(), "/tmp/chunkbox_test");
    assert_eq!(config.api_port, 9090);
    assert_eq!(config.public_port, 4848);
    assert_eq!(config.worker_threads, 4);
    assert!(!config.verify_chunk_hash);
    assert_eq!(config.chunk_ttl, Duration::from_secs(60));
    assert_eq!(config.api_key_hash, Config::hash_api_key("supersecret"));

    // 3. client defaults and overrides
    clear_env();

    let client = ClientConfig::from_env();
    assert_eq!(client.check_url, "http://127.0.0.1:4849/api/upload/check");
    assert!(client.chunk_hash);

    env::set_var("CHUNKBOX_SERVER", "http://files.internal:7000");
    env::set_var("CHUNKBOX_MERGE_URL", "http://merger.internal/merge");
    env::set_var("CHUNKBOX_API_KEY", "key");
    env::set_var("CHUNKBOX_CHUNK_SIZE", "1048576");
    env::set_var("CHUNKBOX_CONCURRENCY", "0");
    env::set_var("CHUNKBOX_CHUNK_HASH", "false");

    let client = ClientConfig::from_env();
    assert_eq!(client.chunk_url, "http://files.internal:7000/api/upload/chunk");
    assert_eq!(client.merge_url, "http://merger.internal/merge");
    assert_eq!(client.api_key.as_deref(), Some("key"));
    assert_eq!(client.chunk_size, 1024 * 1024);
    assert_eq!(client.concurrency, 1);
    assert!(!client.chunk_hash);

    // cleanup
    clear_env();
}
