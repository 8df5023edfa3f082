//! Resumable chunked uploads: a content-addressed chunk store with ordered
//! assembly behind an axum api, and an async client that uploads only the
//! chunks the server is missing.

pub mod assembler;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hashing;
pub mod middleware;
pub mod models;
pub mod plan;
pub mod server;
pub mod state;
pub mod store;
pub mod transport;
pub mod uploader;
pub mod utils;
