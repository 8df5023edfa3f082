//! Error types shared by the chunk store, the assembler and the uploader

use axum::http::StatusCode;
use std::io;
use thiserror::Error;

/// errors raised by a chunk store or the assembler in front of it
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("missing chunks: {missing} of {total} absent (first missing index {first_missing})")]
    IncompleteChunks {
        first_missing: u32,
        missing: u32,
        total: u32,
    },

    #[error("assembled size mismatch: declared {expected} bytes, assembled {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("chunk hash mismatch for chunk {index}: expected {expected}, got {actual}")]
    ChunkHashMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("corrupt manifest for {fingerprint}: {source}")]
    Manifest {
        fingerprint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// http status the api answers with for this failure
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::ChunkHashMismatch { .. } | Self::IncompleteChunks { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::SizeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Manifest { .. } | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// errors from the streaming content hasher
#[derive(Error, Debug)]
pub enum HashError {
    #[error("read failed at window {window}: {source}")]
    Read {
        window: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// errors from the client wire layer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("response decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// errors surfaced by an upload session
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("existence check failed: {0}")]
    Check(#[source] TransportError),

    #[error("upload incomplete: {uploaded}/{total} chunks acknowledged")]
    IncompleteUpload { uploaded: usize, total: usize },

    #[error("merge failed: {0}")]
    Merge(#[source] TransportError),

    #[error("fingerprint failed: {0}")]
    Hash(#[from] HashError),

    #[error("upload cancelled")]
    Cancelled,

    #[error("invalid operation {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: crate::uploader::UploadState,
    },
}
