//! Client wire layer for the upload protocol.
//!
//! [`UploadTransport`] keeps the orchestrator independent of HTTP so it can
//! be driven against an in-process assembler in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;

use crate::assembler::ChunkAssembler;
use crate::config::ClientConfig;
use crate::error::{StoreError, TransportError};
use crate::middleware::API_KEY_HEADER;
use crate::models::{ApiResponse, CheckRequest, CheckResponse, ChunkAck, ChunkMeta, MergeRequest, MergeResponse};

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// the three protocol calls an uploader makes
pub trait UploadTransport: Send + Sync {
    fn check<'a>(&'a self, req: &'a CheckRequest) -> TransportFuture<'a, CheckResponse>;

    /// dropping the returned future aborts the transfer
    fn upload_chunk<'a>(&'a self, meta: &'a ChunkMeta, data: Bytes) -> TransportFuture<'a, ChunkAck>;

    fn merge<'a>(&'a self, req: &'a MergeRequest) -> TransportFuture<'a, MergeResponse>;
}

/// reqwest-backed transport speaking the `{ code, data, message }` envelope
pub struct HttpTransport {
    http: reqwest::Client,
    check_url: String,
    chunk_url: String,
    merge_url: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key).map_err(|_| TransportError::Rejected {
                code: 0,
                message: "api key is not a valid header value".to_string(),
            })?;
            headers.insert(API_KEY_HEADER, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            check_url: config.check_url.clone(),
            chunk_url: config.chunk_url.clone(),
            merge_url: config.merge_url.clone(),
        })
    }

    // decode the envelope regardless of http status; non-success codes become Rejected
    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, TransportError> {
        let status = resp.status();
        let body = resp.bytes().await?;

        let envelope: ApiResponse<T> = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => {
                return Err(TransportError::Rejected {
                    code: status.as_u16(),
                    message: String::from_utf8_lossy(&body).into_owned(),
                })
            }
        };

        if !envelope.is_success() {
            return Err(TransportError::Rejected {
                code: envelope.code,
                message: envelope.message,
            });
        }
        envelope.data.ok_or_else(|| TransportError::Rejected {
            code: envelope.code,
            message: format!("response carried no data: {}", envelope.message),
        })
    }
}

impl UploadTransport for HttpTransport {
    fn check<'a>(&'a self, req: &'a CheckRequest) -> TransportFuture<'a, CheckResponse> {
        Box::pin(async move {
            let resp = self.http.post(&self.check_url).json(req).send().await?;
            Self::decode(resp).await
        })
    }

    fn upload_chunk<'a>(&'a self, meta: &'a ChunkMeta, data: Bytes) -> TransportFuture<'a, ChunkAck> {
        Box::pin(async move {
            let part = Part::bytes(data.to_vec())
                .file_name(format!("chunk-{}", meta.chunk_index))
                .mime_str("application/octet-stream")?;

            let mut form = Form::new()
                .text("fileFingerprint", meta.file_fingerprint.clone())
                .text("fileName", meta.file_name.clone())
                .text("chunkIndex", meta.chunk_index.to_string())
                .text("totalChunks", meta.total_chunks.to_string());
            if let Some(hash) = &meta.chunk_hash {
                form = form.text("chunkHash", hash.clone());
            }
            // metadata first so the server has it before the payload
            let form = form.part("file", part);

            let resp = self.http.post(&self.chunk_url).multipart(form).send().await?;
            Self::decode(resp).await
        })
    }

    fn merge<'a>(&'a self, req: &'a MergeRequest) -> TransportFuture<'a, MergeResponse> {
        Box::pin(async move {
            let resp = self.http.post(&self.merge_url).json(req).send().await?;
            Self::decode(resp).await
        })
    }
}

/// in-process transport calling a [`ChunkAssembler`] directly, for embedding
/// the store in the same process as the uploader
pub struct LocalTransport {
    assembler: Arc<ChunkAssembler>,
}

impl LocalTransport {
    pub fn new(assembler: Arc<ChunkAssembler>) -> Self {
        Self { assembler }
    }

    pub fn assembler(&self) -> &Arc<ChunkAssembler> {
        &self.assembler
    }
}

fn rejected(e: StoreError) -> TransportError {
    TransportError::Rejected {
        code: e.http_status().as_u16(),
        message: e.to_string(),
    }
}

impl UploadTransport for LocalTransport {
    fn check<'a>(&'a self, req: &'a CheckRequest) -> TransportFuture<'a, CheckResponse> {
        Box::pin(async move { self.assembler.check(req).await.map_err(rejected) })
    }

    fn upload_chunk<'a>(&'a self, meta: &'a ChunkMeta, data: Bytes) -> TransportFuture<'a, ChunkAck> {
        Box::pin(async move { self.assembler.receive_chunk(meta, data).await.map_err(rejected) })
    }

    fn merge<'a>(&'a self, req: &'a MergeRequest) -> TransportFuture<'a, MergeResponse> {
        Box::pin(async move {
            self.assembler
                .merge(req)
                .await
                .map(|artifact| MergeResponse::from(&artifact))
                .map_err(rejected)
        })
    }
}
