use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::Json,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::models::{
    ApiResponse, ArtifactListResponse, CheckRequest, CheckResponse, ChunkAck, ChunkMeta,
    DiscardResponse, MergeRequest, MergeResponse, StatsResponse,
};
use crate::state::AppState;

pub type ApiError = (StatusCode, Json<ApiResponse<()>>);
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// build an error envelope, mirroring the http status in `code`
fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::error(status.as_u16(), message)))
}

// map store failures onto error envelopes
fn store_error(e: StoreError) -> ApiError {
    let status = e.http_status();
    if status.is_server_error() {
        tracing::error!("Store failure: {}", e);
    }
    api_error(status, e.to_string())
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, ApiError> {
    fields
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            tracing::warn!("Chunk upload missing field {}", name);
            api_error(StatusCode::BAD_REQUEST, format!("{} is required", name))
        })
}

fn parse_u32(fields: &HashMap<String, String>, name: &str) -> Result<u32, ApiError> {
    required(fields, name)?.parse().map_err(|_| {
        api_error(StatusCode::BAD_REQUEST, format!("{} must be a non-negative integer", name))
    })
}

// existence check: merged artifact, or which chunks are already stored
pub async fn check_upload(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CheckRequest>,
) -> ApiResult<CheckResponse> {
    tracing::debug!("Existence check for {} ({})", payload.file_fingerprint, payload.file_name);

    let response = state.assembler.check(&payload).await.map_err(store_error)?;
    let message = if response.exists { "file already exists" } else { "file not found" };
    Ok(Json(ApiResponse::ok(response, message)))
}

// upload a single chunk via multipart form data
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<ChunkAck> {
    let mut fields = HashMap::new();
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::error!("Failed to read multipart field: {}", e);
        api_error(StatusCode::BAD_REQUEST, format!("Failed to read multipart field: {}", e))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let bytes = field.bytes().await.map_err(|e| {
                tracing::error!("Failed to read chunk bytes: {}", e);
                api_error(StatusCode::BAD_REQUEST, format!("Failed to read chunk bytes: {}", e))
            })?;
            data = Some(bytes);
        } else {
            let value = field.text().await.map_err(|e| {
                api_error(StatusCode::BAD_REQUEST, format!("Failed to read field {}: {}", name, e))
            })?;
            fields.insert(name, value);
        }
    }

    let data = data.ok_or_else(|| {
        tracing::warn!("Chunk upload contained no file field");
        api_error(StatusCode::BAD_REQUEST, "No chunk data provided")
    })?;

    let meta = ChunkMeta {
        file_fingerprint: required(&fields, "fileFingerprint")?.to_string(),
        file_name: required(&fields, "fileName")?.to_string(),
        chunk_index: parse_u32(&fields, "chunkIndex")?,
        chunk_hash: fields.get("chunkHash").cloned().filter(|h| !h.is_empty()),
        total_chunks: parse_u32(&fields, "totalChunks")?,
    };
    tracing::trace!("Received chunk {} for {} ({} bytes)", meta.chunk_index, meta.file_fingerprint, data.len());

    let ack = state
        .assembler
        .receive_chunk(&meta, data)
        .await
        .map_err(store_error)?;
    let message = format!("chunk {} uploaded", ack.chunk_index);
    Ok(Json(ApiResponse::ok(ack, message)))
}

// assemble all chunks of a fingerprint into the final file
pub async fn merge_chunks(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MergeRequest>,
) -> ApiResult<MergeResponse> {
    tracing::debug!(
        "Merge requested for {} ({} chunks, {} bytes)",
        payload.file_fingerprint,
        payload.total_chunks,
        payload.file_size
    );

    let artifact = state.assembler.merge(&payload).await.map_err(store_error)?;
    Ok(Json(ApiResponse::ok(MergeResponse::from(&artifact), "file merged")))
}

// discard a partial chunk set
pub async fn discard_chunks(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> ApiResult<DiscardResponse> {
    let discarded = state
        .assembler
        .discard(&fingerprint)
        .await
        .map_err(store_error)?;

    if !discarded {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No pending chunks for {}", fingerprint),
        ));
    }

    Ok(Json(ApiResponse::ok(
        DiscardResponse {
            file_fingerprint: fingerprint,
            discarded,
        },
        "chunks discarded",
    )))
}

// list merged artifacts
pub async fn list_files(State(state): State<Arc<AppState>>) -> ApiResult<ArtifactListResponse> {
    let artifacts = state
        .assembler
        .store()
        .list_artifacts()
        .await
        .map_err(store_error)?;

    let files: Vec<MergeResponse> = artifacts.iter().map(MergeResponse::from).collect();
    let total = files.len();
    tracing::debug!("Found {} artifacts total", total);
    Ok(Json(ApiResponse::ok(ArtifactListResponse { files, total }, "ok")))
}

// get store statistics
pub async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<StatsResponse> {
    let stats = state.assembler.store().stats().await.map_err(store_error)?;
    tracing::debug!(
        "Stats: {} artifacts, {} pending chunk sets",
        stats.artifacts,
        stats.pending_chunk_sets
    );
    Ok(Json(ApiResponse::ok(stats, "ok")))
}

// health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "chunkbox-api",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
