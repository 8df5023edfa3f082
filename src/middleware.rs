use axum::http::{HeaderValue, header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::middleware::Next;
use axum::body::Body;
use axum::Json;

use crate::config::Config;
use crate::models::ApiResponse;

/// header carrying the upload api key
pub const API_KEY_HEADER: &str = "x-api-key";

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::<()>::error(StatusCode::UNAUTHORIZED.as_u16(), message)),
    )
        .into_response()
}

// compare two hex digests without bailing out at the first difference
fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// api key validation
pub async fn validate_api_key(
    req: Request<Body>,
    next: Next,
) -> Response {
    // extract api key hash from request extensions (set during router setup)
    let Some(api_key_hash) = req.extensions().get::<String>() else {
        tracing::error!("API key hash missing from request extensions");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    // get api key from header
    let Some(provided_key) = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!("Missing {} header", API_KEY_HEADER);
        return unauthorized("missing api key");
    };

    // hash the provided key and compare
    if !digests_match(&Config::hash_api_key(provided_key), api_key_hash) {
        tracing::warn!("🚫 Invalid API key attempt");
        return unauthorized("invalid api key");
    }

    tracing::trace!("API key validated");
    next.run(req).await
}

/// security headers; artifacts are content-addressed so they cache forever
pub async fn add_security_headers(
    req: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    let success = response.status().is_success();
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; sandbox"),
    );
    if success {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=31536000, immutable"),
        );
    }

    response
}
