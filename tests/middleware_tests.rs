use chunkbox::middleware::{add_security_headers, validate_api_key};
use chunkbox::config::Config;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::from_fn;
use axum::routing::get;
use axum::Router;
use tower::util::ServiceExt;

#[tokio::test]
async fn test_add_security_headers() {
    let app = Router::new()
        .route("/", get(|| async { "hello" }))
        .layer(from_fn(add_security_headers));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("content-security-policy").unwrap(), "default-src 'none'; sandbox");
    assert_eq!(headers.get("cache-control").unwrap(), "public, max-age=31536000, immutable");
}

#[tokio::test]
async fn test_error_responses_are_not_cached() {
    let app = Router::new()
        .route("/", get(|| async { (StatusCode::NOT_FOUND, "gone") }))
        .layer(from_fn(add_security_headers));

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get("cache-control").is_none());
    assert_eq!(response.headers().get("x-content-type-options").unwrap(), "nosniff");
}

#[tokio::test]
async fn test_validate_api_key() {
    let correct_key = "secret";
    let correct_hash = Config::hash_api_key(correct_key);

    let app = Router::new()
        .route("/", get(|| async { "hello" }))
        .layer(from_fn(validate_api_key))
        .layer(axum::Extension(correct_hash));

    // missing header
    let response = app.clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // rejection uses the json envelope
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], 401);
    assert!(json["data"].is_null());

    // wrong key
    let response = app.clone()
        .oneshot(
            Request::builder()
                .uri("/")
                .header("X-API-Key", "wrong")
                .body(Body::empty())
                .unwrap()
            )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // correct key
    let response = app
        .oneshot(
            Request::builder()
                .uri("/")
                .header("X-API-Key", correct_key)
                .body(Body::empty())
                .unwrap()
            )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
