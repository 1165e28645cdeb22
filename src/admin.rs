//! Admin API for rate limit client management
//!
//! Mounted under `/api/v1/ratelimit` on the main listener:
//! - `GET    /clients`      list registered clients
//! - `POST   /clients`      create or update a client
//! - `DELETE /clients/{id}` remove a client

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use tracing::debug;

use crate::ratelimit::{RateLimitService, RateLimitSettings};

/// Path prefix the proxy routes to this handler
pub const API_PREFIX: &str = "/api/v1/ratelimit";

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a `{"error": ...}` response
fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({ "error": message });
    json_response(status, body.to_string())
}

fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(
            Full::new(Bytes::new())
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum")
}

/// Handle one admin API request. `path` is the full request path.
pub async fn handle(
    method: &Method,
    path: &str,
    body: Bytes,
    service: &RateLimitService,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    debug!(%method, path, "admin API request");

    let subpath = path.strip_prefix(API_PREFIX).unwrap_or(path);

    match subpath {
        "/clients" => match *method {
            Method::GET => list_clients(service),
            Method::POST => create_client(body, service).await,
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        },
        _ if subpath.starts_with("/clients/") => {
            if *method != Method::DELETE {
                return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            }
            let client_id = subpath.trim_start_matches("/clients/");
            if client_id.is_empty() {
                return error_response(StatusCode::BAD_REQUEST, "client id required");
            }
            delete_client(client_id, service).await
        }
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn list_clients(service: &RateLimitService) -> Response<BoxBody<Bytes, hyper::Error>> {
    let clients = service.list();
    match serde_json::to_string(&clients) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn create_client(
    body: Bytes,
    service: &RateLimitService,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let settings: RateLimitSettings = match serde_json::from_slice(&body) {
        Ok(settings) => settings,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid JSON"),
    };

    match service.create_or_update(settings.clone()).await {
        Ok(()) => {
            let body = serde_json::to_string(&settings).unwrap_or_default();
            json_response(StatusCode::CREATED, body)
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

async fn delete_client(
    client_id: &str,
    service: &RateLimitService,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    match service.remove(client_id).await {
        Ok(()) => empty_response(StatusCode::NO_CONTENT),
        Err(e) => error_response(StatusCode::NOT_FOUND, &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryRateLimiter, RateLimiter};
    use std::sync::Arc;

    async fn body_string(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn test_service() -> RateLimitService {
        let limiter: Arc<dyn RateLimiter> = Arc::new(MemoryRateLimiter::new());
        RateLimitService::new(limiter)
    }

    #[tokio::test]
    async fn test_crud_round_trip() {
        let service = test_service();

        // Create
        let body = Bytes::from(r#"{"client_id":"test-client","capacity":5,"rate_per_second":1}"#);
        let response = handle(&Method::POST, "/api/v1/ratelimit/clients", body, &service).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_string(response).await;
        assert!(body.contains("\"client_id\":\"test-client\""));

        // List contains the client
        let response = handle(
            &Method::GET,
            "/api/v1/ratelimit/clients",
            Bytes::new(),
            &service,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        let body = body_string(response).await;
        assert!(body.contains("test-client"));

        // Delete
        let response = handle(
            &Method::DELETE,
            "/api/v1/ratelimit/clients/test-client",
            Bytes::new(),
            &service,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // List no longer contains the client
        let response = handle(
            &Method::GET,
            "/api/v1/ratelimit/clients",
            Bytes::new(),
            &service,
        )
        .await;
        let body = body_string(response).await;
        assert_eq!(body, "[]");

        // Second delete is a 404
        let response = handle(
            &Method::DELETE,
            "/api/v1/ratelimit/clients/test-client",
            Bytes::new(),
            &service,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_string(response).await;
        assert_eq!(body, r#"{"error":"client not found"}"#);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_json() {
        let service = test_service();
        let response = handle(
            &Method::POST,
            "/api/v1/ratelimit/clients",
            Bytes::from("not json"),
            &service,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert!(body.contains("invalid JSON"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_settings() {
        let service = test_service();
        let body = Bytes::from(r#"{"client_id":"","capacity":5,"rate_per_second":1}"#);
        let response = handle(&Method::POST, "/api/v1/ratelimit/clients", body, &service).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_string(response).await;
        assert!(body.contains("client_id"));

        let body = Bytes::from(r#"{"client_id":"c","capacity":0,"rate_per_second":1}"#);
        let response = handle(&Method::POST, "/api/v1/ratelimit/clients", body, &service).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let service = test_service();
        let response = handle(
            &Method::PUT,
            "/api/v1/ratelimit/clients",
            Bytes::new(),
            &service,
        )
        .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = handle(
            &Method::GET,
            "/api/v1/ratelimit/clients/some-id",
            Bytes::new(),
            &service,
        )
        .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let service = test_service();
        let response = handle(
            &Method::GET,
            "/api/v1/ratelimit/unknown",
            Bytes::new(),
            &service,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
