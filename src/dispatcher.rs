//! Dispatch service: selection and retry around the forwarder
//!
//! One inbound request gets up to `MAX_RETRIES` forward attempts. A failed
//! attempt marks the chosen backend unhealthy and re-enters selection; the
//! health checker re-admits it later. Exhaustion answers 503.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::forwarder::Forwarder;
use crate::pool::BackendPool;

/// Maximum number of forward attempts per request
pub const MAX_RETRIES: usize = 3;

/// Orchestrates select -> forward -> mark-unhealthy -> retry
pub struct Dispatcher {
    pool: Arc<BackendPool>,
    forwarder: Forwarder,
}

impl Dispatcher {
    pub fn new(pool: Arc<BackendPool>, forwarder: Forwarder) -> Self {
        Self { pool, forwarder }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Handle one inbound request end to end.
    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let start = Instant::now();
        let (parts, body) = req.into_parts();

        // Buffer the inbound body once so a retried attempt resends it
        // intact; response bodies still stream.
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read request body");
                return plain_response(StatusCode::BAD_REQUEST, "Bad Request\n");
            }
        };

        debug!(
            method = %parts.method,
            uri = %parts.uri,
            remote_addr = %client_addr,
            "handling incoming request"
        );

        let mut attempts = 0;
        let mut last_error: Option<String> = None;

        while attempts < MAX_RETRIES {
            attempts += 1;

            let backend = match self.pool.select() {
                Some(backend) => backend,
                None => {
                    warn!(attempt = attempts, "no healthy backends available");
                    last_error = Some("no healthy backends".to_string());
                    break;
                }
            };

            self.pool.incr(&backend);
            let result = self
                .forwarder
                .forward(&parts, body.clone(), client_addr, is_tls, &backend)
                .await;
            self.pool.decr(&backend);

            match result {
                Ok(response) => {
                    info!(
                        backend = %backend.url_str(),
                        status = response.status().as_u16(),
                        attempt = attempts,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "request forwarded"
                    );
                    return response;
                }
                Err(e) => {
                    warn!(
                        backend = %backend.url_str(),
                        attempt = attempts,
                        error = %e,
                        "forwarding failed, marking backend unhealthy"
                    );
                    last_error = Some(e.to_string());
                    self.pool.mark(backend.url_str(), false);
                }
            }
        }

        error!(
            attempts,
            last_error = last_error.as_deref().unwrap_or("none"),
            duration_ms = start.elapsed().as_millis() as u64,
            "failed to handle request after all attempts"
        );
        plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n")
    }
}

/// Build a plain-text response with an infallible boxed body
pub fn plain_response(
    status: StatusCode,
    body: &'static str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(
            Full::new(Bytes::from_static(body.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}
