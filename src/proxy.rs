//! The main listener: admission, routing and connection lifecycle
//!
//! Every inbound connection is served on its own task. Requests are routed
//! to the health endpoint, the admin API or the dispatcher; proxied traffic
//! passes the admission filter first when rate limiting is enforced.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::admin;
use crate::dispatcher::Dispatcher;
use crate::ratelimit::{RateLimitService, RateLimiter};

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header carrying the caller's API key
const X_API_KEY: &str = "x-api-key";

/// The reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<dyn RateLimiter>,
    ratelimit_service: Arc<RateLimitService>,
    /// Whether the admission filter runs on proxied traffic
    enforce_rate_limit: bool,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        limiter: Arc<dyn RateLimiter>,
        ratelimit_service: Arc<RateLimitService>,
        enforce_rate_limit: bool,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher,
            limiter,
            ratelimit_service,
            enforce_rate_limit,
            shutdown_rx,
        }
    }

    /// Accept connections until shutdown is signalled, then drain in-flight
    /// connections. The caller bounds the drain with its own deadline.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %self.bind_addr, "proxy server listening (HTTP/1.1 and HTTP/2)");

        let graceful = GracefulShutdown::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let limiter = Arc::clone(&self.limiter);
                            let ratelimit_service = Arc::clone(&self.ratelimit_service);
                            let enforce = self.enforce_rate_limit;

                            let service = service_fn(move |req: Request<Incoming>| {
                                let dispatcher = Arc::clone(&dispatcher);
                                let limiter = Arc::clone(&limiter);
                                let ratelimit_service = Arc::clone(&ratelimit_service);
                                async move {
                                    handle_request(
                                        req,
                                        dispatcher,
                                        limiter,
                                        ratelimit_service,
                                        enforce,
                                        addr,
                                    )
                                    .await
                                }
                            });

                            let io = TokioIo::new(stream);
                            let mut builder = AutoBuilder::new(TokioExecutor::new());
                            builder
                                .http1()
                                .preserve_header_case(true)
                                .http2()
                                .max_concurrent_streams(250);
                            let conn = builder.serve_connection_with_upgrades(io, service);
                            let conn = graceful.watch(conn.into_owned());

                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        graceful.shutdown().await;
        info!("proxy server stopped");
        Ok(())
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<dyn RateLimiter>,
    ratelimit_service: Arc<RateLimitService>,
    enforce_rate_limit: bool,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate a request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }

    let path = req.uri().path();

    if req.method() == Method::GET && path == "/health" {
        return Ok(health_response());
    }

    if path.starts_with(admin::API_PREFIX) {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        return Ok(admin::handle(&parts.method, parts.uri.path(), body, &ratelimit_service).await);
    }

    if enforce_rate_limit {
        let client_id = derive_client_id(req.headers(), client_addr);
        if !limiter.allow(&client_id).await {
            info!(client = %client_id, uri = %req.uri(), request_id, "rate limit exceeded");
            return Ok(rate_limited_response());
        }
    }

    // Inbound TLS is not terminated here, so the proto is always http
    Ok(dispatcher.dispatch(req, client_addr, false).await)
}

/// Derive the rate limiting client id: the API key when present, the
/// caller's IP (port stripped) otherwise.
pub fn derive_client_id(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    if let Some(api_key) = headers.get(X_API_KEY).and_then(|v| v.to_str().ok()) {
        if !api_key.is_empty() {
            return format!("api_{}", api_key);
        }
    }
    format!("ip_{}", remote_addr.ip())
}

fn health_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(
            Full::new(Bytes::from_static(b"OK\n"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

fn rate_limited_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "code": 429,
        "message": "Rate limit exceeded",
        "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    });

    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("Content-Type", "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}
