//! Single-attempt reverse proxying to a chosen backend
//!
//! The forwarder owns a pooled HTTP client and performs exactly one proxy
//! attempt per call. An `Err` return means the upstream could not be reached
//! and nothing was relayed to the client; any upstream status, 5xx included,
//! is a successful forward and is relayed verbatim.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use crate::error::ForwardError;
use crate::pool::Backend;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Configuration for the forwarder's upstream connection pool
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Maximum idle connections per backend host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Reverse proxy for a single forward attempt
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "forwarder initialized"
        );

        Self { client }
    }

    /// Proxy one request to the given backend and return the upstream
    /// response with a streaming body.
    pub async fn forward(
        &self,
        parts: &hyper::http::request::Parts,
        body: Bytes,
        client_addr: SocketAddr,
        is_tls: bool,
        backend: &Backend,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = upstream_uri(backend, &parts.uri)?;

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri.clone());

        let headers = builder
            .headers_mut()
            .ok_or_else(|| ForwardError::RequestBuild("invalid request parts".to_string()))?;
        *headers = parts.headers.clone();
        set_forwarded_headers(headers, backend, client_addr, is_tls);

        let upstream_req = builder
            .body(Full::new(body))
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        debug!(
            uri = %uri,
            method = %parts.method,
            backend = %backend.url_str(),
            "forwarding request"
        );

        let response = self.client.request(upstream_req).await?;

        let (response_parts, response_body) = response.into_parts();
        Ok(Response::from_parts(response_parts, response_body.boxed()))
    }
}

/// Build the upstream URI: backend scheme/authority, the backend's path
/// prefix (if any) joined with the inbound path and query.
fn upstream_uri(backend: &Backend, inbound: &Uri) -> Result<Uri, ForwardError> {
    let backend_url = backend.url();
    let scheme = backend_url.scheme_str().unwrap_or("http");
    let authority = backend_url
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| ForwardError::RequestBuild("backend URL has no host".to_string()))?;

    let prefix = backend_url.path().trim_end_matches('/');
    let path_and_query = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{}://{}{}{}", scheme, authority, prefix, path_and_query)
        .parse()
        .map_err(|e| ForwardError::RequestBuild(format!("invalid upstream URI: {}", e)))
}

/// Rewrite proxy headers on the outbound request:
/// - Host becomes the backend authority
/// - X-Forwarded-For gets the client IP appended
/// - X-Forwarded-Proto reflects the inbound connection scheme
/// - X-Forwarded-Host is preserved if present, else set to the inbound Host
fn set_forwarded_headers(
    headers: &mut HeaderMap,
    backend: &Backend,
    client_addr: SocketAddr,
    is_tls: bool,
) {
    let inbound_host = headers.get(HOST).cloned();

    if let Some(authority) = backend.url().authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(HOST, value);
        }
    }

    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = inbound_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
}
