//! Reverse proxying to plain and TLS upstreams

use crate::action::path_token;
use crate::error::{json_error_response, BoxError, ProxyBody, ProxyErrorCode};
use crate::tls::crypto_provider;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::either::Either;
use tracing::{debug, error};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hop-by-hop headers that must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Where a request came from, for the X-Forwarded-* headers
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub is_tls: bool,
}

/// A parsed upstream target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    /// Origin-form request target sent upstream
    pub path_and_query: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TargetError {
    Invalid(String),
    UnknownProtocol(String),
}

/// Resolve the upstream for a request.
///
/// When `append_path` is set the request's path (minus the leading slash) is
/// appended to the target's path; otherwise the target is used as is.
pub fn resolve_target(target: &str, request_uri: &Uri, append_path: bool) -> Result<UpstreamTarget, TargetError> {
    let uri: Uri = target
        .parse()
        .map_err(|e| TargetError::Invalid(format!("{}: {}", target, e)))?;

    let tls = match uri.scheme_str() {
        Some("http") => false,
        Some("https") => true,
        Some(other) => return Err(TargetError::UnknownProtocol(other.to_string())),
        None => return Err(TargetError::Invalid(format!("{}: missing scheme", target))),
    };

    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TargetError::Invalid(format!("{}: missing host", target)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

    let path_and_query = if append_path {
        let base = uri.path();
        let rest = path_token(request_uri);
        if base.ends_with('/') {
            format!("{}{}", base, rest)
        } else {
            format!("{}/{}", base, rest)
        }
    } else {
        uri.path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    };

    Ok(UpstreamTarget {
        tls,
        host,
        port,
        path_and_query,
    })
}

/// Connects to upstreams, plain or over rustls
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: TlsConnector,
}

impl UpstreamConnector {
    /// Verify upstream certificates against the bundled web PKI roots
    pub fn new() -> Result<Self, rustls::Error> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::with_client_config(Arc::new(config)))
    }

    pub fn with_client_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::from(config),
        }
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        tls: bool,
    ) -> std::io::Result<Either<TcpStream, tokio_rustls::client::TlsStream<TcpStream>>> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        if !tls {
            return Ok(Either::Left(tcp));
        }

        let name = ServerName::try_from(host.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let stream = self.tls.connect(name, tcp).await?;
        Ok(Either::Right(stream))
    }
}

/// Set the proxy headers on an outgoing request.
///
/// X-Forwarded-* headers are overwritten rather than appended so clients
/// cannot spoof them.
pub fn set_forwarding_headers(headers: &mut HeaderMap, client: ClientInfo) -> String {
    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client.addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if client.is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    request_id
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Forward a request upstream and stream the response back
pub async fn forward<B>(
    connector: &UpstreamConnector,
    mut req: Request<B>,
    target: &str,
    append_path: bool,
    client: ClientInfo,
) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let upstream = match resolve_target(target, req.uri(), append_path) {
        Ok(upstream) => upstream,
        Err(TargetError::UnknownProtocol(scheme)) => {
            debug!(upstream = %target, scheme, "Unknown upstream protocol");
            return json_error_response(ProxyErrorCode::UnknownProtocol, "Unknown protocol");
        }
        Err(TargetError::Invalid(message)) => {
            error!(upstream = %target, error = %message, "Invalid upstream target");
            return json_error_response(ProxyErrorCode::InvalidUpstream, "Invalid upstream target");
        }
    };

    // HTTP/2 clients carry the authority in the URI instead of a Host header
    if !req.headers().contains_key(hyper::header::HOST) {
        if let Some(authority) = req.uri().authority().map(|a| a.as_str().to_string()) {
            if let Ok(value) = HeaderValue::from_str(&authority) {
                req.headers_mut().insert(hyper::header::HOST, value);
            }
        }
    }

    let request_id = set_forwarding_headers(req.headers_mut(), client);
    strip_hop_by_hop(req.headers_mut());

    match upstream.path_and_query.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
            error!(upstream = %target, error = %e, "Invalid upstream path");
            return json_error_response(ProxyErrorCode::InvalidUpstream, "Invalid upstream target");
        }
    }
    *req.version_mut() = Version::HTTP_11;

    debug!(
        request_id,
        method = %req.method(),
        upstream_host = %upstream.host,
        upstream_port = upstream.port,
        path = %upstream.path_and_query,
        "Forwarding request"
    );

    match send(connector, &upstream, req).await {
        Ok(response) => response.map(|body| body.map_err(BoxError::from).boxed()),
        Err(e) => {
            // Full detail stays in the log; the client gets a generic description
            error!(
                request_id,
                upstream_host = %upstream.host,
                upstream_port = upstream.port,
                error = %e,
                "Upstream request failed"
            );
            json_error_response(ProxyErrorCode::UpstreamFailed, "Failed to connect to upstream")
        }
    }
}

async fn send<B>(
    connector: &UpstreamConnector,
    upstream: &UpstreamTarget,
    req: Request<B>,
) -> Result<Response<Incoming>, BoxError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let stream = connector
        .connect(&upstream.host, upstream.port, upstream.tls)
        .await?;

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await?;

    let host = upstream.host.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(upstream_host = %host, error = %e, "Upstream connection closed with error");
        }
    });

    Ok(sender.send_request(req).await?)
}
