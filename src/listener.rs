//! Listener manager and host router
//!
//! One listener per port, each with its own domain → action table. Hosts are
//! registered synchronously and sockets are bound later by
//! [`ListenerManager::start_pending`], so a configuration error never leaves
//! half the ports bound.

use crate::action::{self, path_token, substitute, Action};
use crate::config::ConfigError;
use crate::error::{json_error_response, text_response, ProxyBody, ProxyErrorCode};
use crate::proxy::{self, ClientInfo, UpstreamConnector};
use crate::serve;
use crate::sites::{HostEntry, Protocol};
use crate::tls::{self, CertificateProvider};
use crate::websocket;
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Path prefix of ACME HTTP-01 challenge requests
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

type RoutingTable = Arc<RwLock<HashMap<String, Action>>>;

struct Listener {
    protocol: Protocol,
    routes: RoutingTable,
    /// Set once a bind has been attempted or succeeded
    started: bool,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            routes: Arc::new(RwLock::new(HashMap::new())),
            started: false,
            handle: None,
        }
    }
}

/// Everything a connection on one listener needs to answer requests
struct ListenerContext {
    port: u16,
    protocol: Protocol,
    routes: RoutingTable,
    certs: Arc<dyn CertificateProvider>,
    connector: UpstreamConnector,
}

/// Owns every listener and its routing table
pub struct ListenerManager {
    bind: String,
    challenge_port: u16,
    certs: Arc<dyn CertificateProvider>,
    connector: UpstreamConnector,
    listeners: Mutex<BTreeMap<u16, Listener>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ListenerManager {
    pub fn new(
        bind: impl Into<String>,
        challenge_port: u16,
        certs: Arc<dyn CertificateProvider>,
        connector: UpstreamConnector,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bind: bind.into(),
            challenge_port,
            certs,
            connector,
            listeners: Mutex::new(BTreeMap::new()),
            shutdown_tx,
        }
    }

    pub fn add_host(&self, entry: &HostEntry) -> Result<(), ConfigError> {
        self.add_domain(entry.port, entry.protocol, &entry.domain, entry.action.clone())
    }

    /// Register `domain` on the listener for `port`, creating the listener if needed.
    ///
    /// TLS domains are announced to the certificate provider and get a
    /// plaintext companion on the challenge port.
    pub fn add_domain(
        &self,
        port: u16,
        protocol: Protocol,
        domain: &str,
        action: Action,
    ) -> Result<(), ConfigError> {
        let domain =
            normalize_hostname(domain).ok_or_else(|| ConfigError::InvalidDomain(domain.to_string()))?;

        {
            let mut listeners = self.listeners.lock();

            if let Some(existing) = listeners.get(&port) {
                if existing.protocol != protocol {
                    return Err(ConfigError::ProtocolConflict {
                        port,
                        existing: existing.protocol.as_str(),
                        requested: protocol.as_str(),
                    });
                }
                if existing.routes.read().contains_key(&domain) {
                    return Err(ConfigError::DuplicateHost { domain, port });
                }
            }

            if protocol == Protocol::Tls {
                let companion = listeners.get(&self.challenge_port).map(|l| l.protocol);
                if port == self.challenge_port || companion == Some(Protocol::Tls) {
                    return Err(ConfigError::ProtocolConflict {
                        port: self.challenge_port,
                        existing: Protocol::Tls.as_str(),
                        requested: Protocol::Plain.as_str(),
                    });
                }
            }

            let listener = listeners
                .entry(port)
                .or_insert_with(|| Listener::new(protocol));
            listener.routes.write().insert(domain.clone(), action.clone());

            if protocol == Protocol::Tls {
                listeners
                    .entry(self.challenge_port)
                    .or_insert_with(|| Listener::new(Protocol::Plain));
            }
        }

        info!(domain = %domain, port, protocol = %protocol, action = action.kind(), "Host registered");

        if protocol == Protocol::Tls {
            self.certs.register(&domain);
        }

        Ok(())
    }

    /// Whether (port, domain) is already registered
    pub fn has_domain(&self, port: u16, domain: &str) -> bool {
        let Some(domain) = normalize_hostname(domain) else {
            return false;
        };
        self.listeners
            .lock()
            .get(&port)
            .map(|l| l.routes.read().contains_key(&domain))
            .unwrap_or(false)
    }

    /// Registered listeners as (port, protocol, domain count)
    pub fn listeners(&self) -> Vec<(u16, Protocol, usize)> {
        self.listeners
            .lock()
            .iter()
            .map(|(port, l)| (*port, l.protocol, l.routes.read().len()))
            .collect()
    }

    /// Bind every listener that is not yet serving
    pub async fn start_pending(&self) -> anyhow::Result<()> {
        let pending: Vec<Arc<ListenerContext>> = {
            let mut listeners = self.listeners.lock();
            listeners
                .iter_mut()
                .filter(|(_, l)| !l.started)
                .map(|(port, l)| {
                    l.started = true;
                    Arc::new(ListenerContext {
                        port: *port,
                        protocol: l.protocol,
                        routes: Arc::clone(&l.routes),
                        certs: Arc::clone(&self.certs),
                        connector: self.connector.clone(),
                    })
                })
                .collect()
        };

        let mut failure = None;
        for ctx in pending {
            let port = ctx.port;
            match self.bind_listener(ctx).await {
                Ok(handle) => {
                    if let Some(listener) = self.listeners.lock().get_mut(&port) {
                        listener.handle = Some(handle);
                    }
                }
                Err(e) => {
                    error!(port, error = %e, "Failed to start listener");
                    if let Some(listener) = self.listeners.lock().get_mut(&port) {
                        listener.started = false;
                    }
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn bind_listener(&self, ctx: Arc<ListenerContext>) -> anyhow::Result<JoinHandle<()>> {
        let ip = parse_bind_address(&self.bind)
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", self.bind, e))?;
        let addr = SocketAddr::new(ip, ctx.port);

        let tls_acceptor = match ctx.protocol {
            Protocol::Tls => Some(TlsAcceptor::from(tls::server_config(Arc::clone(&self.certs))?)),
            Protocol::Plain => None,
        };

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        info!(addr = %addr, protocol = %ctx.protocol, "Listening (HTTP/1.1 and HTTP/2)");

        let shutdown_rx = self.shutdown_tx.subscribe();
        Ok(tokio::spawn(accept_loop(listener, ctx, tls_acceptor, shutdown_rx)))
    }

    /// Stop accepting on every listener and wait for the accept loops to end
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self
            .listeners
            .lock()
            .values_mut()
            .filter_map(|l| l.handle.take())
            .collect();

        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    tls_acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = Arc::clone(&ctx);
                        let tls_acceptor = tls_acceptor.clone();

                        tokio::spawn(async move {
                            if let Some(acceptor) = tls_acceptor {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = handle_connection(tls_stream, addr, ctx).await {
                                            debug!(addr = %addr, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => {
                                        debug!(addr = %addr, error = %e, "TLS handshake failed");
                                    }
                                }
                            } else if let Err(e) = handle_connection(stream, addr, ctx).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(port = ctx.port, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(port = ctx.port, "Listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, ctx: Arc<ListenerContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let client = ClientInfo {
        addr,
        is_tls: ctx.protocol == Protocol::Tls,
    };

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, Infallible>(handle_request(req, &ctx, client).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Route one request to the action registered for its host
async fn handle_request<B>(mut req: Request<B>, ctx: &ListenerContext, client: ClientInfo) -> Response<ProxyBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<crate::error::BoxError>,
{
    if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        if let Some(key_auth) = ctx.certs.challenge_response(token) {
            debug!(token, "Responding to ACME HTTP-01 challenge");
            let mut response = text_response(StatusCode::OK, key_auth);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain"),
            );
            return response;
        }
    }

    let host = request_host(&req);
    let domain = match host.as_deref().and_then(normalize_hostname) {
        Some(domain) => domain,
        None => {
            info!(addr = %client.addr, port = ctx.port, "Request without a valid Host header");
            return json_error_response(ProxyErrorCode::MissingHostHeader, "Missing or invalid Host header");
        }
    };
    let host = host.unwrap_or_default();

    let action = ctx.routes.read().get(&domain).cloned();
    let Some(action) = action else {
        debug!(domain = %domain, port = ctx.port, "Unknown host");
        return text_response(StatusCode::OK, format!("Unknown host: {}", domain));
    };

    let path = path_token(req.uri()).to_string();

    if websocket::is_upgrade_request(req.headers()) {
        let Action::Proxy {
            websocket_to: Some(websocket_to),
            ..
        } = &action
        else {
            debug!(domain = %domain, "Upgrade requested for host without websocket target");
            return json_error_response(ProxyErrorCode::UpgradeNotSupported, "Websocket not supported for this host");
        };

        let response = match websocket::accept_response(req.headers()) {
            Ok(response) => response,
            Err(message) => {
                debug!(domain = %domain, error = message, "Invalid websocket handshake");
                return json_error_response(ProxyErrorCode::UpgradeNotSupported, message);
            }
        };

        let target = substitute(websocket_to, &host, &path);
        let protocols = req.headers().get(hyper::header::SEC_WEBSOCKET_PROTOCOL).cloned();
        let on_upgrade = hyper::upgrade::on(&mut req);
        debug!(domain = %domain, upstream = %target, "Relaying websocket");
        tokio::spawn(websocket::relay(on_upgrade, ctx.connector.clone(), target, protocols));
        return response;
    }

    match action {
        Action::Redirect { to, code } => action::redirect(&to, code, &host, &path),
        Action::Proxy { to, .. } => {
            let target = substitute(&to, &host, &path);
            proxy::forward(&ctx.connector, req, &target, !to.contains("$path"), client).await
        }
        Action::Serve {
            root_path,
            index_names,
        } => serve::serve_path(req.method(), req.uri(), req.headers(), &root_path, &index_names).await,
        Action::None => action::no_content(),
    }
}

/// Host header verbatim, or the URI authority for HTTP/2 requests
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

/// Parse a bind address, accepting IPv6 with or without brackets
pub fn parse_bind_address(bind: &str) -> Result<IpAddr, std::net::AddrParseError> {
    bind.trim_start_matches('[').trim_end_matches(']').parse()
}

/// Strip any port, validate, and lower-case a hostname
pub fn normalize_hostname(host: &str) -> Option<String> {
    // Bracketed IPv6 literal, with an optional port after the bracket
    if let Some(rest) = host.strip_prefix('[') {
        let (literal, tail) = rest.split_once(']')?;
        if !(tail.is_empty() || tail.starts_with(':')) {
            return None;
        }
        let addr: Ipv6Addr = literal.parse().ok()?;
        return Some(format!("[{}]", addr));
    }

    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Restricting the charset keeps hostnames safe to log and to use as paths
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty};
    use hyper::body::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct RecordingCerts {
        registered: Mutex<Vec<String>>,
        challenges: Mutex<HashMap<String, String>>,
    }

    impl CertificateProvider for RecordingCerts {
        fn register(&self, domain: &str) {
            self.registered.lock().push(domain.to_string());
        }

        fn resolve(&self, _domain: &str) -> Option<Arc<rustls::sign::CertifiedKey>> {
            None
        }

        fn challenge_response(&self, token: &str) -> Option<String> {
            self.challenges.lock().get(token).cloned()
        }
    }

    fn manager_with(certs: Arc<RecordingCerts>) -> ListenerManager {
        ListenerManager::new("127.0.0.1", 80, certs, UpstreamConnector::new().unwrap())
    }

    fn manager() -> ListenerManager {
        manager_with(Arc::new(RecordingCerts::default()))
    }

    fn context(manager: &ListenerManager, port: u16) -> ListenerContext {
        let listeners = manager.listeners.lock();
        let listener = listeners.get(&port).unwrap();
        ListenerContext {
            port,
            protocol: listener.protocol,
            routes: Arc::clone(&listener.routes),
            certs: Arc::clone(&manager.certs),
            connector: manager.connector.clone(),
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            addr: "127.0.0.1:40000".parse().unwrap(),
            is_tls: false,
        }
    }

    fn get(uri: &str, host: Option<&str>) -> Request<Empty<Bytes>> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(hyper::header::HOST, host);
        }
        builder.body(Empty::new()).unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn redirect_to(to: &str) -> Action {
        Action::Redirect {
            to: to.to_string(),
            code: 301,
        }
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("Example.COM:8080"), Some("example.com".to_string()));
        assert_eq!(normalize_hostname("a.test"), Some("a.test".to_string()));
        assert_eq!(normalize_hostname(""), None);
        assert_eq!(normalize_hostname("bad host"), None);
        assert_eq!(normalize_hostname("evil\r\nx"), None);
        assert_eq!(normalize_hostname(&"a".repeat(254)), None);

        assert_eq!(normalize_hostname("[::1]:8080"), Some("[::1]".to_string()));
        assert_eq!(normalize_hostname("[2001:DB8::0001]"), Some("[2001:db8::1]".to_string()));
        assert_eq!(normalize_hostname("[::1]x"), None);
        assert_eq!(normalize_hostname("[not-an-ip]"), None);
    }

    #[test]
    fn test_parse_bind_address() {
        assert_eq!(parse_bind_address("0.0.0.0").unwrap(), IpAddr::from([0, 0, 0, 0]));
        assert_eq!(parse_bind_address("::").unwrap(), IpAddr::from(Ipv6Addr::UNSPECIFIED));
        assert_eq!(parse_bind_address("[::1]").unwrap(), IpAddr::from(Ipv6Addr::LOCALHOST));
        assert!(parse_bind_address("localhost").is_err());
    }

    #[tokio::test]
    async fn test_ipv6_bind_and_host() {
        let port = std::net::TcpListener::bind("[::1]:0")
            .and_then(|l| l.local_addr())
            .map(|a| a.port());
        // Hosts without IPv6 loopback cannot run this
        let Ok(port) = port else { return };

        let manager = ListenerManager::new(
            "::1",
            80,
            Arc::new(RecordingCerts::default()),
            UpstreamConnector::new().unwrap(),
        );
        manager
            .add_domain(port, Protocol::Plain, "[::1]", Action::None)
            .unwrap();
        manager.start_pending().await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(("::1", port)).await.unwrap();
        stream
            .write_all(format!("GET / HTTP/1.1\r\nHost: [::1]:{}\r\nConnection: close\r\n\r\n", port).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 204"), "{}", response);

        manager.close().await;
    }

    #[test]
    fn test_protocol_conflict() {
        let manager = manager();
        manager
            .add_domain(8080, Protocol::Plain, "a.test", Action::None)
            .unwrap();

        let err = manager
            .add_domain(8080, Protocol::Tls, "b.test", Action::None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ProtocolConflict { port: 8080, .. }));
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let manager = manager();
        manager
            .add_domain(8080, Protocol::Plain, "a.test", Action::None)
            .unwrap();

        let err = manager
            .add_domain(8080, Protocol::Plain, "A.test", Action::None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateHost { port: 8080, .. }));

        // Same domain on another port is a different key
        manager
            .add_domain(8081, Protocol::Plain, "a.test", Action::None)
            .unwrap();
        assert!(manager.has_domain(8081, "a.test"));
    }

    #[test]
    fn test_tls_host_registers_certificate_and_companion() {
        let certs = Arc::new(RecordingCerts::default());
        let manager = manager_with(Arc::clone(&certs));

        manager
            .add_domain(443, Protocol::Tls, "secure.test", Action::None)
            .unwrap();
        manager
            .add_domain(443, Protocol::Tls, "other.test", Action::None)
            .unwrap();

        assert_eq!(*certs.registered.lock(), vec!["secure.test", "other.test"]);
        assert_eq!(
            manager.listeners(),
            vec![(80, Protocol::Plain, 0), (443, Protocol::Tls, 2)]
        );
    }

    #[test]
    fn test_tls_on_challenge_port_conflicts() {
        let manager = manager();
        let err = manager
            .add_domain(80, Protocol::Tls, "a.test", Action::None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ProtocolConflict { port: 80, .. }));
    }

    #[test]
    fn test_invalid_domain_rejected() {
        let manager = manager();
        let err = manager
            .add_domain(8080, Protocol::Plain, "../etc", Action::None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDomain(_)));
    }

    #[tokio::test]
    async fn test_routes_to_registered_action_only() {
        let manager = manager();
        manager
            .add_domain(8080, Protocol::Plain, "a.test", redirect_to("https://$host/$path"))
            .unwrap();
        manager
            .add_domain(8080, Protocol::Plain, "b.test", Action::None)
            .unwrap();
        let ctx = context(&manager, 8080);

        let response = handle_request(get("/docs?x=1", Some("a.test:8080")), &ctx, client()).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://a.test:8080/docs?x=1"
        );

        let response = handle_request(get("/", Some("B.TEST")), &ctx, client()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = handle_request(get("/", Some("c.test")), &ctx, client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Unknown host: c.test");
    }

    #[tokio::test]
    async fn test_missing_host_is_bad_request() {
        let manager = manager();
        manager
            .add_domain(8080, Protocol::Plain, "a.test", Action::None)
            .unwrap();
        let ctx = context(&manager, 8080);

        let response = handle_request(get("/", None), &ctx, client()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get("x-proxy-error").unwrap(), "MISSING_HOST_HEADER");
    }

    #[tokio::test]
    async fn test_acme_challenge_intercepted_first() {
        let certs = Arc::new(RecordingCerts::default());
        certs
            .challenges
            .lock()
            .insert("tok".to_string(), "tok.key".to_string());
        let manager = manager_with(Arc::clone(&certs));
        manager
            .add_domain(443, Protocol::Tls, "a.test", Action::None)
            .unwrap();
        let ctx = context(&manager, 80);

        // No Host header and no routes on the companion: still answered
        let response = handle_request(get("/.well-known/acme-challenge/tok", None), &ctx, client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "tok.key");

        let response =
            handle_request(get("/.well-known/acme-challenge/other", Some("a.test")), &ctx, client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Unknown host: a.test");
    }

    #[tokio::test]
    async fn test_upgrade_without_websocket_target() {
        let manager = manager();
        manager
            .add_domain(
                8080,
                Protocol::Plain,
                "a.test",
                Action::Proxy {
                    to: "http://127.0.0.1:1".to_string(),
                    websocket_to: None,
                },
            )
            .unwrap();
        let ctx = context(&manager, 8080);

        let req = Request::builder()
            .uri("/socket")
            .header(hyper::header::HOST, "a.test")
            .header(hyper::header::UPGRADE, "websocket")
            .header(hyper::header::CONNECTION, "Upgrade")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = handle_request(req, &ctx, client()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get("x-proxy-error").unwrap(), "UPGRADE_NOT_SUPPORTED");
    }

    #[tokio::test]
    async fn test_serve_action_dispatch() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hello.txt"), "hello").unwrap();

        let manager = manager();
        manager
            .add_domain(
                8080,
                Protocol::Plain,
                "files.test",
                Action::Serve {
                    root_path: root.path().to_path_buf(),
                    index_names: action::default_index_names(),
                },
            )
            .unwrap();
        let ctx = context(&manager, 8080);

        let response = handle_request(get("/hello.txt", Some("files.test")), &ctx, client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "hello");
    }

    #[tokio::test]
    async fn test_start_pending_binds_once() {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let manager = manager();
        manager
            .add_domain(port, Protocol::Plain, "a.test", Action::None)
            .unwrap();
        manager.start_pending().await.unwrap();
        // Already started listeners are skipped
        manager.start_pending().await.unwrap();

        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());
        manager.close().await;
    }
}
