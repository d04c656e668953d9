//! Interception proxy
//! Terminates TLS for tunnelled hosts with leaves minted by the local CA,
//! runs the session rewrite pipeline and forwards everything upstream

use crate::certificate::RootCertificateAuthority;
use crate::config::{ProxyConfig, TargetConfig};
use crate::error::Result;
use crate::rewrite::{InterceptedRequest, RewriteOutcome, SessionRewriter};
use crate::server::{self, ListenerHandle};
use crate::trust::webpki_root_store;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, PROXY_AUTHORIZATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::http::uri::Authority;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const HTTP1_ALPN: &[u8] = b"http/1.1";

/// `host:port` of a running interception proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for ProxyEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Immutable state shared by every connection
struct Shared {
    ca: Arc<RootCertificateAuthority>,
    rewriter: SessionRewriter,
    upstream: Upstream,
}

/// Interception proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    shared: Arc<Shared>,
    listener: Option<ListenerHandle>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig, target: TargetConfig, ca: Arc<RootCertificateAuthority>) -> Self {
        Self::with_upstream_roots(config, target, ca, webpki_root_store())
    }

    /// Like [`ProxyServer::new`], verifying origins against `roots` instead
    /// of the bundled webpki roots.
    pub fn with_upstream_roots(
        config: ProxyConfig,
        target: TargetConfig,
        ca: Arc<RootCertificateAuthority>,
        roots: RootCertStore,
    ) -> Self {
        let upstream = Upstream::new(config.resolve.clone(), roots);
        Self {
            config,
            shared: Arc::new(Shared {
                ca,
                rewriter: SessionRewriter::new(target),
                upstream,
            }),
            listener: None,
        }
    }

    /// Endpoint of the running listener
    pub fn endpoint(&self) -> Option<ProxyEndpoint> {
        self.listener
            .as_ref()
            .map(|listener| ProxyEndpoint::from(listener.local_addr()))
    }

    /// Start listening, closing any previous listener first.
    pub async fn start(&mut self) -> Result<ProxyEndpoint> {
        self.close().await;

        let listener = server::bind(self.config.listen_addr()).await?;
        let shared = self.shared.clone();

        let handle = server::spawn("proxy", listener, move |stream, remote_addr| {
            handle_connection(stream, remote_addr, shared.clone())
        })?;

        let endpoint = ProxyEndpoint::from(handle.local_addr());
        info!("Interception proxy listening on {}", endpoint);

        self.listener = Some(handle);
        Ok(endpoint)
    }

    /// Stop listening; a no-op when not running.
    pub async fn close(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.close().await;
            info!("Interception proxy stopped");
        }
    }
}

/// Where decrypted or plain requests on a connection are headed
#[derive(Debug, Clone)]
struct Target {
    tls: bool,
    host: String,
    port: u16,
}

impl Target {
    fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Authority as it appears in a URL or Host header.
    fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    fn url(&self, uri: &Uri) -> anyhow::Result<Url> {
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Url::parse(&format!("{}://{}{}", self.scheme(), self.authority(), path))
            .context("Invalid request URL")
    }
}

/// Host of an authority without the brackets around IPv6 literals
fn bare_host(authority: &Authority) -> String {
    let host = authority.host();
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string()
}

/// Serve one client connection
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(
            io,
            service_fn(move |req| {
                let shared = shared.clone();
                async move { Ok::<_, Infallible>(handle_request(req, remote_addr, shared).await) }
            }),
        )
        .with_upgrades()
        .await
        .map_err(|e| anyhow!("Proxy service error: {}", e))
}

/// Requests arriving on the proxy port itself
async fn handle_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        return handle_connect(req, shared);
    }

    let target = match (req.uri().scheme_str(), req.uri().authority()) {
        (Some("http"), Some(authority)) => Target {
            tls: false,
            host: bare_host(authority),
            port: authority.port_u16().unwrap_or(80),
        },
        _ => {
            debug!("Rejected non-proxy request {} from {}", req.uri(), remote_addr);
            return error_response(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    forward(req, &target, &shared).await
}

/// Accept a CONNECT tunnel and intercept it once the client has upgraded
fn handle_connect(req: Request<Incoming>, shared: Arc<Shared>) -> Response<ProxyBody> {
    let target = match req.uri().authority() {
        Some(authority) => Target {
            tls: true,
            host: bare_host(authority),
            port: authority.port_u16().unwrap_or(443),
        },
        None => {
            warn!("CONNECT without authority: {}", req.uri());
            return error_response(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    debug!("CONNECT {}", target.authority());

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = intercept_tunnel(upgraded, target.clone(), shared).await {
                    debug!("Tunnel to {} ended: {:#}", target.authority(), e);
                }
            }
            Err(e) => debug!("Upgrade failed: {}", e),
        }
    });

    Response::new(empty_body())
}

/// Terminate TLS on an upgraded tunnel and serve HTTP/1.1 on the plaintext
async fn intercept_tunnel(
    upgraded: hyper::upgrade::Upgraded,
    target: Target,
    shared: Arc<Shared>,
) -> anyhow::Result<()> {
    let resolver = Arc::new(LeafResolver {
        ca: shared.ca.clone(),
        fallback_host: target.host.clone(),
    });

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

    let tls = TlsAcceptor::from(Arc::new(config))
        .accept(TokioIo::new(upgraded))
        .await
        .context("TLS handshake with client failed")?;

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(
            TokioIo::new(tls),
            service_fn(move |req| {
                let shared = shared.clone();
                let target = target.clone();
                async move { Ok::<_, Infallible>(forward(req, &target, &shared).await) }
            }),
        )
        .await
        .map_err(|e| anyhow!("Tunnel service error: {}", e))
}

/// Mints the presented certificate from SNI, or the CONNECT host without it
#[derive(Debug)]
struct LeafResolver {
    ca: Arc<RootCertificateAuthority>,
    fallback_host: String,
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .unwrap_or(self.fallback_host.as_str());

        match self.ca.certified_key(host) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to mint certificate for {}: {:#}", host, e);
                None
            }
        }
    }
}

/// Run one request through the rewrite pipeline and send it upstream
async fn forward(req: Request<Incoming>, target: &Target, shared: &Shared) -> Response<ProxyBody> {
    let span = info_span!("request", id = %Uuid::new_v4());

    async move {
        match proxy_request(req, target, shared).await {
            Ok(response) => response,
            Err(e) => {
                error!("Request error: {:#}", e);
                error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
    .instrument(span)
    .await
}

async fn proxy_request(
    req: Request<Incoming>,
    target: &Target,
    shared: &Shared,
) -> anyhow::Result<Response<ProxyBody>> {
    let url = target.url(req.uri())?;
    let (mut parts, body) = req.into_parts();

    debug!("{} {}", parts.method, url);

    let body = if shared.rewriter.is_eligible(&url, &parts.method) {
        let bytes = body
            .collect()
            .await
            .context("Failed to read request body")?
            .to_bytes();

        let intercepted = InterceptedRequest {
            url,
            method: parts.method.clone(),
            headers: std::mem::take(&mut parts.headers),
            body: (!bytes.is_empty()).then_some(bytes),
        };

        match shared.rewriter.rewrite(&intercepted) {
            Ok(RewriteOutcome::Rewrite(rewritten)) => {
                parts.headers = rewritten.headers;
                full_body(rewritten.body.unwrap_or_default())
            }
            Ok(RewriteOutcome::PassThrough) => {
                parts.headers = intercepted.headers;
                full_body(intercepted.body.unwrap_or_default())
            }
            Err(e) => {
                warn!("Not forwarding {} {}: {}", intercepted.method, intercepted.url, e);
                return Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        }
    } else {
        body.boxed()
    };

    parts.uri = parts
        .uri
        .path_and_query()
        .cloned()
        .map(Uri::from)
        .unwrap_or_else(|| Uri::from_static("/"));
    parts.version = Version::HTTP_11;
    parts.headers.remove("proxy-connection");
    parts.headers.remove(PROXY_AUTHORIZATION);
    if !parts.headers.contains_key(HOST) {
        let host = HeaderValue::from_str(&target.authority()).context("Invalid Host header")?;
        parts.headers.insert(HOST, host);
    }

    let response = shared
        .upstream
        .send(target, Request::from_parts(parts, body))
        .await?;

    Ok(response.map(|b| b.boxed()))
}

/// Origin connections: verified TLS or plain TCP
struct Upstream {
    tls: TlsConnector,
    resolve: HashMap<String, SocketAddr>,
}

impl Upstream {
    fn new(resolve: HashMap<String, SocketAddr>, roots: RootCertStore) -> Self {
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

        let resolve = resolve
            .into_iter()
            .map(|(host, addr)| (host.to_ascii_lowercase(), addr))
            .collect();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
            resolve,
        }
    }

    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let stream = match self.resolve.get(&host.to_ascii_lowercase()) {
            Some(addr) => TcpStream::connect(*addr).await,
            None => TcpStream::connect((host, port)).await,
        };
        stream.with_context(|| format!("Failed to connect to upstream {}:{}", host, port))
    }

    async fn send(&self, target: &Target, req: Request<ProxyBody>) -> anyhow::Result<Response<Incoming>> {
        let stream = self.connect(&target.host, target.port).await?;

        if !target.tls {
            return send_over(TokioIo::new(stream), req).await;
        }

        let name = ServerName::try_from(target.host.as_str())
            .context("Invalid upstream server name")?
            .to_owned();
        let tls = self
            .tls
            .connect(name, stream)
            .await
            .with_context(|| format!("TLS handshake with {} failed", target.host))?;

        send_over(TokioIo::new(tls), req).await
    }
}

async fn send_over<I>(io: I, req: Request<ProxyBody>) -> anyhow::Result<Response<Incoming>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("Failed to establish connection to upstream")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection error: {}", e);
        }
    });

    sender
        .send_request(req)
        .await
        .context("Failed to send request upstream")
}

fn error_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
