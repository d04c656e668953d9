//! Proxy auto-config document and the loopback server that publishes it
//!
//! The routing policy lives in two forms that must agree: the JavaScript
//! `FindProxyForURL` served to the host, and [`PacDocument::resolve`], a
//! native evaluation of the same rules used by the relay itself and its tests.

use crate::config::{PacConfig, TargetConfig};
use crate::error::Result;
use crate::proxy::ProxyEndpoint;
use crate::server::{self, ListenerHandle};
use anyhow::anyhow;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace};
use url::Url;

pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

const PAC_TEMPLATE: &str = r#"function FindProxyForURL(url, host) {
    var proxy = __PROXY__;

    if (url.indexOf("ws://") === 0 || url.indexOf("wss://") === 0) {
        return "DIRECT";
    }

    if (shExpMatch(host, __HOST_GLOB__)) {
        if (shExpMatch(url, __SESSION_GLOB__)) {
            return proxy;
        }
        // the path may have been stripped before evaluation
        return proxy;
    }

    return "DIRECT";
}
"#;

/// Outcome of evaluating the routing policy for one URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacDecision {
    Direct,
    Proxy(String),
}

impl fmt::Display for PacDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("DIRECT"),
            Self::Proxy(endpoint) => write!(f, "PROXY {}", endpoint),
        }
    }
}

/// Routing script parameterized by the proxy endpoint
#[derive(Debug, Clone)]
pub struct PacDocument {
    host_glob: String,
    session_glob: String,
    endpoint: String,
}

impl PacDocument {
    pub fn new(target: &TargetConfig, endpoint: impl Into<String>) -> Self {
        Self {
            host_glob: target.host_glob(),
            session_glob: target.session_glob(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Render the JavaScript served to the host resolver.
    pub fn render(&self) -> String {
        PAC_TEMPLATE
            .replace("__PROXY__", &js_string(&format!("PROXY {}", self.endpoint)))
            .replace("__HOST_GLOB__", &js_string(&self.host_glob))
            .replace("__SESSION_GLOB__", &js_string(&self.session_glob))
    }

    /// Evaluate the policy for `url`, the way the rendered script would.
    pub fn resolve(&self, url: &str) -> PacDecision {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        self.find_proxy_for_url(url, &host)
    }

    /// Same contract as `FindProxyForURL(url, host)`.
    pub fn find_proxy_for_url(&self, url: &str, host: &str) -> PacDecision {
        if url.starts_with("ws://") || url.starts_with("wss://") {
            return PacDecision::Direct;
        }

        if sh_exp_match(&host.to_ascii_lowercase(), &self.host_glob) {
            // narrowing by path fails open
            if !sh_exp_match(url, &self.session_glob) {
                trace!("{} is outside the session path, proxied anyway", url);
            }
            return PacDecision::Proxy(self.endpoint.clone());
        }

        PacDecision::Direct
    }
}

/// Shell expression match as provided to PAC scripts (`*` and `?` wildcards).
pub fn sh_exp_match(s: &str, pattern: &str) -> bool {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();

    let (mut si, mut pi) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            si += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, si));
            pi += 1;
        } else if let Some((star_pi, star_si)) = star {
            pi = star_pi + 1;
            si = star_si + 1;
            star = Some((star_pi, star_si + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Serves the PAC document on a fixed loopback port
pub struct PacServer {
    config: PacConfig,
    target: TargetConfig,
    endpoint: Arc<RwLock<String>>,
    listener: Option<ListenerHandle>,
}

impl PacServer {
    pub fn new(config: PacConfig, target: TargetConfig) -> Self {
        Self {
            config,
            target,
            endpoint: Arc::new(RwLock::new(String::new())),
            listener: None,
        }
    }

    /// URL the document is published at
    pub fn url(&self) -> String {
        match &self.listener {
            Some(listener) => format!("http://{}{}", listener.local_addr(), self.config.path),
            None => self.config.url(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    /// Change the published endpoint; takes effect on the next request.
    pub fn set_endpoint(&self, endpoint: &ProxyEndpoint) {
        let published = self
            .config
            .external_proxy
            .clone()
            .unwrap_or_else(|| endpoint.to_string());
        *self.endpoint.write() = published;
    }

    /// Current document, as it would be served now
    pub fn document(&self) -> PacDocument {
        PacDocument::new(&self.target, self.endpoint.read().clone())
    }

    /// Start serving for `endpoint`, closing any previous listener first.
    pub async fn start(&mut self, endpoint: &ProxyEndpoint) -> Result<String> {
        self.stop().await;
        self.set_endpoint(endpoint);

        info!("Starting PAC server for proxy: {}", self.endpoint.read());

        let listener = server::bind(self.config.listen_addr()).await?;

        let path = self.config.path.clone();
        let target = self.target.clone();
        let published = self.endpoint.clone();

        let handle = server::spawn("pac", listener, move |stream, _remote_addr| {
            let path = path.clone();
            let target = target.clone();
            let published = published.clone();

            async move {
                http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req| {
                            let document = PacDocument::new(&target, published.read().clone());
                            let path = path.clone();
                            async move { Ok::<_, Infallible>(serve_document(req, &path, &document)) }
                        }),
                    )
                    .await
                    .map_err(|e| anyhow!("PAC service error: {}", e))
            }
        })?;

        self.listener = Some(handle);

        let url = self.url();
        info!("PAC file served at {}", url);

        Ok(url)
    }

    /// Stop serving; a no-op when already stopped.
    pub async fn stop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.close().await;
            info!("PAC server stopped");
        }
    }
}

fn serve_document(req: Request<Incoming>, path: &str, document: &PacDocument) -> Response<Full<Bytes>> {
    if req.uri().path() != path {
        return plain_response(StatusCode::NOT_FOUND, "Not Found");
    }
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    debug!("Client requested PAC script");

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, PAC_CONTENT_TYPE)
        .body(Full::new(Bytes::from(document.render())))
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"))
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}
