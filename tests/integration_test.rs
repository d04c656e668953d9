//! Integration tests for HiresProxy
//!
//! Tests the relay end to end:
//! - PAC publishing and routing
//! - Session rewriting through the proxy
//! - TLS interception with the bridged verifier
//! - Startup failure and restart behavior

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hiresproxy::rewrite::NATIVE_USER_AGENT;
use hiresproxy::trust::issuer_identity;
use hiresproxy::{
    CaConfig, CertificateManager, ClientContext, Coordinator, NetworkContext, PacConfig,
    PacDecision, PacDocument, ProxyConfig, ProxyEndpoint, ProxyMode, ProxyServer, RelayConfig,
    RelayError, RootCertificateAuthority, Stage, TargetConfig, TrustBridge,
};
use rustls::pki_types::ServerName;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const SESSION_HOST: &str = "api.session.test";

/// Serve the echo service on one connection: answers every request with a
/// JSON description of it
async fn serve_echo<I>(io: I, counter: Arc<AtomicUsize>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);

            let method = req.method().to_string();
            let path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            let headers: HashMap<String, String> = req
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let body = req.into_body().collect().await.unwrap().to_bytes();

            let echo = json!({
                "method": method,
                "path": path,
                "headers": headers,
                "body": String::from_utf8_lossy(&body),
            });

            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(echo.to_string()))))
        }
    });

    let _ = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await;
}

/// Plain HTTP echo backend
async fn run_echo_backend(port: u16) -> Arc<AtomicUsize> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(serve_echo(stream, counter.clone()));
        }
    });

    hits
}

/// Always presents the same certificate
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// HTTPS echo backend presenting `cert`
async fn run_tls_echo_backend(port: u16, cert: Arc<CertifiedKey>) -> Arc<AtomicUsize> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(cert)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let acceptor = acceptor.clone();
            let counter = counter.clone();

            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_echo(tls, counter).await;
                }
            });
        }
    });

    hits
}

fn session_target() -> TargetConfig {
    TargetConfig {
        domain: "session.test".to_string(),
        ..TargetConfig::default()
    }
}

fn relay_config(certs_dir: &Path, proxy_port: u16, pac_port: u16) -> RelayConfig {
    RelayConfig {
        target: session_target(),
        proxy: ProxyConfig {
            port: proxy_port,
            ..ProxyConfig::default()
        },
        pac: PacConfig {
            port: pac_port,
            ..PacConfig::default()
        },
        ca: CaConfig {
            dir: certs_dir.to_path_buf(),
            ..CaConfig::default()
        },
    }
}

fn load_ca(certs_dir: &Path) -> Arc<RootCertificateAuthority> {
    let manager = CertificateManager::new(&CaConfig {
        dir: certs_dir.to_path_buf(),
        ..CaConfig::default()
    });
    Arc::new(manager.ensure().unwrap())
}

/// Proxy for `session.test` whose upstream for SESSION_HOST is `upstream`
async fn start_proxy(certs_dir: &Path, upstream: SocketAddr) -> (ProxyServer, ProxyEndpoint) {
    let config = ProxyConfig {
        port: get_unique_port(),
        resolve: HashMap::from([(SESSION_HOST.to_string(), upstream)]),
        ..ProxyConfig::default()
    };
    let mut proxy = ProxyServer::new(config, session_target(), load_ca(certs_dir));
    let endpoint = proxy.start().await.unwrap();
    (proxy, endpoint)
}

fn proxied_client(endpoint: &ProxyEndpoint) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{}", endpoint)).unwrap())
        .build()
        .unwrap()
}

fn session_payload() -> Value {
    json!({
        "sessionRequestData": {
            "appId": 42,
            "clientRequestMonitorSettings": [
                { "widthInPixels": 1920, "heightInPixels": 1080, "framesPerSecond": 60 }
            ]
        }
    })
}

/// Open a CONNECT tunnel through the proxy and return the raw stream
async fn connect_tunnel(endpoint: &ProxyEndpoint, authority: &str) -> TcpStream {
    let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .unwrap();
    let request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "proxy closed the tunnel");
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT reply: {}", head);
    stream
}

struct RefusingContext;

#[async_trait]
impl NetworkContext for RefusingContext {
    fn install_trust_bridge(&self, _bridge: Arc<TrustBridge>) {}

    async fn set_proxy_mode(&self, _mode: ProxyMode) -> anyhow::Result<()> {
        anyhow::bail!("proxy settings are managed by policy")
    }
}

#[tokio::test]
async fn test_pac_end_to_end() {
    let dir = tempdir().unwrap();
    let proxy_port = get_unique_port();
    let pac_port = get_unique_port();

    let ctx = Arc::new(ClientContext::new());
    let mut coordinator = Coordinator::new(relay_config(&dir.path().join("certs"), proxy_port, pac_port));

    let ready = coordinator.start(ctx.clone()).await.unwrap();

    assert_eq!(coordinator.stage(), Stage::Ready);
    assert_eq!(ready.endpoint, ProxyEndpoint::new("127.0.0.1", proxy_port));
    assert_eq!(ready.pac_url, format!("http://127.0.0.1:{}/proxy.pac", pac_port));
    assert_eq!(ctx.proxy_mode(), Some(ProxyMode::Pac(ready.pac_url.clone())));

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let response = client.get(&ready.pac_url).send().await.unwrap();

    assert!(response.status().is_success());
    assert_eq!(
        response.headers()["content-type"],
        "application/x-ns-proxy-autoconfig"
    );

    let script = response.text().await.unwrap();
    let published = format!("PROXY 127.0.0.1:{}", proxy_port);
    assert!(script.contains(&published));
    assert!(script.contains("*.session.test"));

    let pac = PacDocument::new(&session_target(), ready.endpoint.to_string());
    assert_eq!(
        pac.resolve("https://api.session.test/v2/session?keyboardLayout=en-US").to_string(),
        published
    );
    assert_eq!(pac.resolve("https://example.org/v2/session"), PacDecision::Direct);
    assert_eq!(pac.resolve("wss://api.session.test/v2/session"), PacDecision::Direct);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_pac_server_rejects_other_paths_and_methods() {
    let dir = tempdir().unwrap();
    let pac_port = get_unique_port();

    let mut coordinator = Coordinator::new(relay_config(
        &dir.path().join("certs"),
        get_unique_port(),
        pac_port,
    ));
    coordinator.start(Arc::new(ClientContext::new())).await.unwrap();

    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    let response = client
        .get(format!("http://127.0.0.1:{}/other.pac", pac_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = client
        .post(format!("http://127.0.0.1:{}/proxy.pac", pac_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_webrtc_session_is_rewritten() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let hits = run_echo_backend(backend_port).await;

    let (mut proxy, endpoint) = start_proxy(
        &dir.path().join("certs"),
        SocketAddr::from(([127, 0, 0, 1], backend_port)),
    )
    .await;

    let response = proxied_client(&endpoint)
        .post(format!("http://{}/v2/session?keyboardLayout=en-US", SESSION_HOST))
        .header("nv-client-streamer", "WEBRTC")
        .header("nv-client-type", "BROWSER")
        .json(&session_payload())
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    let echo: Value = response.json().await.unwrap();

    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["path"], "/v2/session?keyboardLayout=en-US");
    assert_eq!(echo["headers"]["host"], SESSION_HOST);
    assert_eq!(echo["headers"]["nv-client-type"], "NATIVE");
    assert_eq!(echo["headers"]["nv-device-type"], "DESKTOP");
    assert_eq!(echo["headers"]["nv-device-os"], "WINDOWS");
    assert_eq!(echo["headers"]["nv-client-streamer"], "NVIDIA-CLASSIC");
    assert_eq!(echo["headers"]["user-agent"], NATIVE_USER_AGENT);

    let body: Value = serde_json::from_str(echo["body"].as_str().unwrap()).unwrap();
    assert_eq!(body["sessionRequestData"]["appId"], 42);
    assert_eq!(
        body["sessionRequestData"]["clientRequestMonitorSettings"],
        json!([{ "widthInPixels": 3440, "heightInPixels": 1440, "framesPerSecond": 120 }])
    );
    assert_eq!(
        echo["headers"]["content-length"],
        echo["body"].as_str().unwrap().len().to_string()
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    proxy.close().await;
}

#[tokio::test]
async fn test_malformed_session_body_is_not_forwarded() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let hits = run_echo_backend(backend_port).await;

    let (mut proxy, endpoint) = start_proxy(
        &dir.path().join("certs"),
        SocketAddr::from(([127, 0, 0, 1], backend_port)),
    )
    .await;
    let client = proxied_client(&endpoint);

    let response = client
        .put(format!("http://{}/v2/session/123", SESSION_HOST))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // the listener keeps serving
    let response = client
        .get(format!("http://{}/v2/serverInfo", SESSION_HOST))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    proxy.close().await;
}

#[tokio::test]
async fn test_unmatched_requests_pass_through() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let _hits = run_echo_backend(backend_port).await;

    let (mut proxy, endpoint) = start_proxy(
        &dir.path().join("certs"),
        SocketAddr::from(([127, 0, 0, 1], backend_port)),
    )
    .await;
    let client = proxied_client(&endpoint);

    // eligible URL, but not a session change
    let echo: Value = client
        .get(format!("http://{}/v2/session", SESSION_HOST))
        .header("nv-client-streamer", "WEBRTC")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(echo["headers"]["nv-client-streamer"], "WEBRTC");
    assert!(echo["headers"].get("nv-device-os").is_none());

    // other path, body left alone even though it is not JSON
    let echo: Value = client
        .post(format!("http://{}/v2/telemetry", SESSION_HOST))
        .header("nv-client-streamer", "WEBRTC")
        .body("raw payload")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(echo["body"], "raw payload");
    assert_eq!(echo["headers"]["nv-client-streamer"], "WEBRTC");

    proxy.close().await;
}

#[tokio::test]
async fn test_proxy_start_twice_keeps_one_listener() {
    let dir = tempdir().unwrap();
    let port = get_unique_port();

    let config = ProxyConfig {
        port,
        ..ProxyConfig::default()
    };
    let mut proxy = ProxyServer::new(config, session_target(), load_ca(&dir.path().join("certs")));

    let first = proxy.start().await.unwrap();
    let second = proxy.start().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(proxy.endpoint(), Some(second));
    assert!(TcpListener::bind(("127.0.0.1", port)).await.is_err());

    proxy.close().await;
    proxy.close().await;

    assert!(proxy.endpoint().is_none());
    assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
}

#[tokio::test]
async fn test_tls_interception_with_bridged_verifier() {
    let dir = tempdir().unwrap();
    let certs_dir = dir.path().join("certs");
    // nothing listens here
    let upstream = SocketAddr::from(([127, 0, 0, 1], get_unique_port()));

    let (mut proxy, endpoint) = start_proxy(&certs_dir, upstream).await;
    let ca = load_ca(&certs_dir);

    let ctx = ClientContext::new();
    ctx.install_trust_bridge(Arc::new(TrustBridge::new(session_target(), ca.identity())));
    let connector = TlsConnector::from(ctx.tls_config().unwrap());

    let tunnel = connect_tunnel(&endpoint, &format!("{}:443", SESSION_HOST)).await;
    let tls = connector
        .connect(ServerName::try_from(SESSION_HOST).unwrap(), tunnel)
        .await
        .unwrap();

    let leaf = &tls.get_ref().1.peer_certificates().unwrap()[0];
    assert_eq!(issuer_identity(leaf.as_ref()).as_deref(), Some(ca.identity()));

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::get("/v2/session")
        .header("host", SESSION_HOST)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    // decrypted fine, but the origin is unreachable
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // a host outside the target domain is not trusted
    let tunnel = connect_tunnel(&endpoint, "example.org:443").await;
    let result = connector
        .connect(ServerName::try_from("example.org").unwrap(), tunnel)
        .await;
    assert!(result.is_err());

    proxy.close().await;
}

#[tokio::test]
async fn test_webrtc_session_is_rewritten_inside_tls_tunnel() {
    let dir = tempdir().unwrap();
    let certs_dir = dir.path().join("certs");

    // the origin has its own CA, trusted by the proxy's upstream side only
    let origin_ca = CertificateManager::new(&CaConfig {
        dir: dir.path().join("origin"),
        common_name: "Origin Test CA".to_string(),
    })
    .ensure()
    .unwrap();
    let backend_port = get_unique_port();
    let hits = run_tls_echo_backend(backend_port, origin_ca.certified_key(SESSION_HOST).unwrap()).await;

    let mut roots = RootCertStore::empty();
    roots.add(origin_ca.cert_der().clone()).unwrap();

    let ca = load_ca(&certs_dir);
    let config = ProxyConfig {
        port: get_unique_port(),
        resolve: HashMap::from([(
            SESSION_HOST.to_string(),
            SocketAddr::from(([127, 0, 0, 1], backend_port)),
        )]),
        ..ProxyConfig::default()
    };
    let mut proxy = ProxyServer::with_upstream_roots(config, session_target(), ca.clone(), roots);
    let endpoint = proxy.start().await.unwrap();

    let ctx = ClientContext::new();
    ctx.install_trust_bridge(Arc::new(TrustBridge::new(session_target(), ca.identity())));
    let connector = TlsConnector::from(ctx.tls_config().unwrap());

    let tunnel = connect_tunnel(&endpoint, &format!("{}:443", SESSION_HOST)).await;
    let tls = connector
        .connect(ServerName::try_from(SESSION_HOST).unwrap(), tunnel)
        .await
        .unwrap();

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::post("/v2/session?keyboardLayout=en-US")
        .header("host", SESSION_HOST)
        .header("content-type", "application/json")
        .header("nv-client-streamer", "WEBRTC")
        .header("nv-client-type", "BROWSER")
        .body(Full::new(Bytes::from(session_payload().to_string())))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let echo: Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["path"], "/v2/session?keyboardLayout=en-US");
    assert_eq!(echo["headers"]["nv-client-type"], "NATIVE");
    assert_eq!(echo["headers"]["nv-client-streamer"], "NVIDIA-CLASSIC");
    assert_eq!(echo["headers"]["user-agent"], NATIVE_USER_AGENT);

    let body: Value = serde_json::from_str(echo["body"].as_str().unwrap()).unwrap();
    assert_eq!(body["sessionRequestData"]["appId"], 42);
    assert_eq!(
        body["sessionRequestData"]["clientRequestMonitorSettings"],
        json!([{ "widthInPixels": 3440, "heightInPixels": 1440, "framesPerSecond": 120 }])
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    proxy.close().await;
}

#[tokio::test]
async fn test_concurrent_sessions_stay_isolated() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let hits = run_echo_backend(backend_port).await;

    let (mut proxy, endpoint) = start_proxy(
        &dir.path().join("certs"),
        SocketAddr::from(([127, 0, 0, 1], backend_port)),
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0..12u64 {
        let client = proxied_client(&endpoint);

        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let payload = json!({
                    "sessionRequestData": {
                        "appId": i,
                        "clientRequestMonitorSettings": [
                            { "widthInPixels": 1280 + i, "heightInPixels": 720, "framesPerSecond": 30 }
                        ]
                    }
                });
                let echo: Value = client
                    .post(format!("http://{}/v2/session?request={}", SESSION_HOST, i))
                    .header("nv-client-streamer", "WEBRTC")
                    .json(&payload)
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();

                assert_eq!(echo["path"], format!("/v2/session?request={}", i));
                assert_eq!(echo["headers"]["nv-client-streamer"], "NVIDIA-CLASSIC");

                let body: Value = serde_json::from_str(echo["body"].as_str().unwrap()).unwrap();
                assert_eq!(body["sessionRequestData"]["appId"], i);
                assert_eq!(
                    body["sessionRequestData"]["clientRequestMonitorSettings"],
                    json!([{ "widthInPixels": 3440, "heightInPixels": 1440, "framesPerSecond": 120 }])
                );
            } else {
                let payload = format!("telemetry-{}", i);
                let echo: Value = client
                    .post(format!("http://{}/v2/telemetry?request={}", SESSION_HOST, i))
                    .header("nv-client-streamer", "WEBRTC")
                    .body(payload.clone())
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();

                assert_eq!(echo["path"], format!("/v2/telemetry?request={}", i));
                assert_eq!(echo["body"], payload);
                assert_eq!(echo["headers"]["nv-client-streamer"], "WEBRTC");
                assert!(echo["headers"].get("nv-device-os").is_none());
                assert!(echo["headers"].get("user-agent").map_or(true, |ua| ua != NATIVE_USER_AGENT));
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 12);

    proxy.close().await;
}

#[tokio::test]
async fn test_ca_failure_disables_relay() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let proxy_port = get_unique_port();
    let pac_port = get_unique_port();
    let ctx = Arc::new(ClientContext::new());
    let mut coordinator = Coordinator::new(relay_config(&blocker.join("certs"), proxy_port, pac_port));

    let result = coordinator.start(ctx.clone()).await;

    assert!(matches!(result, Err(RelayError::CaGeneration(_))));
    assert_eq!(coordinator.stage(), Stage::Disabled);
    assert_eq!(ctx.proxy_mode(), None);
    assert!(TcpListener::bind(("127.0.0.1", proxy_port)).await.is_ok());
    assert!(TcpListener::bind(("127.0.0.1", pac_port)).await.is_ok());
}

#[tokio::test]
async fn test_proxy_port_conflict_disables_relay() {
    let dir = tempdir().unwrap();
    let proxy_port = get_unique_port();
    let _held = TcpListener::bind(("127.0.0.1", proxy_port)).await.unwrap();

    let mut coordinator = Coordinator::new(relay_config(
        &dir.path().join("certs"),
        proxy_port,
        get_unique_port(),
    ));

    let result = coordinator.start(Arc::new(ClientContext::new())).await;

    assert!(matches!(result, Err(RelayError::ListenBind { .. })));
    assert_eq!(coordinator.stage(), Stage::Disabled);
}

#[tokio::test]
async fn test_refused_proxy_configuration_is_reported() {
    let dir = tempdir().unwrap();
    let pac_port = get_unique_port();
    let mut coordinator = Coordinator::new(relay_config(
        &dir.path().join("certs"),
        get_unique_port(),
        pac_port,
    ));

    let ready = coordinator.start(Arc::new(RefusingContext)).await.unwrap();

    assert!(!ready.proxy_applied);
    assert_eq!(coordinator.stage(), Stage::Ready);

    // the PAC is still served
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let response = client.get(&ready.pac_url).send().await.unwrap();
    assert!(response.status().is_success());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_and_restart_reuse_ports() {
    let dir = tempdir().unwrap();
    let certs_dir = dir.path().join("certs");
    let proxy_port = get_unique_port();
    let pac_port = get_unique_port();
    let ctx = Arc::new(ClientContext::new());

    let mut coordinator = Coordinator::new(relay_config(&certs_dir, proxy_port, pac_port));
    let first = coordinator.start(ctx.clone()).await.unwrap();
    let identity = coordinator.ca().unwrap().identity().to_string();

    coordinator.shutdown().await;
    assert_eq!(ctx.proxy_mode(), Some(ProxyMode::Direct));
    assert!(TcpListener::bind(("127.0.0.1", proxy_port)).await.is_ok());
    assert!(TcpListener::bind(("127.0.0.1", pac_port)).await.is_ok());

    // a fresh coordinator in the same process reuses the persisted CA
    let mut coordinator = Coordinator::new(relay_config(&certs_dir, proxy_port, pac_port));
    let second = coordinator.start(ctx.clone()).await.unwrap();

    assert_eq!(first.endpoint, second.endpoint);
    assert_eq!(coordinator.ca().unwrap().identity(), identity);

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let script = client
        .get(&second.pac_url)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(script.contains(&second.endpoint.to_string()));

    coordinator.shutdown().await;
}
