//! HiresProxy - Main entry point
//!
//! Runs the relay standalone: the PAC URL is printed for the user to set as
//! the system or browser proxy auto-config address

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use hiresproxy::{
    CaConfig, CertificateManager, Coordinator, MonitorSettings, NetworkContext, PacConfig,
    ProxyConfig, ProxyMode, RelayConfig, TargetConfig, TrustBridge,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// HiresProxy - requests high resolution cloud-gaming sessions
#[derive(Parser, Debug)]
#[command(name = "hiresproxy")]
#[command(author = "HiresProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Selective MITM proxy that renegotiates cloud-gaming session parameters")]
struct Args {
    /// Interception proxy listen address
    #[arg(long, env = "PROXY_HOST", default_value = "127.0.0.1")]
    proxy_host: IpAddr,

    /// Interception proxy port
    #[arg(long, env = "PROXY_PORT", default_value = "8082")]
    proxy_port: u16,

    /// PAC server port (loopback only)
    #[arg(long, env = "PAC_PORT", default_value = "3000")]
    pac_port: u16,

    /// PAC document path
    #[arg(long, env = "PAC_PATH", default_value = "/proxy.pac")]
    pac_path: String,

    /// Publish this host:port in the PAC instead of the local proxy
    #[arg(long, env = "EXTERNAL_PROXY")]
    external_proxy: Option<String>,

    /// Root CA directory
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// Root CA common name
    #[arg(long, env = "CA_NAME", default_value = "HiresProxy Root CA")]
    ca_name: String,

    /// Backend domain whose subdomains are intercepted
    #[arg(long, env = "TARGET_DOMAIN", default_value = "nvidiagrid.net")]
    target_domain: String,

    /// Session negotiation path
    #[arg(long, env = "SESSION_PATH", default_value = "/v2/session")]
    session_path: String,

    /// Requested width in pixels
    #[arg(long, env = "TARGET_WIDTH", default_value = "3440")]
    width: u32,

    /// Requested height in pixels
    #[arg(long, env = "TARGET_HEIGHT", default_value = "1440")]
    height: u32,

    /// Requested frame rate
    #[arg(long, env = "TARGET_FPS", default_value = "120")]
    fps: u32,

    /// Upstream address override, HOST=IP:PORT (repeatable)
    #[arg(long, value_parser = parse_resolve)]
    resolve: Vec<(String, SocketAddr)>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Debug logging regardless of --log-level
    #[arg(long, short)]
    verbose: bool,
}

fn parse_resolve(value: &str) -> std::result::Result<(String, SocketAddr), String> {
    let (host, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected HOST=IP:PORT, got '{}'", value))?;
    let addr = addr
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
    Ok((host.to_string(), addr))
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            target: TargetConfig {
                domain: self.target_domain.clone(),
                session_path: self.session_path.clone(),
                monitor: MonitorSettings {
                    width: self.width,
                    height: self.height,
                    fps: self.fps,
                },
            },
            proxy: ProxyConfig {
                listen_host: self.proxy_host,
                port: self.proxy_port,
                resolve: self.resolve.iter().cloned().collect::<HashMap<_, _>>(),
            },
            pac: PacConfig {
                port: self.pac_port,
                path: self.pac_path.clone(),
                external_proxy: self.external_proxy.clone(),
            },
            ca: CaConfig {
                dir: self.certs_dir.clone(),
                common_name: self.ca_name.clone(),
            },
        }
    }
}

/// Host context for a standalone run: the user configures the system proxy
struct ConsoleContext;

#[async_trait]
impl NetworkContext for ConsoleContext {
    fn install_trust_bridge(&self, bridge: Arc<TrustBridge>) {
        info!(
            "Install the root CA '{}' as trusted to accept intercepted connections",
            bridge.issuer_identity()
        );
    }

    async fn set_proxy_mode(&self, mode: ProxyMode) -> Result<()> {
        match mode {
            ProxyMode::Pac(url) => info!("Set the proxy auto-config URL to {}", url),
            ProxyMode::Direct => info!("The proxy auto-config URL can be removed"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        _ if args.verbose => Level::DEBUG,
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting HiresProxy v1.0.0");

    let config = args.relay_config();
    info!(
        "Requesting {}x{}@{} from *.{}",
        config.target.monitor.width,
        config.target.monitor.height,
        config.target.monitor.fps,
        config.target.domain
    );

    let cert_path = CertificateManager::new(&config.ca).cert_path();
    let mut coordinator = Coordinator::new(config);
    let ready = coordinator
        .start(Arc::new(ConsoleContext))
        .await
        .context("Relay failed to start")?;

    if let Some(ca) = coordinator.ca() {
        info!("Root CA certificate: {}", cert_path.display());
        info!("Root CA identity: {}", ca.identity());
    }
    if !ready.proxy_applied {
        warn!("PAC configuration was not applied, set {} manually", ready.pac_url);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    coordinator.shutdown().await;

    Ok(())
}
