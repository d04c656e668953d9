//! Host network context integration
//!
//! The embedding application owns the network stack that should route via the
//! PAC document. It is reached through [`NetworkContext`]; [`ClientContext`]
//! is a ready-made implementation for rustls-based clients.

use crate::error::{RelayError, Result};
use crate::trust::{BridgedVerifier, TrustBridge};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustls::ClientConfig;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// How the host network context resolves proxies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMode {
    Direct,
    /// Resolve through the PAC document at this URL.
    Pac(String),
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Pac(url) => write!(f, "pac_script {}", url),
        }
    }
}

#[async_trait]
pub trait NetworkContext: Send + Sync {
    /// Install the certificate validation hook; called before the first request.
    fn install_trust_bridge(&self, bridge: Arc<TrustBridge>);

    async fn set_proxy_mode(&self, mode: ProxyMode) -> anyhow::Result<()>;
}

/// Point the context at the PAC document. Failure leaves the prior mode.
pub async fn apply(pac_url: &str, ctx: &dyn NetworkContext) -> Result<()> {
    match ctx.set_proxy_mode(ProxyMode::Pac(pac_url.to_string())).await {
        Ok(()) => {
            info!("Proxy configuration applied using PAC script: {}", pac_url);
            Ok(())
        }
        Err(e) => {
            warn!("Failed to apply proxy configuration: {:#}", e);
            Err(RelayError::ProxyConfiguration(format!("{:#}", e)))
        }
    }
}

/// Return the context to direct connections.
pub async fn revert(ctx: &dyn NetworkContext) -> Result<()> {
    ctx.set_proxy_mode(ProxyMode::Direct)
        .await
        .map_err(|e| RelayError::ProxyConfiguration(format!("{:#}", e)))?;
    info!("Proxy configuration reverted to direct");
    Ok(())
}

/// In-process context for rustls clients
#[derive(Default)]
pub struct ClientContext {
    mode: RwLock<Option<ProxyMode>>,
    bridge: RwLock<Option<Arc<TrustBridge>>>,
}

impl ClientContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode last set, `None` before the first change
    pub fn proxy_mode(&self) -> Option<ProxyMode> {
        self.mode.read().clone()
    }

    pub fn trust_bridge(&self) -> Option<Arc<TrustBridge>> {
        self.bridge.read().clone()
    }

    /// Client TLS configuration honoring the installed bridge.
    pub fn tls_config(&self) -> anyhow::Result<Arc<ClientConfig>> {
        let config = match self.trust_bridge() {
            Some(bridge) => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(BridgedVerifier::with_webpki_roots(bridge)?))
                .with_no_client_auth(),
            None => ClientConfig::builder()
                .with_root_certificates(crate::trust::webpki_root_store())
                .with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

#[async_trait]
impl NetworkContext for ClientContext {
    fn install_trust_bridge(&self, bridge: Arc<TrustBridge>) {
        *self.bridge.write() = Some(bridge);
    }

    async fn set_proxy_mode(&self, mode: ProxyMode) -> anyhow::Result<()> {
        *self.mode.write() = Some(mode);
        Ok(())
    }
}
