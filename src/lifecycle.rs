//! Startup and shutdown sequencing
//!
//! Order matters: the trust bridge is wired before anything can open a TLS
//! connection, the proxy endpoint exists before the PAC document names it,
//! and the host context is pointed at the PAC document last.

use crate::certificate::{CertificateManager, RootCertificateAuthority};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::pac::PacServer;
use crate::proxy::{ProxyEndpoint, ProxyServer};
use crate::session::{self, NetworkContext};
use crate::trust::TrustBridge;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    TrustWired,
    CaReady,
    ProxyListening,
    PacServing,
    Ready,
    /// Startup failed; the host keeps running without rewriting.
    Disabled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::TrustWired => "trust-wired",
            Self::CaReady => "ca-ready",
            Self::ProxyListening => "proxy-listening",
            Self::PacServing => "pac-serving",
            Self::Ready => "ready",
            Self::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Signaled once the whole chain is up
#[derive(Debug, Clone)]
pub struct Ready {
    pub endpoint: ProxyEndpoint,
    pub pac_url: String,
    /// False when the host context refused the PAC configuration.
    pub proxy_applied: bool,
}

/// Owns every running component of the relay
pub struct Coordinator {
    config: RelayConfig,
    stage: Stage,
    bridge: Arc<TrustBridge>,
    bridge_wired: bool,
    ca: Option<Arc<RootCertificateAuthority>>,
    proxy: Option<ProxyServer>,
    pac: PacServer,
    context: Option<Arc<dyn NetworkContext>>,
}

impl Coordinator {
    pub fn new(config: RelayConfig) -> Self {
        let bridge = Arc::new(TrustBridge::new(
            config.target.clone(),
            config.ca.common_name.clone(),
        ));
        let pac = PacServer::new(config.pac.clone(), config.target.clone());

        Self {
            config,
            stage: Stage::Idle,
            bridge,
            bridge_wired: false,
            ca: None,
            proxy: None,
            pac,
            context: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn trust_bridge(&self) -> Arc<TrustBridge> {
        self.bridge.clone()
    }

    /// Root CA in use while running
    pub fn ca(&self) -> Option<Arc<RootCertificateAuthority>> {
        self.ca.clone()
    }

    pub fn endpoint(&self) -> Option<ProxyEndpoint> {
        self.proxy.as_ref().and_then(ProxyServer::endpoint)
    }

    /// Install the trust bridge into `ctx`. Safe to call more than once, and
    /// with a different context on every restart.
    pub fn wire_trust_bridge(&mut self, ctx: &dyn NetworkContext) {
        ctx.install_trust_bridge(self.bridge.clone());
        self.bridge_wired = true;
        info!("Trust bridge installed for '{}'", self.bridge.issuer_identity());

        if self.stage == Stage::Idle {
            self.stage = Stage::TrustWired;
        }
    }

    /// Bring the whole chain up, restarting it if already running.
    ///
    /// CA, proxy and PAC failures disable the coordinator and are returned;
    /// a refused proxy configuration is only reported in [`Ready`].
    pub async fn start(&mut self, ctx: Arc<dyn NetworkContext>) -> Result<Ready> {
        self.teardown().await;

        self.wire_trust_bridge(ctx.as_ref());
        self.stage = Stage::TrustWired;

        match self.bring_up(ctx.as_ref()).await {
            Ok(ready) => {
                self.stage = Stage::Ready;
                // only a context that took the PAC is reverted on shutdown
                if ready.proxy_applied {
                    self.context = Some(ctx);
                }
                info!(
                    "Relay ready: proxy {}, PAC {}{}",
                    ready.endpoint,
                    ready.pac_url,
                    if ready.proxy_applied { "" } else { " (not applied)" }
                );
                Ok(ready)
            }
            Err(e) => {
                error!("Relay disabled at stage {}: {}", self.stage, e);
                self.teardown().await;
                self.stage = Stage::Disabled;
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, ctx: &dyn NetworkContext) -> Result<Ready> {
        let manager = CertificateManager::new(&self.config.ca);
        let ca = tokio::task::spawn_blocking(move || manager.ensure())
            .await
            .map_err(|e| RelayError::CaGeneration(format!("CA task failed: {}", e)))??;

        if ca.identity() != self.bridge.issuer_identity() {
            warn!(
                "Root CA '{}' does not match configured name '{}', trusting the loaded CA",
                ca.identity(),
                self.bridge.issuer_identity()
            );
            self.bridge.set_issuer_identity(ca.identity());
        }

        let ca = Arc::new(ca);
        self.ca = Some(ca.clone());
        self.stage = Stage::CaReady;

        let mut proxy = ProxyServer::new(self.config.proxy.clone(), self.config.target.clone(), ca);
        let endpoint = proxy.start().await?;
        self.proxy = Some(proxy);
        self.stage = Stage::ProxyListening;

        let pac_url = self.pac.start(&endpoint).await?;
        self.stage = Stage::PacServing;

        let proxy_applied = session::apply(&pac_url, ctx).await.is_ok();

        Ok(Ready {
            endpoint,
            pac_url,
            proxy_applied,
        })
    }

    /// Stop everything and revert the host context, best effort.
    pub async fn shutdown(&mut self) {
        self.teardown().await;

        if let Some(ctx) = self.context.take() {
            if let Err(e) = session::revert(ctx.as_ref()).await {
                warn!("{}", e);
            }
        }

        self.stage = if self.bridge_wired {
            Stage::TrustWired
        } else {
            Stage::Idle
        };
        info!("Relay shut down");
    }

    async fn teardown(&mut self) {
        if let Some(mut proxy) = self.proxy.take() {
            proxy.close().await;
        }
        self.pac.stop().await;
        self.ca = None;
    }
}
