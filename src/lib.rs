//! HiresProxy - selective MITM relay for cloud-gaming session negotiation
//!
//! Steers one backend's session calls through a local interception proxy:
//! - PAC document routing only the target domain to the proxy
//! - TLS interception with a locally minted root CA
//! - Session request rewriting (client identity, monitor settings)
//! - Trust bridging so the host accepts the minted certificates

pub mod certificate;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pac;
pub mod proxy;
pub mod rewrite;
pub mod server;
pub mod session;
pub mod trust;

pub use certificate::{CertificateManager, RootCertificateAuthority};
pub use config::{CaConfig, MonitorSettings, PacConfig, ProxyConfig, RelayConfig, TargetConfig};
pub use error::{RelayError, Result};
pub use lifecycle::{Coordinator, Ready, Stage};
pub use pac::{PacDecision, PacDocument, PacServer};
pub use proxy::{ProxyEndpoint, ProxyServer};
pub use rewrite::{InterceptedRequest, RewriteOutcome, SessionRewriter};
pub use session::{ClientContext, NetworkContext, ProxyMode};
pub use trust::{BridgedVerifier, TrustBridge, TrustDecision};
