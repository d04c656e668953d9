//! Configuration values shared by the relay components
//!
//! Everything here is plain data: built once (usually from CLI arguments),
//! then handed to each component at construction and never mutated.

use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use url::Url;

/// Display mode requested from the backend for a new session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorSettings {
    #[serde(rename = "widthInPixels")]
    pub width: u32,
    #[serde(rename = "heightInPixels")]
    pub height: u32,
    #[serde(rename = "framesPerSecond")]
    pub fps: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            width: 3440,
            height: 1440,
            fps: 120,
        }
    }
}

/// The backend whose session negotiation gets rewritten
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Parent domain; only its subdomains are steered (`*.domain`).
    pub domain: String,
    /// Path prefix of the session-negotiation call.
    pub session_path: String,
    pub monitor: MonitorSettings,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            domain: "nvidiagrid.net".to_string(),
            session_path: "/v2/session".to_string(),
            monitor: MonitorSettings::default(),
        }
    }
}

impl TargetConfig {
    /// Shell-style pattern for the steered hosts, as used in the PAC script.
    pub fn host_glob(&self) -> String {
        format!("*.{}", self.domain)
    }

    /// Shell-style pattern for session-negotiation URLs.
    pub fn session_glob(&self) -> String {
        format!("*{}*", self.session_path)
    }

    /// Whether `host` is a subdomain of the target domain.
    ///
    /// The bare domain does not match, mirroring `shExpMatch(host, "*.domain")`.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let domain = self.domain.trim_end_matches('.').to_ascii_lowercase();

        host.len() > domain.len() + 1
            && host.ends_with(&domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
    }

    /// Whether `url` addresses the session-negotiation endpoint.
    pub fn is_session_url(&self, url: &Url) -> bool {
        let host_matches = url.host_str().map(|h| self.matches_host(h)).unwrap_or(false);
        host_matches && url.path().starts_with(&self.session_path)
    }
}

/// Interception proxy listener configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_host: IpAddr,
    pub port: u16,
    /// Static host overrides for upstream connections, like curl's `--resolve`.
    pub resolve: HashMap<String, SocketAddr>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8082,
            resolve: HashMap::new(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.port)
    }
}

/// PAC script server configuration
#[derive(Debug, Clone)]
pub struct PacConfig {
    pub port: u16,
    pub path: String,
    /// Publish this `host:port` instead of the local proxy endpoint.
    pub external_proxy: Option<String>,
}

impl Default for PacConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            path: "/proxy.pac".to_string(),
            external_proxy: None,
        }
    }
}

impl PacConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.listen_addr(), self.path)
    }
}

/// Root CA location and identity
#[derive(Debug, Clone)]
pub struct CaConfig {
    pub dir: PathBuf,
    /// Common name of the root certificate; doubles as the issuer identity
    /// checked by the trust bridge.
    pub common_name: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./certs"),
            common_name: "HiresProxy Root CA".to_string(),
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub target: TargetConfig,
    pub proxy: ProxyConfig,
    pub pac: PacConfig,
    pub ca: CaConfig,
}
