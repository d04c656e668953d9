//! Error taxonomy for the interception subsystem

use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced by the relay components.
///
/// Startup failures (`CaGeneration`, `ListenBind`) are fatal to the component
/// that raised them. `RequestRewrite` is scoped to one request and
/// `ProxyConfiguration` only means the host context was left as it was.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("root CA unavailable: {0}")]
    CaGeneration(String),

    #[error("failed to bind {addr}: {source}")]
    ListenBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("session request rewrite failed: {0}")]
    RequestRewrite(String),

    #[error("proxy configuration not applied: {0}")]
    ProxyConfiguration(String),
}

impl RelayError {
    /// Whether the error should stop the startup sequence.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CaGeneration(_) | Self::ListenBind { .. })
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
