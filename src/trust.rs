//! Certificate trust bridging for the host's TLS validation
//!
//! The bridge only ever widens trust for one case: a certificate for a host
//! under the target domain, issued by the local root CA. Everything else keeps
//! the outcome of standard validation.

use crate::certificate::common_name;
use crate::config::TargetConfig;
use anyhow::Context;
use parking_lot::RwLock;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Accept,
    /// Leave the outcome to standard validation.
    Defer,
}

/// Per-handshake trust decision for certificates minted by the local CA
///
/// The issuer identity can be replaced after the bridge is installed, once the
/// root CA actually in use is known.
#[derive(Debug)]
pub struct TrustBridge {
    target: TargetConfig,
    issuer_identity: RwLock<String>,
}

impl TrustBridge {
    pub fn new(target: TargetConfig, issuer_identity: impl Into<String>) -> Self {
        Self {
            target,
            issuer_identity: RwLock::new(issuer_identity.into()),
        }
    }

    pub fn issuer_identity(&self) -> String {
        self.issuer_identity.read().clone()
    }

    /// Trust leaves issued by `identity` from now on.
    pub fn set_issuer_identity(&self, identity: impl Into<String>) {
        *self.issuer_identity.write() = identity.into();
    }

    /// Accept only when `hostname` is under the target domain and the
    /// certificate was issued by the local root CA.
    pub fn decide(&self, hostname: &str, issuer: Option<&str>, default_ok: bool) -> TrustDecision {
        let host_matches = self.target.matches_host(hostname);
        let identity = self.issuer_identity.read();
        let issuer_matches = issuer == Some(identity.as_str());

        if host_matches && issuer_matches {
            debug!("Trusting locally issued certificate for {}", hostname);
            return TrustDecision::Accept;
        }

        if !default_ok && host_matches {
            debug!(
                "Certificate for {} not issued by {} (issuer: {:?})",
                hostname, identity.as_str(), issuer
            );
        }

        TrustDecision::Defer
    }
}

/// Common name of the issuer of a DER certificate.
pub fn issuer_identity(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    common_name(cert.issuer())
}

/// Root store holding the bundled webpki roots.
pub fn webpki_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Standard webpki verification, falling back to the [`TrustBridge`]
#[derive(Debug)]
pub struct BridgedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    bridge: Arc<TrustBridge>,
}

impl BridgedVerifier {
    pub fn new(roots: RootCertStore, bridge: Arc<TrustBridge>) -> anyhow::Result<Self> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .context("Failed to build webpki verifier")?;

        Ok(Self { inner, bridge })
    }

    pub fn with_webpki_roots(bridge: Arc<TrustBridge>) -> anyhow::Result<Self> {
        Self::new(webpki_root_store(), bridge)
    }
}

impl ServerCertVerifier for BridgedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let err = match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => return Ok(verified),
            Err(err) => err,
        };

        let hostname = match server_name {
            ServerName::DnsName(name) => name.as_ref(),
            _ => return Err(err),
        };

        let issuer = issuer_identity(end_entity.as_ref());

        match self.bridge.decide(hostname, issuer.as_deref(), false) {
            TrustDecision::Accept => Ok(ServerCertVerified::assertion()),
            TrustDecision::Defer => {
                if self.bridge.target.matches_host(hostname) {
                    warn!("Rejected certificate for {}: {}", hostname, err);
                }
                Err(err)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
