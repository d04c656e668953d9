//! Root certificate authority management
//! Generates the local signing identity once, reloads it on later runs and
//! mints per-host leaf certificates for TLS interception

use crate::config::CaConfig;
use crate::error::{RelayError, Result};
use anyhow::{anyhow, bail, Context};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

const CA_CERT_FILE: &str = "rootCA.crt";
const CA_KEY_FILE: &str = "rootCA.key";
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Loaded root CA plus a cache of the leaves it has minted
pub struct RootCertificateAuthority {
    identity: String,
    /// In-memory issuer rebuilt from the persisted parameters.
    issuer: Certificate,
    key: KeyPair,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    leaves: DashMap<String, Arc<CertifiedKey>>,
}

impl std::fmt::Debug for RootCertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCertificateAuthority")
            .field("identity", &self.identity)
            .field("leaves", &self.leaves.len())
            .finish()
    }
}

impl RootCertificateAuthority {
    /// Issuer identity string (the certificate's common name)
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// PEM of the persisted root certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// DER of the persisted root certificate
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Number of leaves minted so far
    pub fn cached_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// Get or mint a leaf certificate for `host`, signed by this CA.
    pub fn certified_key(&self, host: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Some(key) = self.leaves.get(&host) {
            return Ok(key.clone());
        }

        debug!("Minting leaf certificate for {}", host);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host.as_str());
        params.distinguished_name = dn;

        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(host.as_str().try_into()?)],
        };
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &self.issuer, &self.key)?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| anyhow!("unsupported leaf key: {}", e))?;

        let chain = vec![leaf.der().clone(), self.cert_der.clone()];
        let certified = Arc::new(CertifiedKey::new(chain, signing_key));

        self.leaves.insert(host, certified.clone());

        Ok(certified)
    }
}

/// Locates, loads and generates the root CA on disk
#[derive(Debug, Clone)]
pub struct CertificateManager {
    certs_dir: PathBuf,
    common_name: String,
}

impl CertificateManager {
    pub fn new(config: &CaConfig) -> Self {
        Self {
            certs_dir: config.dir.clone(),
            common_name: config.common_name.clone(),
        }
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    pub fn cert_path(&self) -> PathBuf {
        self.certs_dir.join(CA_CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.certs_dir.join(CA_KEY_FILE)
    }

    /// Whether a persisted certificate/key pair is present
    pub fn exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Load the persisted CA, generating and persisting one on first run.
    ///
    /// An existing pair is never replaced: if it cannot be loaded the call
    /// fails instead of minting a new identity.
    pub fn ensure(&self) -> Result<RootCertificateAuthority> {
        let outcome = if self.exists() {
            info!("Root CA already exists, loading {}", self.cert_path().display());
            self.load()
        } else {
            if self.cert_path().exists() || self.key_path().exists() {
                warn!("Incomplete root CA in {}, regenerating", self.certs_dir.display());
            }
            self.generate()
        };

        outcome.map_err(|e| RelayError::CaGeneration(format!("{:#}", e)))
    }

    fn ca_params(common_name: &str) -> CertificateParams {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "HiresProxy");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        params
    }

    fn generate(&self) -> anyhow::Result<RootCertificateAuthority> {
        info!("Generating root CA '{}'", self.common_name);

        let key = KeyPair::generate().context("failed to generate CA key")?;
        let cert = Self::ca_params(&self.common_name)
            .self_signed(&key)
            .context("failed to self-sign CA certificate")?;

        fs::create_dir_all(&self.certs_dir)
            .with_context(|| format!("failed to create {}", self.certs_dir.display()))?;

        let cert_pem = cert.pem();
        fs::write(self.cert_path(), &cert_pem)
            .with_context(|| format!("failed to write {}", self.cert_path().display()))?;
        write_restricted(&self.key_path(), &key.serialize_pem())
            .with_context(|| format!("failed to write {}", self.key_path().display()))?;

        info!("Root CA generated at {}", self.cert_path().display());

        Ok(RootCertificateAuthority {
            identity: self.common_name.clone(),
            cert_der: cert.der().clone(),
            issuer: cert,
            key,
            cert_pem,
            leaves: DashMap::new(),
        })
    }

    fn load(&self) -> anyhow::Result<RootCertificateAuthority> {
        let cert_pem = fs::read_to_string(self.cert_path()).context("failed to read CA certificate")?;
        let key_pem = fs::read_to_string(self.key_path()).context("failed to read CA private key")?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| anyhow!("no certificate in {}", self.cert_path().display()))?
            .context("malformed CA certificate PEM")?;

        let key = KeyPair::from_pem(&key_pem).context("malformed CA private key")?;

        let (_, parsed) = X509Certificate::from_der(cert_der.as_ref())
            .map_err(|e| anyhow!("malformed CA certificate: {}", e))?;

        if !parsed.is_ca() {
            bail!("{} is not a CA certificate", self.cert_path().display());
        }
        if parsed.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
            bail!("CA private key does not match the certificate");
        }

        let identity = common_name(parsed.subject())
            .ok_or_else(|| anyhow!("CA certificate has no common name"))?;
        if identity != self.common_name {
            warn!(
                "Persisted CA is named '{}', configured name '{}' will not match it",
                identity, self.common_name
            );
        }

        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .context("failed to read CA parameters")?;
        let issuer = params.self_signed(&key).context("failed to rebuild CA issuer")?;

        debug!("Loaded root CA '{}'", identity);

        Ok(RootCertificateAuthority {
            identity,
            issuer,
            key,
            cert_pem,
            cert_der,
            leaves: DashMap::new(),
        })
    }
}

/// First common name in an X.509 name
pub fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

#[cfg(unix)]
fn write_restricted(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, content)
}
