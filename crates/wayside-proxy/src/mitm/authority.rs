//! Bundled certificate authority for TLS interception.
//!
//! Loads or generates a root, then issues and caches one leaf
//! [`ServerConfig`] per intercepted host.

use super::Mitm;
use crate::error::{BoxError, ProxyError};
use crate::proxy::certs_from_pem;
use hyper::http::request;
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

const CA_COMMON_NAME: &str = "Wayside Interception CA";
const CA_ORGANIZATION: &str = "Wayside";
const MAX_CACHED_HOSTS: usize = 1024;

/// A root CA that signs per-host leaf certificates on demand.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
    validity_days: u32,
    configs: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Create a fresh self-signed root.
    pub fn generate() -> Result<Self, ProxyError> {
        let key = KeyPair::generate().map_err(cert_err)?;
        let key_pem = key.serialize_pem();

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(10 * 365);

        let cert = params.self_signed(&key).map_err(cert_err)?;
        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();
        info!("Generated new interception CA");

        Ok(Self::assemble(Issuer::new(params, key), cert_pem, cert_der, key_pem))
    }

    /// Load a root from PEM-encoded certificate and private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, ProxyError> {
        let cert_der = certs_from_pem(cert_pem.as_bytes())?.swap_remove(0);
        let key = KeyPair::from_pem(key_pem).map_err(cert_err)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(cert_err)?;
        Ok(Self::assemble(
            issuer,
            cert_pem.to_string(),
            cert_der,
            key_pem.to_string(),
        ))
    }

    /// Load the root from disk, or create and persist one when both files are
    /// missing and `generate_if_missing` is set.
    pub fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        generate_if_missing: bool,
    ) -> Result<Self, ProxyError> {
        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let cert_pem = fs::read_to_string(cert_path)?;
                let key_pem = fs::read_to_string(key_path)?;
                let ca = Self::from_pem(&cert_pem, &key_pem)?;
                info!(cert = %cert_path.display(), "Loaded interception CA");
                Ok(ca)
            }
            (false, false) if generate_if_missing => {
                let ca = Self::generate()?;
                ca.persist(cert_path, key_path)?;
                Ok(ca)
            }
            (false, false) => Err(ProxyError::Config(format!(
                "CA certificate {} not found and generation is disabled",
                cert_path.display()
            ))),
            _ => Err(ProxyError::Config(
                "CA certificate and key must both exist or both be absent".into(),
            )),
        }
    }

    fn assemble(
        issuer: Issuer<'static, KeyPair>,
        cert_pem: String,
        cert_der: CertificateDer<'static>,
        key_pem: String,
    ) -> Self {
        Self {
            issuer,
            cert_pem,
            cert_der,
            key_pem,
            validity_days: DEFAULT_VALIDITY_DAYS,
            configs: RwLock::new(HashMap::new()),
        }
    }

    /// How long issued leaf certificates stay valid.
    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days.max(1);
        self
    }

    /// Write certificate and key as PEM, creating parent directories.
    pub fn persist(&self, cert_path: &Path, key_path: &Path) -> Result<(), ProxyError> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(cert_path, self.cert_pem.as_bytes())?;
        fs::write(key_path, self.key_pem.as_bytes())?;
        info!(cert = %cert_path.display(), key = %key_path.display(), "Wrote interception CA");
        Ok(())
    }

    /// The root certificate clients must trust.
    pub fn ca_cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cached_hosts(&self) -> usize {
        self.configs.read().len()
    }

    fn issue(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(cert_err)?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        match host.parse::<IpAddr>() {
            Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
            Err(_) => params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into().map_err(cert_err)?)),
        }
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(i64::from(self.validity_days));

        let key = KeyPair::generate().map_err(cert_err)?;
        let cert = params.signed_by(&key, &self.issuer).map_err(cert_err)?;
        let chain = vec![cert.der().clone(), self.cert_der.clone()];
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

impl Mitm for CertificateAuthority {
    fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, BoxError> {
        let host = normalize_host(host);
        if let Some(config) = self.configs.read().get(&host) {
            return Ok(Arc::clone(config));
        }

        let config = self.issue(&host)?;
        debug!(host = %host, "Issued leaf certificate");

        let mut configs = self.configs.write();
        if configs.len() >= MAX_CACHED_HOSTS {
            configs.clear();
        }
        Ok(Arc::clone(configs.entry(host).or_insert(config)))
    }

    fn handshake_error(&self, parts: &request::Parts, err: &io::Error) {
        warn!(
            host = parts.uri.host().unwrap_or_default(),
            error = %err,
            "Client rejected intercepted handshake (is the CA trusted?)"
        );
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn cert_err(e: rcgen::Error) -> ProxyError {
    ProxyError::Certificate(e.to_string())
}
