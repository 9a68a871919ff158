//! Interception root CA and per-host certificates using rcgen.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// File holding the root private key.
pub const CA_KEY_FILE: &str = "hyacine-ca.key.pem";
/// File holding the root certificate operators install as trusted.
pub const CA_CERT_FILE: &str = "hyacine-ca.pem";

/// Lifetime of an issued host certificate.
pub const HOST_CERT_VALIDITY: Duration = Duration::days(7);

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to generate certificate: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid host name: {0}")]
    InvalidHost(String),
}

/// Root CA used to impersonate intercepted hosts.
///
/// The key is persisted so that a root installed in the client's trust
/// store keeps working across restarts.
pub struct CaState {
    ca_cert_pem: String,
    ca_key_pair: KeyPair,
    /// Subject and constraints used as the issuer of host certificates.
    ca_params: CertificateParams,
}

fn root_params() -> CertificateParams {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Hyacine Proxy Root CA");
    dn.push(DnType::OrganizationName, "hyacine-proxy");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(3650);
    params
}

fn read(path: &Path) -> CaResult<String> {
    fs::read_to_string(path).map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> CaResult<()> {
    fs::write(path, contents).map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl CaState {
    /// Generates a root that lives only as long as the process.
    pub fn generate() -> CaResult<Self> {
        let params = root_params();
        let key_pair = KeyPair::generate()?;
        let ca_cert = params.self_signed(&key_pair)?;

        debug!("generated ephemeral root certificate");

        Ok(Self {
            ca_cert_pem: ca_cert.pem(),
            ca_key_pair: key_pair,
            ca_params: params,
        })
    }

    /// Loads the root from `dir`, creating and persisting one if the key
    /// file does not exist yet.
    pub fn load_or_generate(dir: &Path) -> CaResult<Self> {
        let key_path = dir.join(CA_KEY_FILE);
        let cert_path = dir.join(CA_CERT_FILE);

        if !key_path.exists() {
            let ca = Self::generate()?;
            fs::create_dir_all(dir).map_err(|source| CaError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            write(&key_path, &ca.ca_key_pair.serialize_pem())?;
            write(&cert_path, &ca.ca_cert_pem)?;
            info!(
                "created root certificate {}; install it as trusted on the client",
                cert_path.display()
            );
            return Ok(ca);
        }

        let key_pair = KeyPair::from_pem(&read(&key_path)?)?;
        let params = root_params();

        let ca_cert_pem = if cert_path.exists() {
            read(&cert_path)?
        } else {
            let pem = params.self_signed(&key_pair)?.pem();
            write(&cert_path, &pem)?;
            pem
        };

        info!("loaded root certificate from {}", cert_path.display());

        Ok(Self {
            ca_cert_pem,
            ca_key_pair: key_pair,
            ca_params: params,
        })
    }

    /// Returns the root certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issues a certificate for `host` (a DNS name or an IP) that expires
    /// `validity` from now.
    pub fn generate_host_cert(&self, host: &str, validity: Duration) -> CaResult<CertifiedKey> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|_| CaError::InvalidHost(host.to_string()))?,
            ),
        };

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + validity;

        let host_key_pair = KeyPair::generate()?;
        let issuer = Issuer::from_params(&self.ca_params, &self.ca_key_pair);
        let host_cert = params.signed_by(&host_key_pair, &issuer)?;

        let cert_der = CertificateDer::from(host_cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(host_key_pair.serialize_der()));

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(CaError::SigningKey)?;

        debug!("issued certificate for {}", host);

        Ok(CertifiedKey::new(vec![cert_der], signing_key))
    }
}

struct CachedCert {
    key: Arc<CertifiedKey>,
    /// Past this point the entry is reissued instead of served.
    renew_at: OffsetDateTime,
}

/// Host certificates keyed by host name.
///
/// Entries are reissued once three quarters of their validity has passed,
/// so a long-running proxy never serves an expired certificate.
pub struct CertCache {
    ca: Arc<CaState>,
    validity: Duration,
    cache: RwLock<HashMap<String, CachedCert>>,
}

impl CertCache {
    pub fn new(ca: Arc<CaState>) -> Self {
        Self::with_validity(ca, HOST_CERT_VALIDITY)
    }

    pub fn with_validity(ca: Arc<CaState>, validity: Duration) -> Self {
        Self {
            ca,
            validity,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Gets or issues a certified key for `host`.
    pub fn get_or_create(&self, host: &str) -> CaResult<Arc<CertifiedKey>> {
        let host = host.to_ascii_lowercase();
        let now = OffsetDateTime::now_utc();
        if let Ok(cache) = self.cache.read()
            && let Some(entry) = cache.get(&host)
            && now < entry.renew_at
        {
            return Ok(Arc::clone(&entry.key));
        }

        let key = Arc::new(self.ca.generate_host_cert(&host, self.validity)?);
        let renew_at = now + (self.validity - self.validity / 4);

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(
                host,
                CachedCert {
                    key: Arc::clone(&key),
                    renew_at,
                },
            );
        }

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_ca() {
        let ca = CaState::generate().unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    }

    /// Tests that a persisted root is reused instead of replaced, so the
    /// client does not have to trust a new one after every restart.
    #[test]
    fn persisted_root_reused() {
        let dir = tempfile::tempdir().unwrap();

        let first = CaState::load_or_generate(dir.path()).unwrap();
        assert!(dir.path().join(CA_KEY_FILE).exists());
        assert!(dir.path().join(CA_CERT_FILE).exists());

        let second = CaState::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.ca_cert_pem(), second.ca_cert_pem());
        assert_eq!(
            first.ca_key_pair.serialize_pem(),
            second.ca_key_pair.serialize_pem()
        );
    }

    #[test]
    fn host_cert_for_name_and_ip() {
        let ca = CaState::generate().unwrap();
        let name = ca
            .generate_host_cert("sdk.hoyoverse.com", HOST_CERT_VALIDITY)
            .unwrap();
        assert!(!name.cert.is_empty());
        let ip = ca.generate_host_cert("127.0.0.1", HOST_CERT_VALIDITY).unwrap();
        assert!(!ip.cert.is_empty());
    }

    /// Tests that repeated lookups for a host share one certificate.
    #[test]
    fn cert_cache() {
        let cache = CertCache::new(Arc::new(CaState::generate().unwrap()));
        let cert1 = cache.get_or_create("dispatch.starrails.com").unwrap();
        let cert2 = cache.get_or_create("Dispatch.StarRails.com").unwrap();
        assert!(Arc::ptr_eq(&cert1, &cert2));
    }

    /// Tests that an entry past its renewal point is reissued rather than
    /// served from the cache.
    #[test]
    fn cert_cache_reissues_near_expiry() {
        let ca = Arc::new(CaState::generate().unwrap());

        let expiring = CertCache::with_validity(Arc::clone(&ca), Duration::ZERO);
        let cert1 = expiring.get_or_create("sdk.hoyoverse.com").unwrap();
        let cert2 = expiring.get_or_create("sdk.hoyoverse.com").unwrap();
        assert!(!Arc::ptr_eq(&cert1, &cert2));
        assert_ne!(cert1.cert, cert2.cert);

        let short = CertCache::with_validity(ca, Duration::milliseconds(400));
        let cert1 = short.get_or_create("dispatch.starrails.com").unwrap();
        assert!(Arc::ptr_eq(
            &cert1,
            &short.get_or_create("dispatch.starrails.com").unwrap()
        ));
        std::thread::sleep(std::time::Duration::from_millis(350));
        let cert2 = short.get_or_create("dispatch.starrails.com").unwrap();
        assert!(!Arc::ptr_eq(&cert1, &cert2));
    }
}
