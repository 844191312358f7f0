//! Certificate Authority & Leaf Mint
//!
//! Generates or loads a long-lived root CA, then mints short-lived leaf certificates on demand
//! for whatever hostname a client's `CONNECT` targets, so the proxy can terminate TLS for that
//! host with a certificate chained to a locally-trusted CA.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, info};

use crate::error::CertError;
use crate::metrics::Metrics;

/// Leaves mint with this CN/SAN set and never outlive `now + LEAF_VALIDITY_DAYS`.
const LEAF_VALIDITY_DAYS: i64 = 825;
const LEAF_BACKDATE_HOURS: i64 = 1;
const CA_VALIDITY_YEARS: i64 = 10;
const DEFAULT_LEAF_CACHE_CAPACITY: usize = 1024;

/// A minted leaf identity: private key (DER, PKCS#8) and full chain (leaf first, then CA).
#[derive(Clone)]
pub struct LeafCert {
    pub key_der: Arc<PrivatePkcs8KeyDer<'static>>,
    pub chain: Arc<Vec<CertificateDer<'static>>>,
}

/// Root CA key pair and certificate, plus an in-memory LRU of minted leaves.
pub struct CertificateAuthority {
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    issuer: Issuer<'static, KeyPair>,
    leaves: Mutex<LeafLru>,
    metrics: Arc<Metrics>,
}

impl CertificateAuthority {
    /// Load the CA from `cert_dir`, generating and persisting a fresh one if absent.
    pub fn ensure_ca(cert_dir: &Path, metrics: Arc<Metrics>) -> Result<Self, CertError> {
        let key_path = cert_dir.join("ca.key");
        let cert_path = cert_dir.join("ca.crt");

        let (ca_cert_pem, ca_key_pem) = if key_path.exists() && cert_path.exists() {
            info!("loading existing CA from {}", cert_dir.display());
            let cert_pem = read_to_string(&cert_path)?;
            let key_pem = read_to_string(&key_path)?;
            (cert_pem, key_pem)
        } else {
            info!("no CA found in {}, generating a new one", cert_dir.display());
            let (cert_pem, key_pem) = Self::generate_root()?;
            std::fs::create_dir_all(cert_dir).map_err(|source| CertError::Io {
                path: cert_dir.display().to_string(),
                source,
            })?;
            write_with_mode(&key_path, key_pem.as_bytes(), 0o600)?;
            write_with_mode(&cert_path, cert_pem.as_bytes(), 0o644)?;
            (cert_pem, key_pem)
        };

        let ca_key =
            KeyPair::from_pem(&ca_key_pem).map_err(|e| CertError::Params(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| CertError::Params(e.to_string()))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| CertError::Signing(e.to_string()))?;
        let ca_cert_der = ca_cert.der().clone();

        Ok(Self {
            ca_cert_der,
            ca_cert_pem,
            issuer: Issuer::new(params, ca_key),
            leaves: Mutex::new(LeafLru::new(DEFAULT_LEAF_CACHE_CAPACITY)),
            metrics,
        })
    }

    fn generate_root() -> Result<(String, String), CertError> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Revamp Proxy CA");
        dn.push(DnType::OrganizationName, "Revamp Proxy");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now
            .checked_sub(TimeDuration::hours(LEAF_BACKDATE_HOURS))
            .unwrap_or(now);
        params.not_after = now
            .checked_add(TimeDuration::days(365 * CA_VALIDITY_YEARS))
            .unwrap_or(now);

        let key_pair =
            KeyPair::generate().map_err(|e| CertError::KeyGeneration(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CertError::Signing(e.to_string()))?;

        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    /// Mint (or fetch from cache) a leaf identity for `hostname`. Hostnames are canonicalized
    /// to lowercase before lookup/insertion.
    pub fn get_leaf(&self, hostname: &str) -> Result<LeafCert, CertError> {
        let key = hostname.to_ascii_lowercase();

        if let Some(leaf) = self.leaves.lock().expect("leaf cache poisoned").get(&key) {
            return Ok(leaf);
        }

        let leaf = self.mint_leaf(&key)?;
        self.leaves
            .lock()
            .expect("leaf cache poisoned")
            .insert(key, leaf.clone());
        Ok(leaf)
    }

    fn mint_leaf(&self, hostname: &str) -> Result<LeafCert, CertError> {
        debug!("minting leaf certificate for {hostname}");

        let mut params = CertificateParams::default();

        if let Ok(ip) = IpAddr::from_str(hostname) {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            let name = Ia5String::try_from(hostname)
                .map_err(|_| CertError::Params(format!("invalid hostname: {hostname}")))?;
            params.subject_alt_names = vec![SanType::DnsName(name)];
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        dn.push(DnType::OrganizationName, "Revamp Proxy (intercepted)");
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

        let now = OffsetDateTime::now_utc();
        params.not_before = now
            .checked_sub(TimeDuration::hours(LEAF_BACKDATE_HOURS))
            .unwrap_or(now);
        params.not_after = now
            .checked_add(TimeDuration::days(LEAF_VALIDITY_DAYS))
            .unwrap_or(now);

        let key_pair =
            KeyPair::generate().map_err(|e| CertError::KeyGeneration(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CertError::Signing(e.to_string()))?;

        let mut chain = Vec::with_capacity(2);
        chain.push(cert.der().clone());
        chain.push(self.ca_cert_der.clone());

        self.metrics.leaf_certs_minted_total.inc();

        Ok(LeafCert {
            key_der: Arc::new(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
            chain: Arc::new(chain),
        })
    }

    /// CA certificate in PEM form, served by the captive portal endpoint.
    pub fn ca_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn certified_key_for(&self, hostname: &str) -> Result<Arc<CertifiedKey>, CertError> {
        let leaf = self.get_leaf(hostname)?;
        crate::crypto_provider::ensure_installed();
        let provider = rustls::crypto::CryptoProvider::get_default()
            .expect("ensure_installed() just installed a default CryptoProvider");
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.secret_pkcs8_der().to_vec()));
        let signing_key = provider
            .key_provider
            .load_private_key(key_der)
            .map_err(|e| CertError::Signing(e.to_string()))?;
        Ok(Arc::new(CertifiedKey::new(
            leaf.chain.as_ref().clone(),
            signing_key,
        )))
    }
}

/// Implements rustls's dynamic-certificate hook (`ServerConfig::with_cert_resolver`): resolves
/// by the TLS `ClientHello`'s SNI, falling back to the host the client's `CONNECT` named when
/// the handshake carries no SNI at all.
pub struct CertResolver {
    ca: Arc<CertificateAuthority>,
    fallback_host: String,
}

impl CertResolver {
    pub fn new(ca: Arc<CertificateAuthority>, fallback_host: String) -> Self {
        Self { ca, fallback_host }
    }

    /// Build a fresh per-tunnel `ServerConfig` using this resolver. A new `ServerConfig` per
    /// `CONNECT` tunnel is what lets the SNI-less fallback be specific to the host that
    /// particular client asked to `CONNECT` to.
    pub fn server_config(self) -> ServerConfig {
        crate::crypto_provider::ensure_installed();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(self));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("fallback_host", &self.fallback_host)
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello
            .server_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.fallback_host.clone());

        match self.ca.certified_key_for(&hostname) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(hostname, error = %e, "failed to mint leaf for TLS handshake");
                None
            }
        }
    }
}

/// Bounded LRU of minted leaves, keyed by canonical lowercase hostname.
struct LeafLru {
    capacity: usize,
    map: HashMap<String, LeafCert>,
    order: Vec<String>,
}

impl LeafLru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<LeafCert> {
        if let Some(leaf) = self.map.get(key).cloned() {
            self.touch(key);
            Some(leaf)
        } else {
            None
        }
    }

    fn insert(&mut self, key: String, leaf: LeafCert) {
        self.map.insert(key.clone(), leaf);
        self.touch(&key);
        while self.order.len() > self.capacity {
            let oldest = self.order.remove(0);
            self.map.remove(&oldest);
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push(key.to_string());
    }
}

fn read_to_string(path: &Path) -> Result<String, CertError> {
    std::fs::read_to_string(path).map_err(|source| CertError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn write_with_mode(path: &Path, bytes: &[u8], mode: u32) -> Result<(), CertError> {
    std::fs::write(path, bytes).map_err(|source| CertError::Io {
        path: path.display().to_string(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(
            |source| CertError::Io {
                path: path.display().to_string(),
                source,
            },
        )?;
    }
    let _ = mode;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_ca_once_and_reuses_existing_files() {
        let dir = tempdir().unwrap();

        let first = CertificateAuthority::ensure_ca(dir.path(), Arc::new(Metrics::new().unwrap())).unwrap();
        let pem_first = first.ca_pem().to_string();

        let second = CertificateAuthority::ensure_ca(dir.path(), Arc::new(Metrics::new().unwrap())).unwrap();
        assert_eq!(pem_first, second.ca_pem());
    }

    #[test]
    fn leaf_is_cached_and_signed_by_the_same_ca() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::ensure_ca(dir.path(), Arc::new(Metrics::new().unwrap())).unwrap();

        let leaf1 = ca.get_leaf("example.com").unwrap();
        let leaf2 = ca.get_leaf("EXAMPLE.com").unwrap();

        // Canonicalized to lowercase, so this is a cache hit with byte-identical output.
        assert_eq!(leaf1.chain[0].as_ref(), leaf2.chain[0].as_ref());
        assert_eq!(leaf1.chain[1].as_ref(), ca_der(&ca).as_ref());
    }

    #[test]
    fn different_hosts_mint_different_leaves() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::ensure_ca(dir.path(), Arc::new(Metrics::new().unwrap())).unwrap();

        let a = ca.get_leaf("a.example.com").unwrap();
        let b = ca.get_leaf("b.example.com").unwrap();
        assert_ne!(a.chain[0].as_ref(), b.chain[0].as_ref());
    }

    #[test]
    fn leaf_cache_evicts_oldest_beyond_capacity() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::ensure_ca(dir.path(), Arc::new(Metrics::new().unwrap())).unwrap();
        {
            let mut leaves = ca.leaves.lock().unwrap();
            leaves.capacity = 2;
        }

        ca.get_leaf("one.example.com").unwrap();
        ca.get_leaf("two.example.com").unwrap();
        ca.get_leaf("three.example.com").unwrap();

        let leaves = ca.leaves.lock().unwrap();
        assert_eq!(leaves.map.len(), 2);
        assert!(!leaves.map.contains_key("one.example.com"));
    }

    fn ca_der(ca: &CertificateAuthority) -> CertificateDer<'static> {
        ca.ca_cert_der.clone()
    }

    #[test]
    fn certified_key_chain_matches_the_minted_leaf() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::ensure_ca(dir.path(), Arc::new(Metrics::new().unwrap())).unwrap());
        let leaf = ca.get_leaf("example.com").unwrap();

        let certified = ca.certified_key_for("example.com").unwrap();
        assert_eq!(certified.cert[0].as_ref(), leaf.chain[0].as_ref());
        assert_eq!(certified.cert.len(), leaf.chain.len());
    }

    #[test]
    fn cert_resolver_builds_a_server_config() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::ensure_ca(dir.path(), Arc::new(Metrics::new().unwrap())).unwrap());
        let resolver = CertResolver::new(Arc::clone(&ca), "fallback.example.com".to_string());
        let config = resolver.server_config();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
