use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;

use crate::ca::CaMaterial;
use crate::TlsSetupError;

/// Leaf validity window: backdated one hour against clock skew, one year out.
const LEAF_BACKDATE: time::Duration = time::Duration::hours(1);
const LEAF_LIFETIME: time::Duration = time::Duration::days(365);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CertStoreMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

/// Mints per-host leaf certificates signed by the loaded CA and keeps them
/// in a bounded LRU cache keyed by the (lowercased) host name. Minting uses
/// only the CA issuer plus a fresh per-leaf key, so concurrent mints need no
/// coordination beyond the cache lock.
pub struct CertStore {
    ca: CaMaterial,
    cache: Mutex<LruCache<String, Arc<CertifiedKey>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl CertStore {
    pub fn new(ca: CaMaterial, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("nonzero cache capacity");
        Self {
            ca,
            cache: Mutex::new(LruCache::new(capacity)),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        }
    }

    /// Cached or freshly minted leaf for `host` (a bare DNS name or IP
    /// literal, no port).
    pub fn certified_key_for_host(&self, host: &str) -> Result<Arc<CertifiedKey>, TlsSetupError> {
        let key = normalize_host(host);
        {
            let mut cache = self.cache.lock().expect("leaf cache lock");
            if let Some(hit) = cache.get(&key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(hit));
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let minted = Arc::new(self.mint_leaf(&key)?);
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);

        let mut cache = self.cache.lock().expect("leaf cache lock");
        cache.put(key, Arc::clone(&minted));
        Ok(minted)
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.ca.cert_pem()
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        self.ca.cert_der()
    }

    pub fn metrics(&self) -> CertStoreMetrics {
        CertStoreMetrics {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }

    fn mint_leaf(&self, host: &str) -> Result<CertifiedKey, TlsSetupError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - LEAF_BACKDATE;
        params.not_after = now + LEAF_LIFETIME;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(host.try_into()?));
        }

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, self.ca.issuer())?;

        let chain = vec![leaf_cert.der().clone(), self.ca.cert_der().clone()];
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = any_supported_type(&key_der)?;

        Ok(CertifiedKey::new(chain, signing_key))
    }
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
