use std::sync::Arc;

use periscope_http::{BufioPool, ByteBufferPool};
use periscope_tls::{upstream_client_config, CaMaterial, CertStore};
use tokio::sync::Semaphore;

use crate::client::HttpClient;
use crate::config::ProxyConfig;
use crate::errors::ProxyError;
use crate::observe::SnifferPool;
use crate::server::{DecryptPolicy, ProxyServer, ProxySelector, Shared};
use crate::superproxy::SuperProxy;

/// Assembles a [`ProxyServer`] from configuration and hooks.
///
/// A sniffer pool is mandatory; the decrypt policy defaults to "decrypt
/// nothing" and the proxy selector to "no super-proxy".
pub struct ProxyBuilder {
    config: ProxyConfig,
    decrypt_policy: Option<DecryptPolicy>,
    proxy_selector: Option<ProxySelector>,
    sniffer_pool: Option<Arc<dyn SnifferPool>>,
    ca: Option<CaMaterial>,
}

impl ProxyBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            decrypt_policy: None,
            proxy_selector: None,
            sniffer_pool: None,
            ca: None,
        }
    }

    /// Per-host MITM policy: return true to decrypt the CONNECT target
    /// (`host:port`), false to tunnel it opaquely.
    pub fn with_decrypt_policy(
        mut self,
        policy: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.decrypt_policy = Some(Box::new(policy));
        self
    }

    /// Per-request upstream selector, keyed on the raw request target.
    pub fn with_proxy_selector(
        mut self,
        selector: impl Fn(&[u8]) -> Option<Arc<SuperProxy>> + Send + Sync + 'static,
    ) -> Self {
        self.proxy_selector = Some(Box::new(selector));
        self
    }

    pub fn with_sniffer_pool(mut self, pool: Arc<dyn SnifferPool>) -> Self {
        self.sniffer_pool = Some(pool);
        self
    }

    /// Use this CA instead of loading or generating one.
    pub fn with_ca(mut self, ca: CaMaterial) -> Self {
        self.ca = Some(ca);
        self
    }

    pub fn build(self) -> Result<ProxyServer, ProxyError> {
        self.config.validate()?;
        let sniffer_pool = self
            .sniffer_pool
            .ok_or_else(|| ProxyError::Init("no sniffer pool provided".to_string()))?;

        let ca = match self.ca {
            Some(ca) => ca,
            None => load_or_generate_ca(&self.config)?,
        };
        let cert_store = Arc::new(CertStore::new(ca, self.config.leaf_cache_capacity));

        let bufio_pool = BufioPool::new(self.config.bufio_read_size, self.config.bufio_write_size);
        let scratch_pool = ByteBufferPool::default();
        let client = HttpClient::new(
            bufio_pool.clone(),
            upstream_client_config(self.config.verify_upstream_tls),
            self.config.connect_timeout,
            self.config.idle_timeout,
            self.config.body_stall_timeout,
            self.config.max_header_bytes,
        );
        let workers = Arc::new(Semaphore::new(self.config.max_workers));

        Ok(ProxyServer::new(Shared {
            decrypt_policy: self.decrypt_policy.unwrap_or_else(|| Box::new(|_| false)),
            proxy_selector: self.proxy_selector.unwrap_or_else(|| Box::new(|_| None)),
            sniffer_pool,
            cert_store,
            client,
            bufio_pool,
            scratch_pool,
            workers,
            config: self.config,
        }))
    }
}

fn load_or_generate_ca(config: &ProxyConfig) -> Result<CaMaterial, ProxyError> {
    match (&config.ca_cert_path, &config.ca_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = cert_path.exists();
            let key_exists = key_path.exists();
            match (cert_exists, key_exists) {
                (true, true) => CaMaterial::load_from_files(cert_path, key_path)
                    .map_err(|error| ProxyError::Init(format!("CA load failed: {error}"))),
                (false, false) => {
                    let ca =
                        CaMaterial::generate(&config.ca_common_name, &config.ca_organization)
                            .map_err(|error| {
                                ProxyError::Init(format!("CA generation failed: {error}"))
                            })?;
                    ca.persist(cert_path, key_path).map_err(|error| {
                        ProxyError::Init(format!("CA persistence failed: {error}"))
                    })?;
                    Ok(ca)
                }
                _ => Err(ProxyError::Init(
                    "CA cert and key files must both exist or both be absent".to_string(),
                )),
            }
        }
        (None, None) => {
            tracing::warn!(
                "no CA configured; generated an ephemeral CA — clients must be told to trust it"
            );
            CaMaterial::generate(&config.ca_common_name, &config.ca_organization)
                .map_err(|error| ProxyError::Init(format!("CA generation failed: {error}")))
        }
        _ => Err(ProxyError::Init(
            "ca_cert_path and ca_key_path must be set together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::NopSnifferPool;

    #[test]
    fn build_without_sniffer_pool_fails() {
        let error = ProxyBuilder::new(ProxyConfig::default())
            .build()
            .expect_err("sniffer pool is mandatory");
        assert!(matches!(error, ProxyError::Init(_)));
    }

    #[test]
    fn build_with_defaults_succeeds() {
        ProxyBuilder::new(ProxyConfig::default())
            .with_sniffer_pool(Arc::new(NopSnifferPool::new()))
            .build()
            .expect("default build");
    }
}
