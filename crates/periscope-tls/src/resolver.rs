use std::sync::{Arc, Mutex};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::cert_store::CertStore;

/// Certificate resolver for the MITM server handshake.
///
/// Records the SNI name presented in the ClientHello and serves a leaf
/// minted for exactly that name, so a cached CONNECT-authority leaf whose
/// SAN does not cover the SNI is superseded automatically. A hello without
/// SNI is declined, which aborts the handshake; the caller turns that into
/// its no-SNI error.
pub struct SniResolver {
    store: Arc<CertStore>,
    server_name: Mutex<Option<String>>,
}

impl SniResolver {
    pub fn new(store: Arc<CertStore>) -> Self {
        Self {
            store,
            server_name: Mutex::new(None),
        }
    }

    /// The SNI captured during the handshake, if the client sent one.
    pub fn server_name(&self) -> Option<String> {
        self.server_name.lock().expect("sni slot lock").clone()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_string();
        *self.server_name.lock().expect("sni slot lock") = Some(name.clone());
        match self.store.certified_key_for_host(&name) {
            Ok(key) => Some(key),
            Err(error) => {
                tracing::error!(host = %name, %error, "leaf mint failed during handshake");
                None
            }
        }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("server_name", &self.server_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaMaterial;

    #[test]
    fn server_name_slot_starts_empty() {
        let ca = CaMaterial::generate("periscope test CA", "periscope").expect("generate ca");
        let resolver = SniResolver::new(Arc::new(CertStore::new(ca, 8)));
        assert_eq!(resolver.server_name(), None);
    }
}
