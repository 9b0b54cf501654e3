use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;

use crate::TlsSetupError;

/// The signing CA: an rcgen issuer plus the PEM/DER renditions the rest of
/// the system needs (serving the chain, persisting to disk, trust-store
/// installation by the operator).
#[derive(Debug)]
pub struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
}

impl CaMaterial {
    /// Generate a fresh self-signed CA.
    pub fn generate(common_name: &str, organization: &str) -> Result<Self, TlsSetupError> {
        let ca_key = KeyPair::generate()?;
        let key_pem = ca_key.serialize_pem();

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, organization);
        params.distinguished_name = dn;

        let cert = params.self_signed(&ca_key)?;
        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();
        let issuer = Issuer::new(params, ca_key);

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            key_pem,
        })
    }

    /// Load CA material from PEM bytes.
    pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self, TlsSetupError> {
        if cert_pem.trim().is_empty() {
            return Err(TlsSetupError::InvalidCa(
                "CA certificate PEM is empty".to_string(),
            ));
        }
        if key_pem.trim().is_empty() {
            return Err(TlsSetupError::InvalidCa("CA key PEM is empty".to_string()));
        }

        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            TlsSetupError::InvalidCa(format!("failed to parse CA certificate PEM: {error}"))
        })?;
        let ca_key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
            TlsSetupError::InvalidCa(format!("failed to parse issuer from CA certificate: {error}"))
        })?;

        Ok(Self {
            issuer,
            cert_der,
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    pub fn load_from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsSetupError> {
        let cert_pem = fs::read_to_string(cert_path.as_ref())?;
        let key_pem = fs::read_to_string(key_path.as_ref())?;
        Self::load(&cert_pem, &key_pem)
    }

    pub fn persist(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), TlsSetupError> {
        ensure_parent_exists(cert_path.as_ref())?;
        ensure_parent_exists(key_path.as_ref())?;
        fs::write(cert_path.as_ref(), self.cert_pem.as_bytes())?;
        fs::write(key_path.as_ref(), self.key_pem.as_bytes())?;
        Ok(())
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

fn ensure_parent_exists(path: &Path) -> Result<(), TlsSetupError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::CaMaterial;
    use crate::TlsSetupError;

    #[test]
    fn generated_ca_round_trips_through_pem() {
        let generated = CaMaterial::generate("periscope test CA", "periscope").expect("generate");
        let loaded =
            CaMaterial::load(generated.cert_pem(), generated.key_pem()).expect("load generated");
        assert_eq!(loaded.cert_der(), generated.cert_der());
    }

    #[test]
    fn empty_pem_is_rejected() {
        let error = CaMaterial::load("", "key").expect_err("empty cert must fail");
        assert!(matches!(error, TlsSetupError::InvalidCa(_)));
    }

    #[test]
    fn persist_and_reload_from_disk() {
        let dir = std::env::temp_dir().join(format!(
            "periscope-ca-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let cert_path = dir.join("ca-cert.pem");
        let key_path = dir.join("ca-key.pem");

        let ca = CaMaterial::generate("periscope test CA", "periscope").expect("generate");
        ca.persist(&cert_path, &key_path).expect("persist");

        let reloaded = CaMaterial::load_from_files(&cert_path, &key_path).expect("reload");
        assert_eq!(reloaded.cert_pem(), ca.cert_pem());

        std::fs::remove_dir_all(&dir).expect("cleanup");
    }
}
