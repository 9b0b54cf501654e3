//! CA material handling and on-demand leaf certificate minting.
//!
//! The proxy terminates client TLS by presenting leaves signed by a local
//! CA. [`CaMaterial`] loads or generates that CA; [`CertStore`] mints and
//! caches per-host leaves; [`SniResolver`] plugs the store into a rustls
//! server handshake and records the client's SNI on the way through.

mod ca;
mod cert_store;
mod client;
mod resolver;

pub use ca::CaMaterial;
pub use cert_store::{CertStore, CertStoreMetrics};
pub use client::upstream_client_config;
pub use resolver::SniResolver;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid certificate authority material: {0}")]
    InvalidCa(String),
}
