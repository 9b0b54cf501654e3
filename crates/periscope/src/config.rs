use std::path::PathBuf;
use std::time::Duration;

use periscope_http::{DEFAULT_MAX_HEADER_BYTES, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE};

use crate::errors::ProxyError;

/// Default worker-pool capacity.
pub const DEFAULT_MAX_WORKERS: usize = 256 * 1024;

/// Ceiling on every configurable timeout.
pub(crate) const MAX_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Fixed worker-pool size; submissions past it are answered with 503.
    pub max_workers: usize,
    /// Capacity of pooled read buffers.
    pub bufio_read_size: usize,
    /// Capacity of pooled write buffers.
    pub bufio_write_size: usize,
    /// Cap on request/response header blocks.
    pub max_header_bytes: usize,
    /// Deadline while waiting for the next byte at a message boundary.
    pub idle_timeout: Duration,
    /// Deadline while a body copy is actively moving bytes.
    pub body_stall_timeout: Duration,
    /// Deadline for dials, tunnels and TLS handshakes.
    pub connect_timeout: Duration,
    /// Verify upstream certificates against the bundled web roots.
    pub verify_upstream_tls: bool,
    /// Bounded LRU capacity of the leaf-certificate cache.
    pub leaf_cache_capacity: usize,
    /// CA material on disk; both set or both unset. When unset a fresh CA
    /// is generated at startup.
    pub ca_cert_path: Option<PathBuf>,
    pub ca_key_path: Option<PathBuf>,
    pub ca_common_name: String,
    pub ca_organization: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            bufio_read_size: DEFAULT_READ_BUFFER_SIZE,
            bufio_write_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            idle_timeout: Duration::from_secs(60),
            body_stall_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            verify_upstream_tls: true,
            leaf_cache_capacity: 1024,
            ca_cert_path: None,
            ca_key_path: None,
            ca_common_name: "periscope proxy CA".to_string(),
            ca_organization: "periscope".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.max_workers == 0 {
            return Err(ProxyError::Init(
                "max_workers must be greater than zero".to_string(),
            ));
        }
        if self.bufio_read_size == 0 || self.bufio_write_size == 0 {
            return Err(ProxyError::Init(
                "bufio buffer sizes must be greater than zero".to_string(),
            ));
        }
        if self.max_header_bytes < 1024 {
            return Err(ProxyError::Init(
                "max_header_bytes must be at least 1024".to_string(),
            ));
        }
        for (name, value) in [
            ("idle_timeout", self.idle_timeout),
            ("body_stall_timeout", self.body_stall_timeout),
            ("connect_timeout", self.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(ProxyError::Init(format!("{name} must be non-zero")));
            }
            if value > MAX_TIMEOUT {
                return Err(ProxyError::Init(format!(
                    "{name} exceeds the {}s ceiling",
                    MAX_TIMEOUT.as_secs()
                )));
            }
        }
        if self.leaf_cache_capacity == 0 {
            return Err(ProxyError::Init(
                "leaf_cache_capacity must be greater than zero".to_string(),
            ));
        }
        if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
            return Err(ProxyError::Init(
                "ca_cert_path and ca_key_path must be set together".to_string(),
            ));
        }
        if self.ca_common_name.trim().is_empty() || self.ca_organization.trim().is_empty() {
            return Err(ProxyError::Init(
                "CA subject fields must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
