//! A forward HTTP/HTTPS proxy that can terminate client TLS with a local
//! CA so pluggable sniffers can observe cleartext.
//!
//! Clients speak ordinary absolute-URI HTTP or `CONNECT host:port`. Each
//! accepted connection is dispatched to one of three paths: forward HTTP
//! (dial the origin, pump the exchange through), opaque tunnel (acknowledge
//! the CONNECT and splice bytes), or interception (forge a leaf certificate
//! for the requested host, terminate TLS, and re-run the exchange on the
//! decrypted stream). Upstream traffic can be chained through an HTTP,
//! HTTPS or SOCKS5 super-proxy.

mod builder;
mod client;
mod config;
mod errors;
mod mitm;
mod observe;
mod request;
mod response;
mod server;
mod stream;
mod superproxy;

pub use builder::ProxyBuilder;
pub use client::HttpClient;
pub use config::{ProxyConfig, DEFAULT_MAX_WORKERS};
pub use errors::{ProxyError, TlsError, TransportError, TunnelError};
pub use observe::{LogSniffer, LogSnifferPool, NopSnifferPool, SnifferPool};
pub use request::Request;
pub use response::Response;
pub use server::{ProxyHandle, ProxyServer};
pub use stream::{PrefixedStream, TunnelStream, UpstreamStream};
pub use superproxy::{SuperProxy, SuperProxyKind};

pub use periscope_http::{
    BufferedReader, BufferedWriter, BufioPool, ByteBufferPool, NopSniffer, Sniffer,
};
pub use periscope_tls::{CaMaterial, CertStore};
