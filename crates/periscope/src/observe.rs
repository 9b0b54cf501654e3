use std::net::SocketAddr;
use std::sync::Arc;

use periscope_http::{NopSniffer, Sniffer};

/// Factory of per-client-address sniffers. One sniffer is fetched per
/// accepted connection and shared by every exchange on it.
pub trait SnifferPool: Send + Sync {
    fn get(&self, client: SocketAddr) -> Arc<dyn Sniffer>;
}

/// Pool that hands every connection the same discard-everything sniffer.
pub struct NopSnifferPool {
    sniffer: Arc<dyn Sniffer>,
}

impl NopSnifferPool {
    pub fn new() -> Self {
        Self {
            sniffer: Arc::new(NopSniffer),
        }
    }
}

impl Default for NopSnifferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SnifferPool for NopSnifferPool {
    fn get(&self, _client: SocketAddr) -> Arc<dyn Sniffer> {
        Arc::clone(&self.sniffer)
    }
}

/// Sniffer that logs start lines at debug level, tagged with the client
/// address. The default for the CLI binary.
pub struct LogSniffer {
    client: SocketAddr,
}

impl Sniffer for LogSniffer {
    fn req_line(&self, line: &[u8]) {
        tracing::debug!(client = %self.client, line = %String::from_utf8_lossy(line).trim_end(), "request");
    }

    fn resp_line(&self, line: &[u8]) {
        tracing::debug!(client = %self.client, line = %String::from_utf8_lossy(line).trim_end(), "response");
    }
}

/// Pool producing [`LogSniffer`]s.
#[derive(Default)]
pub struct LogSnifferPool;

impl SnifferPool for LogSnifferPool {
    fn get(&self, client: SocketAddr) -> Arc<dyn Sniffer> {
        Arc::new(LogSniffer { client })
    }
}
