/// Passive observer of one proxied exchange.
///
/// Calls arrive in stream order: request line, request headers, request body
/// chunks, response line, response headers, response body chunks. Sniffers
/// must not block and never see a byte the peer did not.
pub trait Sniffer: Send + Sync {
    fn req_line(&self, _line: &[u8]) {}
    fn resp_line(&self, _line: &[u8]) {}
    fn header(&self, _block: &[u8]) {}
    fn body(&self, _chunk: &[u8]) {}
}

/// Sniffer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopSniffer;

impl Sniffer for NopSniffer {}
