//! HTTP/1.x wire plumbing shared by the periscope proxy: pooled buffers,
//! buffered stream adapters, start-line and header parsing, and the three
//! body-copy modes (fixed length, chunked, identity-until-EOF).
//!
//! Everything here operates on raw bytes and forwards them verbatim; the
//! only rewriting the proxy ever performs is the request-line rebuild.

mod body;
mod buffered;
mod error;
mod headers;
mod pool;
mod request_line;
mod response_line;
mod sniffer;

pub use body::copy_body;
pub use buffered::{BufferedReader, BufferedWriter};
pub use error::ParseError;
pub use headers::{BodyKind, Header};
pub use pool::{BufioPool, ByteBufferPool, PooledBuf};
pub use request_line::{HttpVersion, RequestLine};
pub use response_line::ResponseLine;
pub use sniffer::{NopSniffer, Sniffer};

/// Default capacity of pooled read buffers.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
/// Default capacity of pooled write buffers.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024;
/// Default cap on a request or response header block.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;
/// Cap on a single chunk-size line, extensions included.
pub const CHUNK_SIZE_LINE_LIMIT: usize = 1024;
