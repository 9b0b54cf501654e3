use thiserror::Error;

/// Failures raised while reading or interpreting HTTP/1.x framing.
///
/// Everything except `Io` is answered downstream with a `400`; `Io` carries
/// the transport failure (including `UnexpectedEof`) to the caller, which
/// decides between `502`, `501` and a silent drop.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request line: {0}")]
    BadRequestLine(String),
    #[error("malformed header field: {0}")]
    BadHeader(String),
    #[error("malformed chunk framing: {0}")]
    BadChunk(String),
    #[error("header block exceeded {0} bytes")]
    HeaderTooLarge(usize),
    #[error("request carries no target authority")]
    NoHostProvided,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// True when the failure is a framing problem in the peer's bytes, as
    /// opposed to a transport-level read/write failure.
    pub fn is_framing(&self) -> bool {
        !matches!(self, ParseError::Io(_))
    }
}
