use periscope_http::ParseError;
use periscope_tls::TlsSetupError;
use thiserror::Error;

/// Transport-level failures on either leg of an exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to dial {target}: {source}")]
    DialFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read failed: {0}")]
    ReadFailed(std::io::Error),
    #[error("write failed: {0}")]
    WriteFailed(std::io::Error),
    #[error("stream ended unexpectedly: {0}")]
    UnexpectedEof(std::io::Error),
}

impl TransportError {
    pub(crate) fn from_read(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof(error)
        } else {
            Self::ReadFailed(error)
        }
    }
}

/// TLS failures. Client-facing ones end in a silent drop (the CONNECT
/// acknowledgement is already on the wire); upstream ones behave like
/// transport errors.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(std::io::Error),
    #[error("client did not present an SNI server name")]
    NoSni,
    #[error("leaf certificate signing failed: {0}")]
    CertSignFailed(#[from] TlsSetupError),
}

/// Failures establishing a tunnel through a super-proxy.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("super-proxy requires authentication")]
    AuthRequired,
    #[error("SOCKS5 connect rejected with reply code {0}")]
    SocksReply(u8),
    #[error("malformed super-proxy response: {0}")]
    BadResponse(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Top-level error taxonomy for the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("super-proxy requires authentication")]
    AuthRequired,
    #[error("worker pool overflow")]
    Capacity,
    #[error("listener failed: {0}")]
    Listener(std::io::Error),
    #[error("invalid proxy setup: {0}")]
    Init(String),
}

impl From<TunnelError> for ProxyError {
    fn from(error: TunnelError) -> Self {
        match error {
            TunnelError::AuthRequired => ProxyError::AuthRequired,
            TunnelError::Transport(transport) => ProxyError::Transport(transport),
            other @ (TunnelError::SocksReply(_) | TunnelError::BadResponse(_)) => {
                ProxyError::Transport(TransportError::DialFailed {
                    target: "super-proxy".to_string(),
                    source: std::io::Error::other(other.to_string()),
                })
            }
        }
    }
}

impl ProxyError {
    /// Whether the upstream half of the exchange may be retried, assuming
    /// the idempotency and no-bytes-forwarded gates also pass.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            ProxyError::Transport(_) => true,
            ProxyError::Parse(parse) => !parse.is_framing(),
            _ => false,
        }
    }
}

/// Lift a body-copy failure into the taxonomy: framing problems stay parse
/// errors, I/O problems become transport errors.
pub(crate) fn body_error(error: ParseError) -> ProxyError {
    match error {
        ParseError::Io(io) => TransportError::from_read(io).into(),
        other => other.into(),
    }
}
