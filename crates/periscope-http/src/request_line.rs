use bytes::BytesMut;
use tokio::io::AsyncRead;

use crate::buffered::BufferedReader;
use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    Http10,
    #[default]
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    fn parse(text: &str) -> Result<Self, ParseError> {
        match text {
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            other => Err(ParseError::BadRequestLine(format!(
                "unsupported HTTP version {other:?}"
            ))),
        }
    }
}

/// Parsed request start line.
///
/// Accepts the three target forms a proxy sees: absolute-URI
/// (`GET http://host/path HTTP/1.1`), origin-form (`GET /path HTTP/1.1`)
/// and authority-form (`CONNECT host:port HTTP/1.1`). The resolved
/// `host:port` comes from the target itself, from an injected authority
/// (the MITM path), or — for origin-form — later from the `Host` header.
#[derive(Debug, Clone, Default)]
pub struct RequestLine {
    method: String,
    raw_uri: String,
    path: String,
    host_with_port: String,
    version: HttpVersion,
    is_connect: bool,
    tls_scheme: bool,
}

impl RequestLine {
    pub async fn parse<R: AsyncRead + Unpin>(
        reader: &mut BufferedReader<R>,
        injected_authority: Option<&str>,
        max_line_bytes: usize,
    ) -> Result<Self, ParseError> {
        let mut raw = BytesMut::with_capacity(128);
        reader.read_line_into(&mut raw, max_line_bytes).await?;
        let text = std::str::from_utf8(&raw[..raw.len() - 2])
            .map_err(|_| ParseError::BadRequestLine("request line is not UTF-8".to_string()))?;

        let mut parts = text.split_whitespace();
        let method = parts
            .next()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ParseError::BadRequestLine("missing method".to_string()))?;
        let target = parts
            .next()
            .ok_or_else(|| ParseError::BadRequestLine("missing target".to_string()))?;
        let version_text = parts
            .next()
            .ok_or_else(|| ParseError::BadRequestLine("missing HTTP version".to_string()))?;
        if parts.next().is_some() {
            return Err(ParseError::BadRequestLine(
                "too many fields in request line".to_string(),
            ));
        }
        let version = HttpVersion::parse(version_text)?;

        let mut line = RequestLine {
            method: method.to_string(),
            raw_uri: target.to_string(),
            version,
            is_connect: method.eq_ignore_ascii_case("CONNECT"),
            ..RequestLine::default()
        };

        if line.is_connect {
            line.host_with_port = ensure_port(target, 443);
            return Ok(line);
        }

        if let Some(rest) = target
            .strip_prefix("http://")
            .map(|r| (r, false))
            .or_else(|| target.strip_prefix("https://").map(|r| (r, true)))
        {
            let (rest, tls) = rest;
            line.tls_scheme = tls;
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            if authority.is_empty() {
                return Err(ParseError::BadRequestLine(
                    "absolute URI has empty authority".to_string(),
                ));
            }
            line.host_with_port = ensure_port(authority, if tls { 443 } else { 80 });
            line.path = path.to_string();
        } else if target.starts_with('/') {
            line.path = target.to_string();
            if let Some(authority) = injected_authority {
                line.host_with_port = authority.to_string();
            }
        } else {
            return Err(ParseError::BadRequestLine(format!(
                "unrecognized request target {target:?}"
            )));
        }

        Ok(line)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The target exactly as the client sent it; feeds the per-request
    /// upstream-proxy selector.
    pub fn raw_uri(&self) -> &[u8] {
        self.raw_uri.as_bytes()
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn is_connect(&self) -> bool {
        self.is_connect
    }

    /// Idempotent methods may be retried by the client engine when no
    /// response byte has been forwarded.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method.as_str(),
            "GET" | "HEAD" | "OPTIONS" | "TRACE" | "PUT" | "DELETE"
        )
    }

    pub fn host_with_port(&self) -> &str {
        &self.host_with_port
    }

    /// True until an authority has been resolved from any of the sources.
    pub fn needs_host(&self) -> bool {
        self.host_with_port.is_empty()
    }

    /// Late authority resolution from the `Host` header (origin-form
    /// requests) or from the MITM CONNECT target.
    pub fn set_host_with_port(&mut self, authority: &str, default_port: u16) {
        self.host_with_port = ensure_port(authority, default_port);
    }

    /// Rebuild in origin-form, the shape written to origins and through
    /// tunnels.
    pub fn rebuild(&self, out: &mut BytesMut) {
        out.extend_from_slice(self.method.as_bytes());
        out.extend_from_slice(b" ");
        if self.path.is_empty() {
            out.extend_from_slice(b"/");
        } else {
            out.extend_from_slice(self.path.as_bytes());
        }
        out.extend_from_slice(b" ");
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    /// Rebuild in absolute form, the shape an upstream HTTP proxy expects
    /// when spoken to without a tunnel.
    pub fn rebuild_absolute(&self, out: &mut BytesMut) {
        out.extend_from_slice(self.method.as_bytes());
        out.extend_from_slice(b" ");
        if self.raw_uri.starts_with("http://") || self.raw_uri.starts_with("https://") {
            out.extend_from_slice(self.raw_uri.as_bytes());
        } else {
            let scheme: &[u8] = if self.tls_scheme { b"https://" } else { b"http://" };
            out.extend_from_slice(scheme);
            out.extend_from_slice(self.host_with_port.as_bytes());
            out.extend_from_slice(self.path.as_bytes());
        }
        out.extend_from_slice(b" ");
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    pub fn reset(&mut self) {
        *self = RequestLine::default();
    }
}

/// Append a default port when the authority does not already carry one.
/// Bracketed IPv6 literals keep their brackets.
fn ensure_port(authority: &str, default_port: u16) -> String {
    let has_port = match authority.rfind(']') {
        Some(close) => authority[close..].contains(':'),
        None => authority.contains(':'),
    };
    if has_port {
        authority.to_string()
    } else {
        format!("{authority}:{default_port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ByteBufferPool;
    use std::time::Duration;

    const TICK: Duration = Duration::from_secs(5);

    async fn parse(input: &str, injected: Option<&str>) -> Result<RequestLine, ParseError> {
        let pool = ByteBufferPool::new(256);
        let mut reader = BufferedReader::new(input.as_bytes(), pool.acquire(), TICK);
        RequestLine::parse(&mut reader, injected, 4096).await
    }

    #[tokio::test]
    async fn absolute_uri_resolves_authority_and_path() {
        let line = parse("GET http://example.test/hello?x=1 HTTP/1.1\r\n", None)
            .await
            .expect("absolute form");
        assert_eq!(line.host_with_port(), "example.test:80");
        assert!(!line.is_connect());
        assert!(line.is_idempotent());

        let mut out = BytesMut::new();
        line.rebuild(&mut out);
        assert_eq!(&out[..], b"GET /hello?x=1 HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn https_scheme_defaults_to_443() {
        let line = parse("GET https://example.test/ HTTP/1.1\r\n", None)
            .await
            .expect("https absolute form");
        assert_eq!(line.host_with_port(), "example.test:443");
    }

    #[tokio::test]
    async fn connect_keeps_authority_form() {
        let line = parse("CONNECT example.test:443 HTTP/1.1\r\n", None)
            .await
            .expect("authority form");
        assert!(line.is_connect());
        assert_eq!(line.host_with_port(), "example.test:443");
    }

    #[tokio::test]
    async fn origin_form_defers_to_injected_authority() {
        let line = parse("POST /submit HTTP/1.1\r\n", Some("example.test:443"))
            .await
            .expect("origin form");
        assert_eq!(line.host_with_port(), "example.test:443");
        assert!(!line.is_idempotent());

        let mut out = BytesMut::new();
        line.rebuild(&mut out);
        assert_eq!(&out[..], b"POST /submit HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn origin_form_without_authority_needs_host() {
        let line = parse("GET / HTTP/1.1\r\n", None).await.expect("origin form");
        assert!(line.needs_host());
    }

    #[tokio::test]
    async fn garbage_target_is_rejected() {
        let err = parse("GET example HTTP/1.1\r\n", None)
            .await
            .expect_err("bare word target");
        assert!(matches!(err, ParseError::BadRequestLine(_)));
    }

    #[tokio::test]
    async fn http2_version_is_rejected() {
        let err = parse("GET / HTTP/2.0\r\n", None)
            .await
            .expect_err("unsupported version");
        assert!(matches!(err, ParseError::BadRequestLine(_)));
    }

    #[tokio::test]
    async fn absolute_rebuild_round_trips_raw_uri() {
        let line = parse("GET http://example.test/a HTTP/1.1\r\n", None)
            .await
            .expect("absolute form");
        let mut out = BytesMut::new();
        line.rebuild_absolute(&mut out);
        assert_eq!(&out[..], b"GET http://example.test/a HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn ipv6_authority_keeps_brackets() {
        let line = parse("CONNECT [::1]:8443 HTTP/1.1\r\n", None)
            .await
            .expect("ipv6 connect");
        assert_eq!(line.host_with_port(), "[::1]:8443");
    }
}
