use bytes::BytesMut;
use tokio::io::AsyncRead;

use crate::buffered::BufferedReader;
use crate::error::ParseError;
use crate::request_line::HttpVersion;

/// Parsed response status line. The raw bytes are retained verbatim and
/// written through unchanged; the parsed fields only drive body framing and
/// tunnel/auth decisions.
#[derive(Debug, Clone, Default)]
pub struct ResponseLine {
    raw: Vec<u8>,
    version: HttpVersion,
    status: u16,
}

impl ResponseLine {
    pub async fn parse<R: AsyncRead + Unpin>(
        reader: &mut BufferedReader<R>,
        max_line_bytes: usize,
    ) -> Result<Self, ParseError> {
        let mut raw = BytesMut::with_capacity(64);
        reader.read_line_into(&mut raw, max_line_bytes).await?;
        let text = std::str::from_utf8(&raw[..raw.len() - 2])
            .map_err(|_| ParseError::BadHeader("status line is not UTF-8".to_string()))?;

        let mut parts = text.split_whitespace();
        let version = match parts.next() {
            Some("HTTP/1.0") => HttpVersion::Http10,
            Some("HTTP/1.1") => HttpVersion::Http11,
            other => {
                return Err(ParseError::BadHeader(format!(
                    "unsupported response version {other:?}"
                )))
            }
        };
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|code| (100..=999).contains(code))
            .ok_or_else(|| ParseError::BadHeader("invalid response status code".to_string()))?;

        Ok(Self {
            raw: raw.to_vec(),
            version,
            status,
        })
    }

    /// The status line exactly as received, CRLF included.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reset(&mut self) {
        *self = ResponseLine::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ByteBufferPool;
    use std::time::Duration;

    async fn parse(input: &[u8]) -> Result<ResponseLine, ParseError> {
        let pool = ByteBufferPool::new(256);
        let mut reader = BufferedReader::new(input, pool.acquire(), Duration::from_secs(5));
        ResponseLine::parse(&mut reader, 4096).await
    }

    #[tokio::test]
    async fn keeps_raw_bytes_verbatim() {
        let line = parse(b"HTTP/1.1 200 OK\r\n").await.expect("status line");
        assert_eq!(line.raw(), b"HTTP/1.1 200 OK\r\n");
        assert_eq!(line.status(), 200);
        assert_eq!(line.version(), HttpVersion::Http11);
    }

    #[tokio::test]
    async fn tolerates_missing_reason_phrase() {
        let line = parse(b"HTTP/1.1 204\r\n").await.expect("status line");
        assert_eq!(line.status(), 204);
    }

    #[tokio::test]
    async fn rejects_non_numeric_status() {
        let err = parse(b"HTTP/1.1 OK\r\n").await.expect_err("bad status");
        assert!(matches!(err, ParseError::BadHeader(_)));
    }
}
