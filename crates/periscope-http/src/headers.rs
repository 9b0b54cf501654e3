use bytes::BytesMut;
use tokio::io::AsyncRead;

use crate::buffered::BufferedReader;
use crate::error::ParseError;
use crate::request_line::HttpVersion;

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Fixed(u64),
    Chunked,
    UntilEof,
}

/// Streaming header-block parser.
///
/// `parse_fields` appends every header line (and the terminating blank line)
/// to the caller's scratch buffer byte-for-byte — order, casing and folded
/// continuation lines preserved — while deriving the signals the proxy needs:
/// content length, chunked transfer coding, connection-close, and the
/// `Proxy-Authorization` and `Host` values.
#[derive(Debug, Default)]
pub struct Header {
    content_length: Option<u64>,
    chunked: bool,
    connection_close: bool,
    keep_alive: bool,
    host: Option<String>,
    proxy_authorization: Option<String>,
    parsed: bool,
}

impl Header {
    /// Read header lines up to and including the blank terminator, appending
    /// the raw bytes to `out`. `budget` caps the whole block.
    pub async fn parse_fields<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut BufferedReader<R>,
        out: &mut BytesMut,
        budget: usize,
        version: HttpVersion,
    ) -> Result<(), ParseError> {
        let mut remaining = budget;
        loop {
            let start = out.len();
            let appended = reader.read_line_into(out, remaining).await?;
            remaining = remaining.saturating_sub(appended);

            let line = &out[start..out.len() - 2];
            if line.is_empty() {
                break;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                // Folded continuation of the previous field; forwarded
                // verbatim, not inspected.
                continue;
            }
            self.inspect(line)?;
        }

        if !self.connection_close && version == HttpVersion::Http10 && !self.keep_alive {
            self.connection_close = true;
        }
        self.parsed = true;
        Ok(())
    }

    fn inspect(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| ParseError::BadHeader("header line has no colon".to_string()))?;
        let name = &line[..colon];
        let value = std::str::from_utf8(&line[colon + 1..])
            .map_err(|_| ParseError::BadHeader("header value is not UTF-8".to_string()))?
            .trim();

        if name.eq_ignore_ascii_case(b"content-length") {
            if self.content_length.is_some() {
                return Err(ParseError::BadHeader(
                    "duplicate Content-Length".to_string(),
                ));
            }
            let length = value.parse::<u64>().map_err(|_| {
                ParseError::BadHeader(format!("invalid Content-Length {value:?}"))
            })?;
            self.content_length = Some(length);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if has_token(value, "chunked") {
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"connection") {
            if has_token(value, "close") {
                self.connection_close = true;
            }
            if has_token(value, "keep-alive") {
                self.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case(b"host") {
            if self.host.is_none() {
                self.host = Some(value.to_string());
            }
        } else if name.eq_ignore_ascii_case(b"proxy-authorization") {
            self.proxy_authorization = Some(value.to_string());
        }
        Ok(())
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_connection_close(&self) -> bool {
        self.connection_close
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn proxy_authorization(&self) -> Option<&str> {
        self.proxy_authorization.as_deref()
    }

    /// Body framing for a request. Chunked wins over a stray length;
    /// a request with neither has no body.
    pub fn request_body(&self) -> BodyKind {
        if self.chunked {
            return BodyKind::Chunked;
        }
        match self.content_length {
            Some(0) | None => BodyKind::None,
            Some(length) => BodyKind::Fixed(length),
        }
    }

    /// Body framing for a response to `method` with `status`. HEAD, 1xx,
    /// 204 and 304 responses are bodyless regardless of headers; a response
    /// with neither length nor chunked is delimited by connection close.
    pub fn response_body(&self, head_request: bool, status: u16) -> BodyKind {
        if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
            return BodyKind::None;
        }
        if self.chunked {
            return BodyKind::Chunked;
        }
        match self.content_length {
            Some(0) => BodyKind::None,
            Some(length) => BodyKind::Fixed(length),
            None => BodyKind::UntilEof,
        }
    }

    pub fn reset(&mut self) {
        *self = Header::default();
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}
