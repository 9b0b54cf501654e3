use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ParseError;
use crate::pool::PooledBuf;

async fn with_deadline<T, F>(limit: Duration, what: &'static str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, what)),
    }
}

/// Buffered reader over a leased pool buffer.
///
/// Unlike `tokio::io::BufReader` the internal buffer is recoverable (it goes
/// back to the pool when the connection ends) and every refill carries a
/// deadline: the idle timeout while waiting at a message boundary, the stall
/// timeout while a body copy is in flight. Callers switch between the two
/// with [`set_timeout`](Self::set_timeout).
pub struct BufferedReader<R> {
    stream: R,
    buf: PooledBuf,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> BufferedReader<R> {
    pub fn new(stream: R, mut buf: PooledBuf, timeout: Duration) -> Self {
        buf.clear();
        Self {
            stream,
            buf,
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Bytes read from the stream but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Discard `n` buffered bytes. `n` must not exceed `buffered().len()`.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Read once from the stream, appending to the buffer. Returns the byte
    /// count; `Ok(0)` is EOF. Honors the reader's current deadline.
    pub async fn fill(&mut self) -> io::Result<usize> {
        with_deadline(
            self.timeout,
            "timed out waiting for peer bytes",
            self.stream.read_buf(&mut *self.buf),
        )
        .await
    }

    /// Read one CRLF-terminated line and append it, terminator included, to
    /// `out`. `budget` caps the line length; crossing it yields
    /// `HeaderTooLarge`. Returns the number of bytes appended.
    pub async fn read_line_into(
        &mut self,
        out: &mut BytesMut,
        budget: usize,
    ) -> Result<usize, ParseError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos == 0 || self.buf[pos - 1] != b'\r' {
                    return Err(ParseError::BadHeader(
                        "line terminated by bare LF".to_string(),
                    ));
                }
                if pos + 1 > budget {
                    return Err(ParseError::HeaderTooLarge(budget));
                }
                out.extend_from_slice(&self.buf[..=pos]);
                self.consume(pos + 1);
                return Ok(pos + 1);
            }
            if self.buf.len() > budget {
                return Err(ParseError::HeaderTooLarge(budget));
            }
            if self.fill().await? == 0 {
                return Err(ParseError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    if self.buf.is_empty() {
                        "connection closed at message boundary"
                    } else {
                        "connection closed inside a line"
                    },
                )));
            }
        }
    }

    /// Tear down into the raw stream and whatever bytes were read past the
    /// last consumed position. Used when a CONNECT flips the socket from
    /// parsed HTTP into an opaque tunnel or a TLS accept.
    pub fn into_parts(self) -> (R, PooledBuf) {
        (self.stream, self.buf)
    }
}

/// Buffered writer over a leased pool buffer with an explicit flush.
///
/// Tracks every byte accepted so the engine can tell whether any response
/// data has already travelled toward the client (the retry and 502 gates).
pub struct BufferedWriter<W> {
    stream: W,
    buf: PooledBuf,
    limit: usize,
    written: u64,
    timeout: Duration,
}

impl<W: AsyncWrite + Unpin> BufferedWriter<W> {
    pub fn new(stream: W, mut buf: PooledBuf, timeout: Duration) -> Self {
        buf.clear();
        let limit = buf.capacity().max(1);
        Self {
            stream,
            buf,
            limit,
            written: 0,
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Total bytes accepted (buffered or already on the wire).
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.buf.len() + data.len() > self.limit {
            self.flush_buffer().await?;
        }
        if data.len() >= self.limit {
            with_deadline(
                self.timeout,
                "timed out writing to peer",
                self.stream.write_all(data),
            )
            .await?;
        } else {
            self.buf.extend_from_slice(data);
        }
        self.written += data.len() as u64;
        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer().await?;
        with_deadline(
            self.timeout,
            "timed out flushing to peer",
            self.stream.flush(),
        )
        .await
    }

    async fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        with_deadline(
            self.timeout,
            "timed out writing to peer",
            self.stream.write_all(&self.buf),
        )
        .await?;
        self.buf.clear();
        Ok(())
    }

    pub fn into_parts(self) -> (W, PooledBuf) {
        (self.stream, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ByteBufferPool;

    const TICK: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn read_line_into_returns_lines_with_terminators() {
        let pool = ByteBufferPool::new(64);
        let input: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut reader = BufferedReader::new(input, pool.acquire(), TICK);

        let mut out = BytesMut::new();
        reader.read_line_into(&mut out, 1024).await.expect("line 1");
        assert_eq!(&out[..], b"GET / HTTP/1.1\r\n");

        out.clear();
        reader.read_line_into(&mut out, 1024).await.expect("line 2");
        assert_eq!(&out[..], b"Host: a\r\n");

        out.clear();
        reader.read_line_into(&mut out, 1024).await.expect("blank");
        assert_eq!(&out[..], b"\r\n");
    }

    #[tokio::test]
    async fn read_line_into_rejects_bare_lf() {
        let pool = ByteBufferPool::new(64);
        let input: &[u8] = b"GET / HTTP/1.1\n";
        let mut reader = BufferedReader::new(input, pool.acquire(), TICK);
        let mut out = BytesMut::new();
        let err = reader
            .read_line_into(&mut out, 1024)
            .await
            .expect_err("bare LF must fail");
        assert!(matches!(err, ParseError::BadHeader(_)));
    }

    #[tokio::test]
    async fn read_line_into_caps_oversized_lines() {
        let pool = ByteBufferPool::new(64);
        let long = vec![b'a'; 128];
        let mut reader = BufferedReader::new(&long[..], pool.acquire(), TICK);
        let mut out = BytesMut::new();
        let err = reader
            .read_line_into(&mut out, 64)
            .await
            .expect_err("oversized line must fail");
        assert!(matches!(err, ParseError::HeaderTooLarge(64)));
    }

    #[tokio::test]
    async fn writer_buffers_small_writes_until_flush() {
        let pool = ByteBufferPool::new(1024);
        let mut sink = Vec::new();
        {
            let mut writer = BufferedWriter::new(&mut sink, pool.acquire(), TICK);
            writer.write_all(b"hello ").await.expect("write");
            writer.write_all(b"world").await.expect("write");
            assert_eq!(writer.bytes_written(), 11);
            writer.flush().await.expect("flush");
        }
        assert_eq!(sink, b"hello world");
    }
}
