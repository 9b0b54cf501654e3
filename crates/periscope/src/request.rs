use std::sync::Arc;
use std::time::Duration;

use periscope_http::{
    copy_body, BodyKind, BufferedReader, BufferedWriter, ByteBufferPool, Header, ParseError,
    PooledBuf, RequestLine, Sniffer,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::{body_error, ProxyError, TransportError};
use crate::superproxy::SuperProxy;

/// A client request travelling through the proxy.
///
/// Binds a reader exactly once, parses the start line and header block at
/// init, and streams the body on demand. The rebuilt start line and the raw
/// header block are captured into one pooled scratch buffer, which is what
/// makes the engine's single idempotent retry replayable: a second
/// `write_to` re-emits the capture instead of re-reading the client.
pub struct Request<R> {
    reader: Option<BufferedReader<R>>,
    req_line: RequestLine,
    header: Header,
    sniffer: Arc<dyn Sniffer>,
    scratch_pool: ByteBufferPool,
    super_proxy: Option<Arc<SuperProxy>>,
    is_tls: bool,
    tls_server_name: Option<String>,
    head: Option<PooledBuf>,
    line_len: usize,
    head_sniffed: bool,
    body_consumed: bool,
}

impl<R: AsyncRead + Unpin> Request<R> {
    pub fn new(sniffer: Arc<dyn Sniffer>, scratch_pool: ByteBufferPool) -> Self {
        Self {
            reader: None,
            req_line: RequestLine::default(),
            header: Header::default(),
            sniffer,
            scratch_pool,
            super_proxy: None,
            is_tls: false,
            tls_server_name: None,
            head: None,
            line_len: 0,
            head_sniffed: false,
            body_consumed: false,
        }
    }

    /// Bind a plaintext proxy connection and parse its head.
    pub async fn init(
        &mut self,
        reader: BufferedReader<R>,
        max_header_bytes: usize,
    ) -> Result<(), ProxyError> {
        self.init_inner(reader, None, None, max_header_bytes).await
    }

    /// Bind the decrypted side of an intercepted CONNECT. The authority
    /// comes from the CONNECT line (the decrypted request line is
    /// origin-form and has none); the server name came from SNI and drives
    /// the upstream handshake.
    pub async fn init_tls(
        &mut self,
        reader: BufferedReader<R>,
        authority: &str,
        tls_server_name: &str,
        max_header_bytes: usize,
    ) -> Result<(), ProxyError> {
        if tls_server_name.is_empty() {
            return Err(ProxyError::Init(
                "empty TLS server name for intercepted request".to_string(),
            ));
        }
        self.init_inner(reader, Some(authority), Some(tls_server_name), max_header_bytes)
            .await
    }

    async fn init_inner(
        &mut self,
        mut reader: BufferedReader<R>,
        authority: Option<&str>,
        tls_server_name: Option<&str>,
        max_header_bytes: usize,
    ) -> Result<(), ProxyError> {
        if self.reader.is_some() {
            return Err(ProxyError::Init(
                "request is already bound to a reader".to_string(),
            ));
        }

        let mut req_line = RequestLine::parse(&mut reader, authority, max_header_bytes).await?;
        let mut head = self.scratch_pool.acquire();
        head.clear();

        if req_line.is_connect() {
            // The remaining CONNECT header block is consumed but never
            // forwarded; bytes after it belong to the tunnel.
            self.header
                .parse_fields(&mut reader, &mut head, max_header_bytes, req_line.version())
                .await?;
            head.clear();
            self.line_len = 0;
        } else {
            req_line.rebuild(&mut head);
            self.line_len = head.len();
            self.header
                .parse_fields(&mut reader, &mut head, max_header_bytes, req_line.version())
                .await?;
            if req_line.needs_host() {
                let default_port = if tls_server_name.is_some() { 443 } else { 80 };
                match self.header.host() {
                    Some(host) => {
                        let host = host.to_string();
                        req_line.set_host_with_port(&host, default_port);
                    }
                    None => return Err(ParseError::NoHostProvided.into()),
                }
            }
        }

        self.req_line = req_line;
        self.head = Some(head);
        self.reader = Some(reader);
        self.is_tls = tls_server_name.is_some();
        self.tls_server_name = tls_server_name.map(str::to_string);
        Ok(())
    }

    /// Emit the captured head and stream the body to `writer`. Safe to call
    /// a second time only while `body_consumed()` is false.
    pub async fn write_to<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut BufferedWriter<W>,
        stall_timeout: Duration,
    ) -> Result<(), ProxyError> {
        let Request {
            reader,
            header,
            sniffer,
            scratch_pool,
            head,
            line_len,
            head_sniffed,
            body_consumed,
            ..
        } = self;
        let reader = reader
            .as_mut()
            .ok_or_else(|| ProxyError::Init("request is not bound".to_string()))?;
        let head = head
            .as_ref()
            .ok_or_else(|| ProxyError::Init("request head was not captured".to_string()))?;

        writer
            .write_all(&head[..*line_len])
            .await
            .map_err(TransportError::WriteFailed)?;
        writer
            .write_all(&head[*line_len..])
            .await
            .map_err(TransportError::WriteFailed)?;
        if !*head_sniffed {
            sniffer.req_line(&head[..*line_len]);
            sniffer.header(&head[*line_len..]);
            *head_sniffed = true;
        }

        let kind = header.request_body();
        if kind != BodyKind::None {
            *body_consumed = true;
            reader.set_timeout(stall_timeout);
            let mut chunk_scratch = scratch_pool.acquire();
            copy_body(reader, writer, kind, &mut *chunk_scratch, &**sniffer)
                .await
                .map_err(body_error)?;
        }
        Ok(())
    }

    pub fn method(&self) -> &str {
        self.req_line.method()
    }

    pub fn raw_uri(&self) -> &[u8] {
        self.req_line.raw_uri()
    }

    pub fn host_with_port(&self) -> &str {
        self.req_line.host_with_port()
    }

    pub fn is_connect(&self) -> bool {
        self.req_line.is_connect()
    }

    pub fn is_idempotent(&self) -> bool {
        self.req_line.is_idempotent()
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }

    pub fn set_super_proxy(&mut self, proxy: Option<Arc<SuperProxy>>) {
        self.super_proxy = proxy;
    }

    pub fn super_proxy(&self) -> Option<&Arc<SuperProxy>> {
        self.super_proxy.as_ref()
    }

    /// Whether any body byte has been pulled off the client reader; once
    /// true the exchange can no longer be replayed.
    pub fn body_consumed(&self) -> bool {
        self.body_consumed
    }

    pub fn is_connection_close(&self) -> bool {
        self.header.is_connection_close()
    }

    /// Reclaim the bound reader, e.g. to hand a CONNECT socket to the
    /// tunnel or TLS-accept path.
    pub fn take_reader(&mut self) -> Option<BufferedReader<R>> {
        self.reader.take()
    }

    /// Return to the unbound state, releasing the head capture and reader.
    pub fn reset(&mut self) {
        self.reader = None;
        self.req_line.reset();
        self.header.reset();
        self.super_proxy = None;
        self.is_tls = false;
        self.tls_server_name = None;
        self.head = None;
        self.line_len = 0;
        self.head_sniffed = false;
        self.body_consumed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_http::{BufioPool, NopSniffer};

    const TICK: Duration = Duration::from_secs(5);

    fn pools() -> (BufioPool, ByteBufferPool) {
        (BufioPool::new(4096, 4096), ByteBufferPool::default())
    }

    fn reader_over(
        input: &[u8],
        bufio: &BufioPool,
    ) -> BufferedReader<std::io::Cursor<Vec<u8>>> {
        BufferedReader::new(std::io::Cursor::new(input.to_vec()), bufio.acquire_read(), TICK)
    }

    #[tokio::test]
    async fn init_parses_and_write_to_round_trips_origin_form() {
        let (bufio, scratch) = pools();
        let raw = b"POST /submit HTTP/1.1\r\nHost: example.test\r\nContent-Length: 5\r\n\r\nhello";
        let mut req = Request::new(Arc::new(NopSniffer), scratch.clone());
        req.init(reader_over(raw, &bufio), 64 * 1024)
            .await
            .expect("init");
        assert_eq!(req.host_with_port(), "example.test:80");
        assert!(!req.body_consumed());

        let mut sink = Vec::new();
        {
            let mut writer = BufferedWriter::new(&mut sink, bufio.acquire_write(), TICK);
            req.write_to(&mut writer, TICK).await.expect("write_to");
            writer.flush().await.expect("flush");
        }
        assert_eq!(
            sink,
            b"POST /submit HTTP/1.1\r\nHost: example.test\r\nContent-Length: 5\r\n\r\nhello"
        );
        assert!(req.body_consumed());
    }

    #[tokio::test]
    async fn rebind_is_rejected_until_reset() {
        let (bufio, scratch) = pools();
        let raw = b"GET http://example.test/ HTTP/1.1\r\n\r\n";
        let mut req = Request::new(Arc::new(NopSniffer), scratch);
        req.init(reader_over(raw, &bufio), 64 * 1024)
            .await
            .expect("first bind");
        let err = req
            .init(reader_over(raw, &bufio), 64 * 1024)
            .await
            .expect_err("second bind must fail");
        assert!(matches!(err, ProxyError::Init(_)));

        req.reset();
        req.init(reader_over(raw, &bufio), 64 * 1024)
            .await
            .expect("bind after reset");
    }

    #[tokio::test]
    async fn missing_host_everywhere_is_no_host_provided() {
        let (bufio, scratch) = pools();
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        let mut req = Request::new(Arc::new(NopSniffer), scratch);
        let err = req
            .init(reader_over(raw, &bufio), 64 * 1024)
            .await
            .expect_err("no host anywhere");
        assert!(matches!(
            err,
            ProxyError::Parse(ParseError::NoHostProvided)
        ));
    }

    #[tokio::test]
    async fn connect_head_is_drained_not_forwarded() {
        let (bufio, scratch) = pools();
        let raw = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\nEXTRA";
        let mut req = Request::new(Arc::new(NopSniffer), scratch);
        req.init(reader_over(raw, &bufio), 64 * 1024)
            .await
            .expect("connect init");
        assert!(req.is_connect());
        assert_eq!(req.host_with_port(), "example.test:443");

        let reader = req.take_reader().expect("reader back");
        let (_, buf) = reader.into_parts();
        assert_eq!(&buf[..], b"EXTRA", "only post-head bytes remain");
    }

    #[tokio::test]
    async fn tls_init_injects_authority_and_server_name() {
        let (bufio, scratch) = pools();
        let raw = b"GET /secret HTTP/1.1\r\n\r\n";
        let mut req = Request::new(Arc::new(NopSniffer), scratch);
        req.init_tls(
            reader_over(raw, &bufio),
            "example.test:443",
            "example.test",
            64 * 1024,
        )
        .await
        .expect("tls init");
        assert!(req.is_tls());
        assert_eq!(req.host_with_port(), "example.test:443");
        assert_eq!(req.tls_server_name(), Some("example.test"));
    }
}
