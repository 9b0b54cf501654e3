use std::sync::Arc;
use std::time::Duration;

use periscope_http::{
    copy_body, BufferedReader, BufferedWriter, ByteBufferPool, Header, ResponseLine, Sniffer,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::{body_error, ProxyError, TransportError};

/// The origin's answer travelling back to the client.
///
/// Bound once to the client-facing writer; `read_from` pulls the status
/// line, headers and body off the upstream reader and forwards each region
/// verbatim, counting every byte accepted toward the client. That count is
/// the gate for both the engine's retry rule and the 502-vs-drop decision.
pub struct Response<W> {
    writer: Option<BufferedWriter<W>>,
    resp_line: ResponseLine,
    header: Header,
    sniffer: Arc<dyn Sniffer>,
    scratch_pool: ByteBufferPool,
    head_request: bool,
}

impl<W: AsyncWrite + Unpin> Response<W> {
    pub fn new(sniffer: Arc<dyn Sniffer>, scratch_pool: ByteBufferPool) -> Self {
        Self {
            writer: None,
            resp_line: ResponseLine::default(),
            header: Header::default(),
            sniffer,
            scratch_pool,
            head_request: false,
        }
    }

    pub fn init(&mut self, writer: BufferedWriter<W>) -> Result<(), ProxyError> {
        if self.writer.is_some() {
            return Err(ProxyError::Init(
                "response is already bound to a writer".to_string(),
            ));
        }
        self.writer = Some(writer);
        Ok(())
    }

    /// HEAD responses carry no body even when framing headers say otherwise.
    pub fn set_head_request(&mut self, head_request: bool) {
        self.head_request = head_request;
    }

    /// Parse the upstream response and forward it. The reader arrives with
    /// the idle deadline set and is switched to the stall deadline once the
    /// body starts moving.
    pub async fn read_from<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut BufferedReader<R>,
        max_header_bytes: usize,
        stall_timeout: Duration,
    ) -> Result<(), ProxyError> {
        let Response {
            writer,
            header,
            sniffer,
            scratch_pool,
            head_request,
            ..
        } = self;
        let writer = writer
            .as_mut()
            .ok_or_else(|| ProxyError::Init("response is not bound".to_string()))?;

        let resp_line = ResponseLine::parse(reader, max_header_bytes)
            .await
            .map_err(body_error)?;
        writer
            .write_all(resp_line.raw())
            .await
            .map_err(TransportError::WriteFailed)?;
        sniffer.resp_line(resp_line.raw());

        let mut head = scratch_pool.acquire();
        head.clear();
        header
            .parse_fields(reader, &mut head, max_header_bytes, resp_line.version())
            .await
            .map_err(body_error)?;
        writer
            .write_all(&head)
            .await
            .map_err(TransportError::WriteFailed)?;
        sniffer.header(&head);

        let kind = header.response_body(*head_request, resp_line.status());
        reader.set_timeout(stall_timeout);
        let mut chunk_scratch = scratch_pool.acquire();
        copy_body(reader, writer, kind, &mut *chunk_scratch, &**sniffer)
            .await
            .map_err(body_error)?;

        self.resp_line = resp_line;
        Ok(())
    }

    /// Bytes accepted toward the client so far (buffered or on the wire).
    pub fn bytes_forwarded(&self) -> u64 {
        self.writer
            .as_ref()
            .map(BufferedWriter::bytes_written)
            .unwrap_or(0)
    }

    pub fn status(&self) -> u16 {
        self.resp_line.status()
    }

    pub fn is_connection_close(&self) -> bool {
        self.header.is_connection_close()
    }

    pub async fn flush(&mut self) -> Result<(), ProxyError> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .await
                .map_err(|error| TransportError::WriteFailed(error).into())
        } else {
            Ok(())
        }
    }

    /// Reclaim the bound writer, e.g. to synthesize an error response after
    /// a failed exchange.
    pub fn take_writer(&mut self) -> Option<BufferedWriter<W>> {
        self.writer.take()
    }

    pub fn reset(&mut self) {
        self.writer = None;
        self.resp_line.reset();
        self.header.reset();
        self.head_request = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_http::{BufioPool, NopSniffer};

    const TICK: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn read_from_forwards_response_verbatim() {
        let bufio = BufioPool::new(4096, 4096);
        let scratch = ByteBufferPool::default();
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = BufferedReader::new(raw, bufio.acquire_read(), TICK);

        let mut sink = Vec::new();
        let mut resp = Response::new(Arc::new(NopSniffer), scratch);
        let status;
        let bytes_forwarded;
        {
            let writer = BufferedWriter::new(&mut sink, bufio.acquire_write(), TICK);
            resp.init(writer).expect("bind writer");
            resp.read_from(&mut reader, 64 * 1024, TICK)
                .await
                .expect("read_from");
            resp.flush().await.expect("flush");
            status = resp.status();
            bytes_forwarded = resp.bytes_forwarded();
        }
        drop(resp);
        assert_eq!(sink, raw);
        assert_eq!(status, 200);
        assert_eq!(bytes_forwarded, raw.len() as u64);
    }

    #[tokio::test]
    async fn head_responses_skip_the_body() {
        let bufio = BufioPool::new(4096, 4096);
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        let mut reader = BufferedReader::new(raw, bufio.acquire_read(), TICK);

        let mut sink = Vec::new();
        let mut resp = Response::new(Arc::new(NopSniffer), ByteBufferPool::default());
        {
            let writer = BufferedWriter::new(&mut sink, bufio.acquire_write(), TICK);
            resp.init(writer).expect("bind writer");
            resp.set_head_request(true);
            resp.read_from(&mut reader, 64 * 1024, TICK)
                .await
                .expect("read_from");
            resp.flush().await.expect("flush");
        }
        assert_eq!(sink, raw);
    }

    #[tokio::test]
    async fn rebinding_writer_is_rejected() {
        let bufio = BufioPool::new(4096, 4096);
        let mut sink_a = Vec::new();
        let mut sink_b = Vec::new();
        let mut resp: Response<&mut Vec<u8>> =
            Response::new(Arc::new(NopSniffer), ByteBufferPool::default());
        resp.init(BufferedWriter::new(&mut sink_a, bufio.acquire_write(), TICK))
            .expect("first bind");
        let err = resp
            .init(BufferedWriter::new(&mut sink_b, bufio.acquire_write(), TICK))
            .expect_err("second bind");
        assert!(matches!(err, ProxyError::Init(_)));
    }
}
