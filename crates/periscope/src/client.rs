use std::sync::Arc;
use std::time::Duration;

use periscope_http::{BufferedReader, BufferedWriter, BufioPool};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

use crate::errors::{ProxyError, TlsError, TransportError};
use crate::request::Request;
use crate::response::Response;
use crate::stream::{TunnelStream, UpstreamStream};
use crate::superproxy::dial;

/// The HTTP client engine: resolves the upstream route (direct dial or
/// super-proxy tunnel), optionally wraps it in TLS, pumps the request up
/// and the response down, and applies the idempotency-gated single retry.
pub struct HttpClient {
    bufio_pool: BufioPool,
    tls_config: Arc<ClientConfig>,
    connect_timeout: Duration,
    idle_timeout: Duration,
    stall_timeout: Duration,
    max_header_bytes: usize,
}

impl HttpClient {
    pub fn new(
        bufio_pool: BufioPool,
        tls_config: Arc<ClientConfig>,
        connect_timeout: Duration,
        idle_timeout: Duration,
        stall_timeout: Duration,
        max_header_bytes: usize,
    ) -> Self {
        Self {
            bufio_pool,
            tls_config,
            connect_timeout,
            idle_timeout,
            stall_timeout,
            max_header_bytes,
        }
    }

    /// Run one exchange. A failed attempt is redialed at most once, and
    /// only while the request is replayable: idempotent method, no response
    /// byte forwarded downstream, no body byte consumed from the client.
    pub async fn execute<R, W>(
        &self,
        req: &mut Request<R>,
        resp: &mut Response<W>,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        resp.set_head_request(req.method().eq_ignore_ascii_case("HEAD"));
        let mut retried = false;
        loop {
            let error = match self.attempt(req, resp).await {
                Ok(()) => return resp.flush().await,
                Err(error) => error,
            };
            let may_retry = !retried
                && error.is_retryable()
                && req.is_idempotent()
                && !req.body_consumed()
                && resp.bytes_forwarded() == 0;
            if !may_retry {
                return Err(error);
            }
            retried = true;
            tracing::debug!(
                target_host = %req.host_with_port(),
                %error,
                "redialing idempotent exchange"
            );
        }
    }

    async fn attempt<R, W>(
        &self,
        req: &mut Request<R>,
        resp: &mut Response<W>,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let target = req.host_with_port().to_string();
        let tunnel = match req.super_proxy() {
            Some(proxy) => proxy.make_tunnel(&target, self.connect_timeout).await?,
            None => TunnelStream::Plain {
                stream: dial(&target, self.connect_timeout).await?,
            },
        };

        let upstream = if req.is_tls() {
            let name = req
                .tls_server_name()
                .ok_or(ProxyError::Tls(TlsError::NoSni))?;
            let server_name = ServerName::try_from(name.to_string()).map_err(|_| {
                ProxyError::Init(format!("invalid upstream TLS server name {name:?}"))
            })?;
            let connector = TlsConnector::from(Arc::clone(&self.tls_config));
            let handshake = connector.connect(server_name, tunnel);
            match tokio::time::timeout(self.connect_timeout, handshake).await {
                Ok(Ok(tls)) => UpstreamStream::Tls { stream: tls },
                Ok(Err(error)) => {
                    return Err(TransportError::DialFailed {
                        target,
                        source: error,
                    }
                    .into())
                }
                Err(_) => {
                    return Err(TransportError::DialFailed {
                        target,
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "upstream TLS handshake timed out",
                        ),
                    }
                    .into())
                }
            }
        } else {
            UpstreamStream::Plain { stream: tunnel }
        };

        // Fresh connection per exchange; it drops (and closes) when this
        // attempt returns, satisfied or not.
        let (read_half, write_half) = tokio::io::split(upstream);
        let mut upstream_writer = BufferedWriter::new(
            write_half,
            self.bufio_pool.acquire_write(),
            self.stall_timeout,
        );
        let mut upstream_reader = BufferedReader::new(
            read_half,
            self.bufio_pool.acquire_read(),
            self.idle_timeout,
        );

        req.write_to(&mut upstream_writer, self.stall_timeout).await?;
        upstream_writer
            .flush()
            .await
            .map_err(TransportError::WriteFailed)?;

        resp.read_from(&mut upstream_reader, self.max_header_bytes, self.stall_timeout)
            .await
    }
}
