use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use periscope_http::{
    BufferedReader, BufferedWriter, BufioPool, ByteBufferPool, ParseError, Sniffer,
};
use periscope_tls::CertStore;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::client::HttpClient;
use crate::config::ProxyConfig;
use crate::errors::{ProxyError, TransportError};
use crate::mitm;
use crate::observe::SnifferPool;
use crate::request::Request;
use crate::response::Response;
use crate::superproxy::{dial, SuperProxy};

/// Body of the 400 answered to requests that name no proxy target.
const NON_PROXY_RESPONSE: &str =
    "This is a proxy server. Does not respond to non-proxy requests.\n";

/// Body of the 503 answered when the worker pool is exhausted.
const OVERFLOW_RESPONSE: &str =
    "The connection cannot be served because the worker pool limit is exceeded";

pub(crate) type DecryptPolicy = Box<dyn Fn(&str) -> bool + Send + Sync>;
pub(crate) type ProxySelector = Box<dyn Fn(&[u8]) -> Option<Arc<SuperProxy>> + Send + Sync>;

/// Everything a connection task needs, shared process-wide.
pub(crate) struct Shared {
    pub(crate) config: ProxyConfig,
    pub(crate) decrypt_policy: DecryptPolicy,
    pub(crate) proxy_selector: ProxySelector,
    pub(crate) sniffer_pool: Arc<dyn SnifferPool>,
    pub(crate) cert_store: Arc<CertStore>,
    pub(crate) client: HttpClient,
    pub(crate) bufio_pool: BufioPool,
    pub(crate) scratch_pool: ByteBufferPool,
    pub(crate) workers: Arc<Semaphore>,
}

/// The accept loop plus the bounded worker pool.
pub struct ProxyServer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer").finish()
    }
}

impl ProxyServer {
    pub(crate) fn new(shared: Shared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    /// PEM of the CA whose leaves are presented to intercepted clients.
    pub fn ca_cert_pem(&self) -> String {
        self.shared.cert_store.ca_cert_pem().to_string()
    }

    /// Serve until the listener fails permanently.
    pub async fn run(self, listener: TcpListener) -> Result<(), ProxyError> {
        let (_shutdown, receiver) = watch::channel(false);
        self.accept_loop(listener, receiver).await
    }

    /// Serve on a background task; the returned handle stops the accept
    /// loop on demand while in-flight connections drain on their own.
    pub fn start(self, listener: TcpListener) -> ProxyHandle {
        let (shutdown, receiver) = watch::channel(false);
        let join = tokio::spawn(self.accept_loop(listener, receiver));
        ProxyHandle { shutdown, join }
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        let mut last_overflow_log: Option<Instant> = None;
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    match Arc::clone(&self.shared.workers).try_acquire_owned() {
                        Ok(permit) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(error) = serve_conn(shared, stream, peer).await {
                                    tracing::debug!(client = %peer, %error, "connection closed with error");
                                }
                            });
                        }
                        Err(_) => {
                            self.reject_overflow(stream, &mut last_overflow_log).await;
                        }
                    }
                }
                Err(error) if is_temporary_accept_error(&error) => {
                    tracing::error!(%error, "temporary accept failure, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(error) => {
                    tracing::error!(%error, "permanent accept failure, stopping");
                    return Err(ProxyError::Listener(error));
                }
            }
        }
    }

    async fn reject_overflow(&self, mut stream: TcpStream, last_log: &mut Option<Instant>) {
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            write_fast_error(&mut stream, 503, OVERFLOW_RESPONSE),
        )
        .await;
        drop(stream);

        if last_log.map_or(true, |at| at.elapsed() > Duration::from_secs(60)) {
            tracing::error!(
                max_workers = self.shared.config.max_workers,
                "incoming connection rejected: all workers busy; consider raising max_workers"
            );
            *last_log = Some(Instant::now());
        }
        // Damp accept storms while saturated.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub struct ProxyHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<Result<(), ProxyError>>,
}

impl ProxyHandle {
    pub async fn shutdown(self, timeout: Duration) -> Result<(), ProxyError> {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ProxyError::Init(format!(
                "server task failed: {join_error}"
            ))),
            Err(_) => Err(ProxyError::Init(
                "timed out waiting for the accept loop to stop".to_string(),
            )),
        }
    }
}

enum ConnOutcome {
    Done,
    Connect { host: String, residual: BytesMut },
}

async fn serve_conn(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    let sniffer = shared.sniffer_pool.get(peer);
    let outcome = {
        let (read_half, write_half) = stream.split();
        drive_exchange(&shared, Arc::clone(&sniffer), read_half, write_half).await?
    };
    match outcome {
        ConnOutcome::Done => Ok(()),
        ConnOutcome::Connect { host, residual } => {
            if (shared.decrypt_policy)(&host) {
                mitm::decrypt_connect(&shared, sniffer, stream, residual, host).await
            } else {
                tunnel_connect(&shared, stream, residual, host).await
            }
        }
    }
}

/// S0/S1 of the per-connection machine: parse the request head, answer
/// non-proxy requests, run forward-HTTP exchanges, or surface a CONNECT to
/// the caller together with any bytes read past its head.
async fn drive_exchange(
    shared: &Arc<Shared>,
    sniffer: Arc<dyn Sniffer>,
    read_half: ReadHalf<'_>,
    mut write_half: WriteHalf<'_>,
) -> Result<ConnOutcome, ProxyError> {
    let reader = BufferedReader::new(
        read_half,
        shared.bufio_pool.acquire_read(),
        shared.config.idle_timeout,
    );
    let mut req = Request::new(Arc::clone(&sniffer), shared.scratch_pool.clone());
    match req.init(reader, shared.config.max_header_bytes).await {
        Ok(()) => {}
        Err(ProxyError::Parse(ParseError::NoHostProvided)) => {
            write_fast_error(&mut write_half, 400, NON_PROXY_RESPONSE)
                .await
                .map_err(TransportError::WriteFailed)?;
            return Ok(ConnOutcome::Done);
        }
        Err(error) => return Err(error),
    }

    if req.is_connect() {
        let host = req.host_with_port().to_string();
        let reader = req.take_reader().expect("connect request keeps its reader");
        let (_, buffered) = reader.into_parts();
        let residual = BytesMut::from(&buffered[..]);
        return Ok(ConnOutcome::Connect { host, residual });
    }

    req.set_super_proxy((shared.proxy_selector)(req.raw_uri()));
    let writer = BufferedWriter::new(
        write_half,
        shared.bufio_pool.acquire_write(),
        shared.config.body_stall_timeout,
    );
    let mut resp = Response::new(sniffer, shared.scratch_pool.clone());
    resp.init(writer)?;

    match shared.client.execute(&mut req, &mut resp).await {
        Ok(()) => Ok(ConnOutcome::Done),
        Err(error) => {
            // Only answer when nothing has reached the client; after that
            // the framing position is unknowable and the socket is dropped.
            if resp.bytes_forwarded() == 0 {
                if let Some(mut writer) = resp.take_writer() {
                    let envelope = error_envelope(502, "upstream exchange failed\n");
                    let _ = writer.write_all(envelope.as_bytes()).await;
                    let _ = writer.flush().await;
                }
            }
            Err(error)
        }
    }
}

/// S4: splice both directions until each side closes. A clean EOF in one
/// direction leaves the other running; a read error cancels both.
async fn tunnel_connect(
    shared: &Arc<Shared>,
    mut stream: TcpStream,
    residual: BytesMut,
    host: String,
) -> Result<(), ProxyError> {
    let mut upstream = match dial(&host, shared.config.connect_timeout).await {
        Ok(upstream) => upstream,
        Err(error) => {
            let _ = stream.write_all(b"HTTP/1.1 501 Bad Gateway\r\n\r\n").await;
            return Err(error.into());
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
        .await
        .map_err(TransportError::WriteFailed)?;

    if !residual.is_empty() {
        upstream
            .write_all(&residual)
            .await
            .map_err(TransportError::WriteFailed)?;
    }

    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((from_client, from_origin)) => {
            tracing::debug!(%host, from_client, from_origin, "tunnel closed");
            Ok(())
        }
        Err(error) => Err(TransportError::from_read(error).into()),
    }
}

fn is_temporary_accept_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

fn status_reason(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        501 => "Bad Gateway",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// The synthesized error envelope shared by the 400/502/503 paths.
pub(crate) fn error_envelope(code: u16, message: &str) -> String {
    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    format!(
        "HTTP/1.1 {code} {reason}\r\nConnection: close\r\nDate: {date}\r\nContent-Type: text/plain\r\nContent-Length: {length}\r\n\r\n{message}",
        reason = status_reason(code),
        length = message.len(),
    )
}

async fn write_fast_error<W: AsyncWrite + Unpin>(
    sink: &mut W,
    code: u16,
    message: &str,
) -> std::io::Result<()> {
    sink.write_all(error_envelope(code, message).as_bytes())
        .await?;
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_close_date_and_exact_length() {
        let envelope = error_envelope(400, NON_PROXY_RESPONSE);
        assert!(envelope.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(envelope.contains("Connection: close\r\n"));
        assert!(envelope.contains("Date: "));
        assert!(envelope.contains("GMT\r\n"));
        assert!(envelope.contains(&format!("Content-Length: {}\r\n", NON_PROXY_RESPONSE.len())));
        assert!(envelope.ends_with(NON_PROXY_RESPONSE));
    }

    #[test]
    fn temporary_accept_errors_are_classified() {
        assert!(is_temporary_accept_error(&std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "aborted"
        )));
        assert!(!is_temporary_accept_error(&std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied"
        )));
    }
}
