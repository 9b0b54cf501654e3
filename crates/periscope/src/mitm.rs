use std::sync::Arc;

use bytes::BytesMut;
use periscope_http::{BufferedReader, BufferedWriter, Sniffer};
use periscope_tls::SniResolver;
use rustls::server::ResolvesServerCert;
use rustls::ServerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::errors::{ProxyError, TlsError, TransportError};
use crate::request::Request;
use crate::response::Response;
use crate::server::Shared;
use crate::stream::PrefixedStream;
use crate::superproxy::split_host_port;

/// Terminate an intercepted CONNECT: mint a leaf for the requested
/// authority, acknowledge the tunnel, TLS-accept the client (minting again
/// for the SNI name if it differs), then run the plaintext exchange through
/// the client engine with the authority injected and the upstream leg
/// re-encrypted.
pub(crate) async fn decrypt_connect(
    shared: &Arc<Shared>,
    sniffer: Arc<dyn Sniffer>,
    mut stream: TcpStream,
    residual: BytesMut,
    host_with_port: String,
) -> Result<(), ProxyError> {
    let (host, _) = split_host_port(&host_with_port)
        .map_err(|detail| ProxyError::Init(format!("bad CONNECT authority: {detail}")))?;

    // Mint before acknowledging, so a signing failure can still be answered.
    if let Err(error) = shared.cert_store.certified_key_for_host(host) {
        let _ = stream.write_all(b"HTTP/1.1 501 Bad Gateway\r\n\r\n").await;
        return Err(TlsError::CertSignFailed(error).into());
    }

    stream
        .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
        .await
        .map_err(TransportError::WriteFailed)?;

    let resolver = Arc::new(SniResolver::new(Arc::clone(&shared.cert_store)));
    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::clone(&resolver) as Arc<dyn ResolvesServerCert>);
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let accept = acceptor.accept(PrefixedStream::new(residual, stream));
    let tls_stream = match tokio::time::timeout(shared.config.connect_timeout, accept).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(error)) => {
            // The 200 is already on the wire; the client only sees the
            // connection drop.
            return Err(if resolver.server_name().is_none() {
                TlsError::NoSni.into()
            } else {
                TlsError::HandshakeFailed(error).into()
            });
        }
        Err(_) => {
            return Err(TlsError::HandshakeFailed(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "client TLS handshake timed out",
            ))
            .into())
        }
    };
    let server_name = resolver
        .server_name()
        .ok_or(ProxyError::Tls(TlsError::NoSni))?;

    let (read_half, write_half) = tokio::io::split(tls_stream);
    let reader = BufferedReader::new(
        read_half,
        shared.bufio_pool.acquire_read(),
        shared.config.idle_timeout,
    );
    let mut req = Request::new(Arc::clone(&sniffer), shared.scratch_pool.clone());
    req.init_tls(
        reader,
        &host_with_port,
        &server_name,
        shared.config.max_header_bytes,
    )
    .await?;
    req.set_super_proxy((shared.proxy_selector)(req.raw_uri()));

    let writer = BufferedWriter::new(
        write_half,
        shared.bufio_pool.acquire_write(),
        shared.config.body_stall_timeout,
    );
    let mut resp = Response::new(sniffer, shared.scratch_pool.clone());
    resp.init(writer)?;

    shared.client.execute(&mut req, &mut resp).await
}
