use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use periscope::{NopSnifferPool, ProxyBuilder, ProxyConfig, ProxyHandle};

const ORIGIN_NAME: &str = "origin.test";

fn mitm_config() -> ProxyConfig {
    ProxyConfig {
        idle_timeout: Duration::from_secs(20),
        body_stall_timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(5),
        // The test origin presents a self-signed certificate.
        verify_upstream_tls: false,
        ..ProxyConfig::default()
    }
}

async fn start_decrypting_proxy() -> (SocketAddr, ProxyHandle, String) {
    let server = ProxyBuilder::new(mitm_config())
        .with_sniffer_pool(Arc::new(NopSnifferPool::new()))
        .with_decrypt_policy(|_| true)
        .build()
        .expect("build proxy");
    let ca_pem = server.ca_cert_pem();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    (addr, server.start(listener), ca_pem)
}

/// TLS origin for `origin.test` with a self-signed certificate. Answers one
/// request and returns the head it saw.
fn spawn_tls_origin() -> (JoinHandle<Vec<u8>>, SocketAddr) {
    let key = KeyPair::generate().expect("origin key");
    let params =
        CertificateParams::new(vec![ORIGIN_NAME.to_string()]).expect("origin cert params");
    let cert = params.self_signed(&key).expect("origin cert");
    let chain = vec![cert.der().clone()];
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key_der)
        .expect("origin tls config");
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind origin");
    listener.set_nonblocking(true).expect("nonblocking origin");
    let addr = listener.local_addr().expect("origin addr");

    let task = tokio::spawn(async move {
        let listener = TcpListener::from_std(listener).expect("tokio origin listener");
        let (tcp, _) = listener.accept().await.expect("origin accept");
        let mut stream = acceptor.accept(tcp).await.expect("origin tls accept");

        let mut head = Vec::new();
        let mut byte = [0_u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let read = stream.read(&mut byte).await.expect("origin read");
            if read == 0 {
                break;
            }
            head.push(byte[0]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret")
            .await
            .expect("origin write");
        stream.flush().await.expect("origin flush");
        head
    });
    (task, addr)
}

fn client_config_trusting(ca_pem: &str) -> Arc<ClientConfig> {
    let ca_der = CertificateDer::from_pem_slice(ca_pem.as_bytes()).expect("parse proxy CA");
    let mut roots = RootCertStore::empty();
    roots.add(ca_der).expect("trust proxy CA");
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intercepted_connect_decrypts_and_relays() {
    let (origin, origin_addr) = spawn_tls_origin();
    let (proxy_addr, handle, ca_pem) = start_decrypting_proxy().await;

    let mut tcp = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let connect = format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
    tcp.write_all(connect.as_bytes()).await.expect("send connect");

    let mut ack = [0_u8; 19];
    tcp.read_exact(&mut ack).await.expect("read connect ack");
    assert_eq!(&ack, b"HTTP/1.1 200 OK\r\n\r\n");

    // The TLS handshake verifies that the proxy presents a leaf for the
    // SNI name, chained to its CA.
    let connector = TlsConnector::from(client_config_trusting(&ca_pem));
    let server_name = ServerName::try_from(ORIGIN_NAME).expect("server name");
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .expect("client handshake against forged leaf");

    tls.write_all(
        format!("GET /secret HTTP/1.1\r\nHost: {ORIGIN_NAME}\r\n\r\n").as_bytes(),
    )
    .await
    .expect("send intercepted request");

    let mut answer = [0_u8; 44];
    tls.read_exact(&mut answer).await.expect("read intercepted response");
    assert_eq!(&answer[..], b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret");

    let origin_head = origin.await.expect("origin task");
    let origin_text = String::from_utf8(origin_head).expect("utf8 origin head");
    assert!(
        origin_text.starts_with("GET /secret HTTP/1.1\r\n"),
        "origin must see the origin-form request: {origin_text}"
    );

    handle.shutdown(Duration::from_secs(5)).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_sni_aborts_the_intercepted_handshake() {
    let (proxy_addr, handle, _ca_pem) = start_decrypting_proxy().await;

    let mut tcp = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    tcp.write_all(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n")
        .await
        .expect("send connect");
    let mut ack = [0_u8; 19];
    tcp.read_exact(&mut ack).await.expect("read connect ack");

    // rustls omits SNI for IP-address server names; the proxy declines to
    // resolve a certificate and the handshake dies.
    let connector = TlsConnector::from(periscope_tls::upstream_client_config(false));
    let server_name = ServerName::try_from("127.0.0.1").expect("ip server name");
    let result = connector.connect(server_name, tcp).await;
    assert!(result.is_err(), "handshake without SNI must fail");

    handle.shutdown(Duration::from_secs(5)).await.expect("shutdown");
}
