use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::errors::{ProxyError, TransportError, TunnelError};
use crate::stream::TunnelStream;

/// Cap on a super-proxy's CONNECT response head.
const CONNECT_RESPONSE_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperProxyKind {
    Http,
    Https,
    Socks5,
}

/// An upstream proxy this proxy chains through. Immutable once built and
/// shared by reference across all workers; the `Proxy-Authorization` line is
/// pre-computed at construction.
pub struct SuperProxy {
    kind: SuperProxyKind,
    host: String,
    host_with_port: String,
    auth_line: String,
    socks_auth: Option<(String, String)>,
    tls_config: Arc<ClientConfig>,
    tls_server_name: String,
}

impl SuperProxy {
    pub fn new(
        kind: SuperProxyKind,
        host: &str,
        port: u16,
        user: &str,
        pass: &str,
    ) -> Result<Self, ProxyError> {
        if host.is_empty() {
            return Err(ProxyError::Init("super-proxy host is empty".to_string()));
        }
        if port == 0 {
            return Err(ProxyError::Init("super-proxy port is zero".to_string()));
        }

        let auth_line = if !user.is_empty() && !pass.is_empty() {
            let credentials = BASE64_STANDARD.encode(format!("{user}:{pass}"));
            format!("Proxy-Authorization: Basic {credentials}\r\n")
        } else {
            String::new()
        };
        let socks_auth = (kind == SuperProxyKind::Socks5 && !user.is_empty())
            .then(|| (user.to_string(), pass.to_string()));

        Ok(Self {
            kind,
            host: host.to_string(),
            host_with_port: format!("{host}:{port}"),
            auth_line,
            socks_auth,
            tls_config: periscope_tls::upstream_client_config(true),
            tls_server_name: host.to_string(),
        })
    }

    /// Server name presented when the super-proxy itself is TLS-wrapped.
    pub fn set_tls_server_name(&mut self, name: &str) {
        self.tls_server_name = name.to_string();
    }

    pub fn set_tls_config(&mut self, config: Arc<ClientConfig>) {
        self.tls_config = config;
    }

    pub fn kind(&self) -> SuperProxyKind {
        self.kind
    }

    pub fn host_with_port(&self) -> &str {
        &self.host_with_port
    }

    pub(crate) fn auth_line(&self) -> &str {
        &self.auth_line
    }

    /// Open a byte tunnel to `target` (`host:port`) through this proxy. The
    /// returned stream is ready for the caller's request bytes.
    pub async fn make_tunnel(
        &self,
        target: &str,
        connect_timeout: Duration,
    ) -> Result<TunnelStream, TunnelError> {
        let exchange = async {
            let tcp = dial(&self.host_with_port, connect_timeout).await?;
            match self.kind {
                SuperProxyKind::Socks5 => {
                    let mut tcp = tcp;
                    self.socks5_connect(&mut tcp, target).await?;
                    Ok(TunnelStream::Plain { stream: tcp })
                }
                SuperProxyKind::Http => {
                    let mut stream = TunnelStream::Plain { stream: tcp };
                    self.http_connect(&mut stream, target).await?;
                    Ok(stream)
                }
                SuperProxyKind::Https => {
                    let name = ServerName::try_from(self.tls_server_name.clone())
                        .map_err(|_| {
                            TunnelError::BadResponse(format!(
                                "invalid super-proxy TLS server name {:?}",
                                self.tls_server_name
                            ))
                        })?;
                    let connector = TlsConnector::from(Arc::clone(&self.tls_config));
                    let tls = connector.connect(name, tcp).await.map_err(|error| {
                        TunnelError::Transport(TransportError::DialFailed {
                            target: self.host_with_port.clone(),
                            source: error,
                        })
                    })?;
                    let mut stream = TunnelStream::Tls { stream: tls };
                    self.http_connect(&mut stream, target).await?;
                    Ok(stream)
                }
            }
        };
        match tokio::time::timeout(connect_timeout.saturating_mul(2), exchange).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Transport(TransportError::DialFailed {
                target: target.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "super-proxy tunnel establishment timed out",
                ),
            })),
        }
    }

    async fn http_connect<S>(&self, stream: &mut S, target: &str) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n{}\r\n",
            self.auth_line
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(TransportError::WriteFailed)?;
        stream.flush().await.map_err(TransportError::WriteFailed)?;

        // Byte-wise read so nothing past the response head is consumed;
        // bytes after it belong to the tunnel.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0_u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let read = stream
                .read(&mut byte)
                .await
                .map_err(TransportError::from_read)?;
            if read == 0 {
                return Err(TunnelError::BadResponse(
                    "super-proxy closed before CONNECT response completed".to_string(),
                ));
            }
            head.push(byte[0]);
            if head.len() > CONNECT_RESPONSE_LIMIT {
                return Err(TunnelError::BadResponse(
                    "CONNECT response head exceeded limit".to_string(),
                ));
            }
        }

        let status_line = head
            .split(|&b| b == b'\n')
            .next()
            .unwrap_or_default();
        let text = std::str::from_utf8(status_line).map_err(|_| {
            TunnelError::BadResponse("CONNECT status line is not UTF-8".to_string())
        })?;
        let code = text
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| {
                TunnelError::BadResponse(format!("unparseable CONNECT status line {text:?}"))
            })?;
        match code {
            200..=299 => Ok(()),
            407 => Err(TunnelError::AuthRequired),
            other => Err(TunnelError::BadResponse(format!(
                "CONNECT rejected with status {other}"
            ))),
        }
    }

    async fn socks5_connect(&self, tcp: &mut TcpStream, target: &str) -> Result<(), TunnelError> {
        let (host, port) = split_host_port(target)
            .map_err(|detail| TunnelError::BadResponse(detail.to_string()))?;

        let method: u8 = if self.socks_auth.is_some() { 0x02 } else { 0x00 };
        tcp.write_all(&[0x05, 0x01, method])
            .await
            .map_err(TransportError::WriteFailed)?;

        let mut choice = [0_u8; 2];
        tcp.read_exact(&mut choice)
            .await
            .map_err(TransportError::from_read)?;
        if choice[0] != 0x05 {
            return Err(TunnelError::BadResponse(format!(
                "unexpected SOCKS version {}",
                choice[0]
            )));
        }
        match choice[1] {
            0x00 => {}
            0x02 => {
                let (user, pass) = self.socks_auth.as_ref().ok_or(TunnelError::AuthRequired)?;
                let mut negotiation = Vec::with_capacity(3 + user.len() + pass.len());
                negotiation.push(0x01);
                negotiation.push(user.len() as u8);
                negotiation.extend_from_slice(user.as_bytes());
                negotiation.push(pass.len() as u8);
                negotiation.extend_from_slice(pass.as_bytes());
                tcp.write_all(&negotiation)
                    .await
                    .map_err(TransportError::WriteFailed)?;

                let mut status = [0_u8; 2];
                tcp.read_exact(&mut status)
                    .await
                    .map_err(TransportError::from_read)?;
                if status[1] != 0x00 {
                    return Err(TunnelError::AuthRequired);
                }
            }
            0xFF => return Err(TunnelError::AuthRequired),
            other => {
                return Err(TunnelError::BadResponse(format!(
                    "unsupported SOCKS auth method {other}"
                )))
            }
        }

        let mut request = vec![0x05, 0x01, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                request.push(0x01);
                request.extend_from_slice(&v4.octets());
            }
            Ok(IpAddr::V6(v6)) => {
                request.push(0x04);
                request.extend_from_slice(&v6.octets());
            }
            Err(_) => {
                if host.len() > 255 {
                    return Err(TunnelError::BadResponse(
                        "SOCKS5 target domain exceeds 255 bytes".to_string(),
                    ));
                }
                request.push(0x03);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        tcp.write_all(&request)
            .await
            .map_err(TransportError::WriteFailed)?;

        let mut reply = [0_u8; 4];
        tcp.read_exact(&mut reply)
            .await
            .map_err(TransportError::from_read)?;
        if reply[0] != 0x05 {
            return Err(TunnelError::BadResponse(format!(
                "unexpected SOCKS version {} in reply",
                reply[0]
            )));
        }
        if reply[1] != 0x00 {
            return Err(TunnelError::SocksReply(reply[1]));
        }

        // Drain the bind address so tunnel bytes start clean.
        let bind_len = match reply[3] {
            0x01 => 4 + 2,
            0x04 => 16 + 2,
            0x03 => {
                let mut len = [0_u8; 1];
                tcp.read_exact(&mut len)
                    .await
                    .map_err(TransportError::from_read)?;
                len[0] as usize + 2
            }
            other => {
                return Err(TunnelError::BadResponse(format!(
                    "unsupported bind address type {other}"
                )))
            }
        };
        let mut bind = vec![0_u8; bind_len];
        tcp.read_exact(&mut bind)
            .await
            .map_err(TransportError::from_read)?;
        Ok(())
    }
}

/// TCP dial with a deadline, mapped into the transport taxonomy.
pub(crate) async fn dial(target: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(TransportError::DialFailed {
            target: target.to_string(),
            source: error,
        }),
        Err(_) => Err(TransportError::DialFailed {
            target: target.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// Split `host:port`, tolerating bracketed IPv6 literals. The returned host
/// has its brackets stripped.
pub(crate) fn split_host_port(target: &str) -> Result<(&str, u16), &'static str> {
    if let Some(rest) = target.strip_prefix('[') {
        let close = rest.find(']').ok_or("unterminated IPv6 literal")?;
        let host = &rest[..close];
        let port = rest[close + 1..]
            .strip_prefix(':')
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or("missing port after IPv6 literal")?;
        return Ok((host, port));
    }
    let idx = target.rfind(':').ok_or("missing port")?;
    let port = target[idx + 1..]
        .parse::<u16>()
        .map_err(|_| "invalid port")?;
    Ok((&target[..idx], port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_line_is_precomputed_base64() {
        let proxy =
            SuperProxy::new(SuperProxyKind::Http, "upstream.test", 3128, "user", "pass")
                .expect("super proxy");
        assert_eq!(
            proxy.auth_line(),
            "Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"
        );
        assert_eq!(proxy.host_with_port(), "upstream.test:3128");
    }

    #[test]
    fn missing_credentials_leave_auth_empty() {
        let proxy = SuperProxy::new(SuperProxyKind::Http, "upstream.test", 3128, "", "")
            .expect("super proxy");
        assert!(proxy.auth_line().is_empty());
    }

    #[test]
    fn empty_host_and_zero_port_are_rejected() {
        assert!(SuperProxy::new(SuperProxyKind::Http, "", 3128, "", "").is_err());
        assert!(SuperProxy::new(SuperProxyKind::Http, "upstream.test", 0, "", "").is_err());
    }

    #[test]
    fn split_host_port_handles_names_and_ipv6() {
        assert_eq!(
            split_host_port("example.test:443").expect("name"),
            ("example.test", 443)
        );
        assert_eq!(split_host_port("[::1]:8443").expect("v6"), ("::1", 8443));
        assert!(split_host_port("example.test").is_err());
    }
}
