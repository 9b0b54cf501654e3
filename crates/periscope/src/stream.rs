use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project_lite::pin_project! {
    /// The socket reaching a target host: either a direct TCP connection or
    /// a TLS-wrapped connection to a super-proxy carrying a tunnel.
    #[project = TunnelStreamProj]
    pub enum TunnelStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStream::Plain { .. } => f.debug_struct("TunnelStream::Plain").finish(),
            TunnelStream::Tls { .. } => f.debug_struct("TunnelStream::Tls").finish(),
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TunnelStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            TunnelStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TunnelStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            TunnelStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TunnelStreamProj::Plain { stream } => stream.poll_flush(cx),
            TunnelStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TunnelStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            TunnelStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

pin_project_lite::pin_project! {
    /// The upstream leg as the client engine sees it: the tunnel stream
    /// itself, or a TLS session running over it for intercepted HTTPS.
    #[project = UpstreamStreamProj]
    pub enum UpstreamStream {
        Plain { #[pin] stream: TunnelStream },
        Tls { #[pin] stream: TlsStream<TunnelStream> },
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            UpstreamStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            UpstreamStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            UpstreamStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            UpstreamStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            UpstreamStreamProj::Plain { stream } => stream.poll_flush(cx),
            UpstreamStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            UpstreamStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            UpstreamStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

pin_project_lite::pin_project! {
    /// A stream with a replayed prefix: bytes that were read past the
    /// CONNECT head get served before the inner stream. Lets the MITM
    /// TLS accept see an eagerly-sent ClientHello.
    pub struct PrefixedStream<S> {
        prefix: BytesMut,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: BytesMut, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let take = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..take]);
            let _ = this.prefix.split_to(take);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::PrefixedStream;
    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn prefix_is_served_before_inner_bytes() {
        let inner: &[u8] = b" world";
        let mut stream = PrefixedStream::new(BytesMut::from(&b"hello"[..]), inner);
        let mut read = Vec::new();
        stream.read_to_end(&mut read).await.expect("read");
        assert_eq!(read, b"hello world");
    }
}
