use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// Object-safe byte stream for upgraded transports.
pub trait SecureIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SecureIo for T {}

/// Installs the actual secure transport after a positive negotiation.
///
/// The transport library itself is external; the supervisor only cares that
/// an upgrader turns the raw stream into another byte stream.
pub trait TlsUpgrader: Send + Sync + 'static {
    fn upgrade(
        &self,
        stream: ClientStream,
    ) -> Pin<Box<dyn std::future::Future<Output = io::Result<ClientStream>> + Send>>;
}

/// A raw accepted connection, over any of the bound endpoint kinds.
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Secure(Box<dyn SecureIo>),
}

impl ClientStream {
    /// Attempt a single non-blocking write, for best-effort one-shot
    /// replies. Never retries and never blocks; on a secure transport the
    /// reply is silently skipped.
    pub fn try_write_oneshot(&self, buf: &[u8]) -> bool {
        match self {
            ClientStream::Tcp(s) => s.try_write(buf).is_ok(),
            ClientStream::Unix(s) => s.try_write(buf).is_ok(),
            ClientStream::Secure(_) => false,
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Secure(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Secure(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Unix(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Secure(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Secure(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
