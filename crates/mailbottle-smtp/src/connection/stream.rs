//! Low-level SMTP stream handling.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::error::{Error, Result};

/// Client stream, plain or TLS.
#[derive(Debug)]
pub enum SmtpStream<S> {
    /// Plain connection.
    Plain(S),
    /// TLS-encrypted connection.
    Tls(Box<TlsStream<S>>),
}

impl<S> SmtpStream<S> {
    /// Returns true once STARTTLS has completed.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpStream<S> {
    /// Runs the server side of a TLS handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already encrypted or the handshake
    /// fails.
    pub async fn upgrade_to_tls(self, acceptor: &TlsAcceptor) -> Result<Self> {
        let stream = match self {
            Self::Plain(stream) => stream,
            Self::Tls(_) => return Err(Error::Protocol("Already using TLS".into())),
        };

        let tls_stream = acceptor.accept(stream).await?;
        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SmtpStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SmtpStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
