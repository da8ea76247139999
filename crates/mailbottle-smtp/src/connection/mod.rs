//! SMTP connection management.

mod stream;
mod tls;

pub use stream::SmtpStream;
pub use tls::load_tls;

use mailbottle::framed;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::Result;
use crate::types::Reply;

/// One client connection: a buffered line reader over a plain or TLS stream.
#[derive(Debug)]
pub struct SmtpConnection<S> {
    reader: BufReader<SmtpStream<S>>,
    max_line_length: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpConnection<S> {
    /// Wraps a freshly accepted stream.
    pub fn new(stream: S, max_line_length: usize) -> Self {
        Self::from_stream(SmtpStream::Plain(stream), max_line_length)
    }

    fn from_stream(stream: SmtpStream<S>, max_line_length: usize) -> Self {
        Self {
            reader: BufReader::new(stream),
            max_line_length,
        }
    }

    /// Returns true once STARTTLS has completed.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.reader.get_ref().is_tls()
    }

    /// Reads one command line. `None` means the client hung up.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the line is too long.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        Ok(framed::read_line(&mut self.reader, self.max_line_length).await?)
    }

    /// Sends a reply and flushes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send(&mut self, reply: &Reply) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(reply.to_wire().as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// The buffered reader, for streaming a message body.
    pub const fn reader(&mut self) -> &mut BufReader<SmtpStream<S>> {
        &mut self.reader
    }

    /// Upgrades to TLS.
    ///
    /// Anything the client sent after STARTTLS and before the handshake is
    /// dropped with the read buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> Result<Self> {
        let buffered = self.reader.buffer().len();
        if buffered > 0 {
            debug!(bytes = buffered, "discarding plaintext sent before TLS handshake");
        }

        let stream = self.reader.into_inner().upgrade_to_tls(acceptor).await?;
        Ok(Self::from_stream(stream, self.max_line_length))
    }

    /// Shuts down the write side.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.reader.get_mut().shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;
    use crate::types::ReplyCode;

    #[tokio::test]
    async fn test_lines_and_replies() {
        let mock = Builder::new()
            .read(b"HELO a\r\nQUIT\n")
            .write(b"250 OK\r\n")
            .build();
        let mut conn = SmtpConnection::new(mock, 512);

        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("HELO a"));
        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("QUIT"));
        conn.send(&Reply::single(ReplyCode::OK, "OK")).await.unwrap();
        assert!(conn.read_line().await.unwrap().is_none());
        assert!(!conn.is_tls());
    }

    #[tokio::test]
    async fn test_overlong_line() {
        let mock = Builder::new().read(b"HELO aaaaaaaaaaaaaaaaaaaa\r\n").build();
        let mut conn = SmtpConnection::new(mock, 8);
        assert!(conn.read_line().await.is_err());
    }
}
